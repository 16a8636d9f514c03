//! Display-name overrides applied before collision handling

use crate::{Error, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// How proxies are renamed in generated documents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NameConfig {
    /// Names by descriptor position; blank or missing entries fall through
    pub custom_names: Vec<String>,

    /// Name proxies `{base-name}{nnn}`, counting from 001
    pub sequential: bool,

    pub base_name: Option<String>,

    /// Append the local date as `YYYYMMDD`
    pub add_timestamp: bool,
}

impl NameConfig {
    /// Name for the descriptor at `index` whose derived name is `derived`.
    ///
    /// A custom name wins over a sequential one; the date suffix goes on
    /// whichever is chosen.
    pub fn apply(&self, index: usize, derived: &str, today: NaiveDate) -> String {
        let custom = self
            .custom_names
            .get(index)
            .map(|n| n.trim())
            .filter(|n| !n.is_empty());

        let mut name = match (custom, self.sequential_base()) {
            (Some(custom), _) => custom.to_string(),
            (None, Some(base)) => format!("{}{:03}", base, index + 1),
            (None, None) => derived.to_string(),
        };

        if self.add_timestamp {
            name.push_str(&today.format("%Y%m%d").to_string());
        }
        name
    }

    fn sequential_base(&self) -> Option<&str> {
        if !self.sequential {
            return None;
        }
        self.base_name.as_deref().filter(|b| !b.trim().is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sequential && self.sequential_base().is_none() {
            return Err(Error::config("sequential naming needs a base-name"));
        }
        Ok(())
    }
}
