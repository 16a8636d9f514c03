//! Configuration module

use crate::descriptor::{NameStyle, ParseMode, Parser, DEFAULT_FINGERPRINT};
use crate::document::{DocumentSettings, Synthesizer};
use crate::model::{Subscription, DEFAULT_NODE_LIMIT};
use crate::probe::{
    HealthChecker, DEFAULT_PROBE_CONCURRENCY, DEFAULT_PROBE_INTERVAL, DEFAULT_PROBE_TIMEOUT,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use uuid::Uuid;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level used when `RUST_LOG` is not set
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Descriptor parsing
    pub parser: ParserConfig,

    /// Scalars, rules and group names of generated documents
    pub document: DocumentSettings,

    /// Health checks
    pub probe: ProbeConfig,

    /// Subscription defaults
    pub subscription: SubscriptionConfig,
}

impl Config {
    /// Load configuration from file (synchronous)
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = if content.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.parser.validate()?;
        self.document.validate()?;
        self.probe.validate()?;
        self.subscription.validate()?;
        Ok(())
    }

    pub fn parser(&self) -> Parser {
        Parser::new()
            .with_name_style(self.parser.name_style)
            .with_fingerprint(self.parser.fingerprint.clone())
    }

    pub fn synthesizer(&self) -> Synthesizer {
        Synthesizer::new(self.document.clone())
    }

    /// New subscription with the configured node limit
    pub fn new_subscription(&self, user_id: Uuid, name: impl Into<String>) -> Result<Subscription> {
        Subscription::new(user_id, name, self.subscription.max_nodes)
    }

    pub fn health_checker(&self) -> HealthChecker {
        HealthChecker::new(
            self.probe.timeout(),
            self.probe.concurrency,
            self.probe.interval(),
        )
    }
}

/// Parser settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ParserConfig {
    /// Batch error policy
    pub mode: ParseMode,

    /// How display names are derived
    pub name_style: NameStyle,

    /// Client fingerprint for VLESS descriptors without `fp`
    pub fingerprint: String,
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig {
            mode: ParseMode::Strict,
            name_style: NameStyle::Kind,
            fingerprint: DEFAULT_FINGERPRINT.to_string(),
        }
    }
}

impl ParserConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fingerprint.trim().is_empty() {
            return Err(Error::config("parser fingerprint cannot be empty"));
        }
        Ok(())
    }
}

/// Health check settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProbeConfig {
    /// Per-probe timeout in milliseconds
    pub timeout_ms: u64,

    /// Probes in flight at once
    pub concurrency: usize,

    /// Background check period in seconds; 0 disables the loop
    pub interval_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            timeout_ms: DEFAULT_PROBE_TIMEOUT.as_millis() as u64,
            concurrency: DEFAULT_PROBE_CONCURRENCY,
            interval_secs: DEFAULT_PROBE_INTERVAL.as_secs(),
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::config("probe timeout-ms cannot be 0"));
        }
        if self.concurrency == 0 {
            return Err(Error::config("probe concurrency cannot be 0"));
        }
        Ok(())
    }
}

/// Subscription defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SubscriptionConfig {
    /// Node limit given to new subscriptions
    pub max_nodes: u32,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        SubscriptionConfig {
            max_nodes: DEFAULT_NODE_LIMIT,
        }
    }
}

impl SubscriptionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=1000).contains(&self.max_nodes) {
            return Err(Error::config(format!(
                "subscription max-nodes must be 1-1000, got {}",
                self.max_nodes
            )));
        }
        Ok(())
    }
}
