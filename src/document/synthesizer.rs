//! Descriptor list to document

use super::{build_groups, ConfigDocument, DocumentSettings, NameConfig, ProxyEntry, OWNED_KEYS};
use crate::descriptor::ProxyDescriptor;
use crate::{Error, Result};
use chrono::Local;
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;
use tracing::debug;

/// Give every wanted name a unique final name.
///
/// The first occurrence keeps its name; later ones get `"{name}-{n}"` with
/// the smallest `n >= 2` that is not taken yet. `reserved` names count as
/// taken from the start.
pub fn assign_unique_names<'a, W, R>(wanted: W, reserved: R) -> Vec<String>
where
    W: IntoIterator<Item = &'a str>,
    R: IntoIterator<Item = &'a str>,
{
    let mut taken: HashSet<String> = reserved.into_iter().map(String::from).collect();

    wanted
        .into_iter()
        .map(|name| {
            if taken.insert(name.to_string()) {
                return name.to_string();
            }
            let mut n = 2u32;
            loop {
                let candidate = format!("{}-{}", name, n);
                if taken.insert(candidate.clone()) {
                    debug!("Renamed duplicate proxy {} to {}", name, candidate);
                    return candidate;
                }
                n += 1;
            }
        })
        .collect()
}

/// Builds client documents from parsed descriptors
#[derive(Debug, Clone, Default)]
pub struct Synthesizer {
    settings: DocumentSettings,
}

impl Synthesizer {
    pub fn new(settings: DocumentSettings) -> Self {
        Synthesizer { settings }
    }

    /// Replace the naming overrides, e.g. with ones sent along a request.
    pub fn with_naming(mut self, naming: NameConfig) -> Self {
        self.settings.naming = naming;
        self
    }

    pub fn settings(&self) -> &DocumentSettings {
        &self.settings
    }

    /// Build a fresh document for `descriptors`.
    pub fn synthesize(&self, descriptors: &[ProxyDescriptor]) -> Result<ConfigDocument> {
        self.fill(ConfigDocument::from_settings(&self.settings), descriptors)
    }

    /// Build a document on top of a template mapping.
    ///
    /// Template keys override the configured scalars and rules. Any
    /// `proxies`, `proxy-groups` or `proxy_groups` in the template are
    /// dropped and replaced, never merged.
    pub fn install(&self, template: &Mapping, descriptors: &[ProxyDescriptor]) -> Result<ConfigDocument> {
        let mut merged = match serde_yaml::to_value(ConfigDocument::from_settings(&self.settings))? {
            Value::Mapping(m) => m,
            _ => Mapping::new(),
        };

        for (key, value) in template {
            if key.as_str().map_or(false, |k| OWNED_KEYS.contains(&k)) {
                debug!("Dropping template key {:?}", key);
                continue;
            }
            merged.insert(key.clone(), value.clone());
        }

        let base: ConfigDocument = serde_yaml::from_value(Value::Mapping(merged))?;
        self.fill(base, descriptors)
    }

    /// [`Synthesizer::install`] with the template given as YAML text
    pub fn install_yaml(&self, template: &str, descriptors: &[ProxyDescriptor]) -> Result<ConfigDocument> {
        if template.trim().is_empty() {
            return self.install(&Mapping::new(), descriptors);
        }
        let template = match serde_yaml::from_str::<Value>(template)? {
            Value::Mapping(m) => m,
            Value::Null => Mapping::new(),
            _ => return Err(Error::config("document template must be a YAML mapping")),
        };
        self.install(&template, descriptors)
    }

    fn fill(&self, mut doc: ConfigDocument, descriptors: &[ProxyDescriptor]) -> Result<ConfigDocument> {
        let groups = &self.settings.groups;
        let today = Local::now().date_naive();
        let wanted: Vec<String> = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| self.settings.naming.apply(i, d.name(), today))
            .collect();
        let names = assign_unique_names(wanted.iter().map(String::as_str), groups.reserved());

        doc.proxies = descriptors
            .iter()
            .zip(&names)
            .map(|(d, name)| ProxyEntry {
                name: name.clone(),
                ..ProxyEntry::from(d)
            })
            .collect();
        doc.proxy_groups = build_groups(groups, &self.settings.group_probe, &names);

        // Rules are user input; a dangling target is a config error.
        if let Some(rule) = doc.unresolved_rule() {
            return Err(Error::config(format!(
                "rule {} does not target a proxy or group of this document",
                rule
            )));
        }
        doc.validate()?;
        debug!(
            "Synthesized document with {} proxies and {} groups",
            doc.proxies.len(),
            doc.proxy_groups.len()
        );
        Ok(doc)
    }
}
