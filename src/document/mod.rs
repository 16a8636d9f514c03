//! Client configuration document
//!
//! The Clash/mihomo YAML shape handed to subscribers. Field names and the
//! replace-not-merge handling of `proxy-groups` are what third-party clients
//! expect, so they are fixed here rather than configurable.

mod groups;
mod naming;
mod synthesizer;

pub use groups::{
    build_groups, GroupNames, GroupProbe, GroupType, ProxyGroup, DEFAULT_TEST_INTERVAL,
    DEFAULT_TEST_URL, DEFAULT_TOLERANCE, DIRECT, REJECT,
};
pub use naming::NameConfig;
pub use synthesizer::{assign_unique_names, Synthesizer};

use crate::descriptor::{ProxyDescriptor, ProxyKind, ProxyOptions};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use std::collections::HashSet;
use std::path::Path;
use tokio::fs;

/// Template keys that synthesis always owns
pub(crate) const OWNED_KEYS: [&str; 3] = ["proxies", "proxy-groups", "proxy_groups"];

/// Top-level scalars and rules of synthesized documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DocumentSettings {
    pub port: u16,
    pub socks_port: u16,
    pub allow_lan: bool,
    pub mode: String,
    pub log_level: String,
    pub external_controller: Option<String>,
    /// Rule list; `None` uses [`GroupNames::default_rules`]
    pub rules: Option<Vec<String>>,
    pub groups: GroupNames,
    pub group_probe: GroupProbe,
    pub naming: NameConfig,
}

impl Default for DocumentSettings {
    fn default() -> Self {
        DocumentSettings {
            port: 7890,
            socks_port: 7891,
            allow_lan: true,
            mode: "rule".to_string(),
            log_level: "info".to_string(),
            external_controller: Some("127.0.0.1:9090".to_string()),
            rules: None,
            groups: GroupNames::default(),
            group_probe: GroupProbe::default(),
            naming: NameConfig::default(),
        }
    }
}

impl DocumentSettings {
    pub fn rules(&self) -> Vec<String> {
        match &self.rules {
            Some(rules) => rules.clone(),
            None => self.groups.default_rules(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 || self.socks_port == 0 {
            return Err(Error::config("document ports must be non-zero"));
        }
        if self.port == self.socks_port {
            return Err(Error::config(format!(
                "port and socks-port are both {}",
                self.port
            )));
        }
        let mut seen = HashSet::new();
        for name in self.groups.reserved() {
            if name.is_empty() {
                return Err(Error::config("group names cannot be empty"));
            }
            if !seen.insert(name) {
                return Err(Error::config(format!("duplicate group name: {}", name)));
            }
        }
        if self.group_probe.interval == 0 {
            return Err(Error::config("group probe interval cannot be 0"));
        }
        self.naming.validate()
    }
}

/// Target of a rule: its last field, ignoring a trailing `no-resolve`.
pub fn rule_target(rule: &str) -> Option<&str> {
    let mut fields: Vec<&str> = rule.split(',').map(str::trim).collect();
    if fields.last() == Some(&"no-resolve") {
        fields.pop();
    }
    if fields.len() < 2 {
        return None;
    }
    fields.last().copied().filter(|t| !t.is_empty())
}

/// Reality parameters as the client spells them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RealityOpts {
    pub public_key: String,
    pub short_id: String,
}

/// One entry of `proxies`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyEntry {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: ProxyKind,

    pub server: String,

    pub port: u16,

    #[serde(default)]
    pub udp: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servername: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_cert_verify: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality_opts: Option<RealityOpts>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_fingerprint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl From<&ProxyDescriptor> for ProxyEntry {
    fn from(d: &ProxyDescriptor) -> Self {
        let mut entry = ProxyEntry {
            name: d.name().to_string(),
            kind: d.kind(),
            server: d.server().to_string(),
            port: d.port(),
            udp: true,
            uuid: None,
            network: None,
            tls: None,
            servername: None,
            skip_cert_verify: None,
            flow: None,
            reality_opts: None,
            client_fingerprint: None,
            username: None,
            password: None,
        };

        match d.options() {
            ProxyOptions::Vless(v) => {
                entry.uuid = Some(v.uuid.to_string());
                entry.network = Some(v.network.clone());
                entry.tls = Some(true);
                entry.servername = Some(v.servername.clone());
                entry.skip_cert_verify = Some(v.skip_cert_verify);
                entry.flow = v.flow.clone();
                entry.reality_opts = v.reality.as_ref().map(|r| RealityOpts {
                    public_key: r.public_key.clone(),
                    short_id: r.short_id.clone(),
                });
                entry.client_fingerprint = Some(v.client_fingerprint.clone());
            }
            ProxyOptions::Socks5(s) => {
                entry.username = Some(s.username.clone());
                entry.password = Some(s.password.clone());
            }
        }

        entry
    }
}

/// A complete client document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigDocument {
    pub port: u16,

    pub socks_port: u16,

    #[serde(default)]
    pub allow_lan: bool,

    pub mode: String,

    pub log_level: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_controller: Option<String>,

    /// Template keys carried through untouched
    #[serde(flatten)]
    pub extra: Mapping,

    #[serde(default)]
    pub proxies: Vec<ProxyEntry>,

    #[serde(default)]
    pub proxy_groups: Vec<ProxyGroup>,

    #[serde(default)]
    pub rules: Vec<String>,
}

impl ConfigDocument {
    /// Document with settings applied and no proxies or groups yet
    pub fn from_settings(settings: &DocumentSettings) -> Self {
        ConfigDocument {
            port: settings.port,
            socks_port: settings.socks_port,
            allow_lan: settings.allow_lan,
            mode: settings.mode.clone(),
            log_level: settings.log_level.clone(),
            external_controller: settings.external_controller.clone(),
            extra: Mapping::new(),
            proxies: Vec::new(),
            proxy_groups: Vec::new(),
            rules: settings.rules(),
        }
    }

    /// Load from YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Serialize to YAML string
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Write the document to a file
    pub async fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_yaml()?).await?;
        Ok(())
    }

    pub fn proxy_names(&self) -> impl Iterator<Item = &str> {
        self.proxies.iter().map(|p| p.name.as_str())
    }

    pub fn group(&self, name: &str) -> Option<&ProxyGroup> {
        self.proxy_groups.iter().find(|g| g.name == name)
    }

    /// First rule whose target is not a proxy, a group, `DIRECT` or `REJECT`
    pub fn unresolved_rule(&self) -> Option<&str> {
        let known: HashSet<&str> = [DIRECT, REJECT]
            .into_iter()
            .chain(self.proxy_names())
            .chain(self.proxy_groups.iter().map(|g| g.name.as_str()))
            .collect();
        self.rules
            .iter()
            .map(String::as_str)
            .find(|rule| !rule_target(rule).map_or(false, |t| known.contains(t)))
    }

    /// Check internal consistency: names are unique, no group is empty,
    /// every group member and every rule target resolves.
    pub fn validate(&self) -> Result<()> {
        for key in OWNED_KEYS {
            if self.extra.contains_key(key) {
                return Err(Error::synthesis(format!("template key {} leaked into document", key)));
            }
        }

        let mut names: HashSet<&str> = [DIRECT, REJECT].into_iter().collect();
        for proxy in &self.proxies {
            if proxy.name.is_empty() {
                return Err(Error::synthesis("proxy with empty name"));
            }
            if !names.insert(proxy.name.as_str()) {
                return Err(Error::synthesis(format!("duplicate proxy name: {}", proxy.name)));
            }
        }
        for group in &self.proxy_groups {
            if !names.insert(group.name.as_str()) {
                return Err(Error::synthesis(format!("duplicate group name: {}", group.name)));
            }
        }

        for group in &self.proxy_groups {
            if group.proxies.is_empty() {
                return Err(Error::synthesis(format!("group {} is empty", group.name)));
            }
            if let Some(member) = group.proxies.iter().find(|m| !names.contains(m.as_str())) {
                return Err(Error::synthesis(format!(
                    "group {} references unknown member {}",
                    group.name, member
                )));
            }
            if group.group_type.is_tested() && (group.url.is_none() || group.interval.is_none()) {
                return Err(Error::synthesis(format!(
                    "{} group {} has no test url or interval",
                    group.group_type, group.name
                )));
            }
        }

        if let Some(rule) = self.unresolved_rule() {
            return Err(Error::synthesis(format!("rule {} has no known target", rule)));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Parser;

    fn vless() -> ProxyDescriptor {
        Parser::default()
            .parse(
                "vless://b831381d-6324-4d53-ad4f-8cda48b30811@example.com:443?type=ws&pbk=KEY&sid=ab",
                None,
            )
            .unwrap()
    }

    #[test]
    fn test_vless_entry_fields() {
        let entry = ProxyEntry::from(&vless());
        assert_eq!(entry.kind, ProxyKind::Vless);
        assert_eq!(entry.uuid.as_deref(), Some("b831381d-6324-4d53-ad4f-8cda48b30811"));
        assert_eq!(entry.network.as_deref(), Some("ws"));
        assert_eq!(entry.tls, Some(true));
        assert_eq!(entry.servername.as_deref(), Some("example.com"));
        assert_eq!(entry.flow.as_deref(), Some("xtls-rprx-vision"));
        assert!(entry.username.is_none());

        let yaml = serde_yaml::to_string(&entry).unwrap();
        assert!(yaml.contains("type: vless"));
        assert!(yaml.contains("skip-cert-verify: true"));
        assert!(yaml.contains("reality-opts:"));
        assert!(yaml.contains("public-key: KEY"));
        assert!(yaml.contains("client-fingerprint: chrome"));
    }

    #[test]
    fn test_socks5_entry_fields() {
        let d = Parser::default().parse("10.0.0.1:1080:alice:secret", None).unwrap();
        let yaml = serde_yaml::to_string(&ProxyEntry::from(&d)).unwrap();
        assert!(yaml.contains("type: socks5"));
        assert!(yaml.contains("username: alice"));
        assert!(yaml.contains("password: secret"));
        assert!(!yaml.contains("tls"));
        assert!(!yaml.contains("servername"));
        assert!(!yaml.contains("network"));
    }

    #[test]
    fn test_settings_defaults() {
        let s = DocumentSettings::default();
        assert_eq!(s.port, 7890);
        assert_eq!(s.socks_port, 7891);
        assert!(s.validate().is_ok());
        assert_eq!(s.rules().last().unwrap(), &format!("MATCH,{}", s.groups.select));
    }

    #[test]
    fn test_settings_reject_duplicate_group_names() {
        let mut s = DocumentSettings::default();
        s.groups.apple = s.groups.microsoft.clone();
        assert!(matches!(s.validate(), Err(Error::Config(_))));

        let mut s = DocumentSettings::default();
        s.groups.reject = "REJECT".to_string();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_validate_catches_dangling_member() {
        let mut doc = ConfigDocument::from_settings(&DocumentSettings::default());
        doc.proxy_groups.push(ProxyGroup::select("g", vec!["missing".to_string()]));
        let err = doc.validate().unwrap_err();
        assert!(matches!(err, Error::SynthesisInvariant(_)));
    }

    #[test]
    fn test_validate_catches_empty_group_and_duplicates() {
        let mut doc = ConfigDocument::from_settings(&DocumentSettings::default());
        doc.proxy_groups.push(ProxyGroup::select("g", vec![]));
        assert!(doc.validate().is_err());

        let mut doc = ConfigDocument::from_settings(&DocumentSettings::default());
        let entry = ProxyEntry::from(&vless());
        doc.proxies.push(entry.clone());
        doc.proxies.push(entry);
        assert!(doc.validate().is_err());
    }

    #[test]
    fn test_rule_target() {
        assert_eq!(rule_target("MATCH,PROXY"), Some("PROXY"));
        assert_eq!(rule_target("DOMAIN-SUFFIX,google.com,PROXY"), Some("PROXY"));
        assert_eq!(rule_target("IP-CIDR,10.0.0.0/8,DIRECT,no-resolve"), Some("DIRECT"));
        assert_eq!(rule_target("MATCH"), None);
        assert_eq!(rule_target("MATCH,"), None);
    }

    #[test]
    fn test_validate_catches_dangling_rule() {
        let mut doc = ConfigDocument::from_settings(&DocumentSettings::default());
        doc.rules = vec!["MATCH,DIRECT".to_string()];
        assert!(doc.validate().is_ok());

        doc.rules.push("MATCH,🚀 节点选择".to_string());
        assert_eq!(doc.unresolved_rule(), Some("MATCH,🚀 节点选择"));
        assert!(matches!(doc.validate(), Err(Error::SynthesisInvariant(_))));
    }

    #[test]
    fn test_validate_catches_untested_group() {
        let mut doc = ConfigDocument::from_settings(&DocumentSettings::default());
        doc.rules = vec!["MATCH,DIRECT".to_string()];
        let mut group = ProxyGroup::url_test("auto", vec![DIRECT.to_string()], &GroupProbe::default());
        group.url = None;
        doc.proxy_groups.push(group);
        assert!(doc.validate().is_err());
    }

    #[test]
    fn test_yaml_key_order_and_extra() {
        let mut doc = ConfigDocument::from_settings(&DocumentSettings::default());
        doc.extra.insert("ipv6".into(), false.into());
        let yaml = doc.to_yaml().unwrap();

        let port = yaml.find("port: 7890").unwrap();
        let ipv6 = yaml.find("ipv6: false").unwrap();
        let proxies = yaml.find("proxies:").unwrap();
        let groups = yaml.find("proxy-groups:").unwrap();
        assert!(port < ipv6 && ipv6 < proxies && proxies < groups);

        let back = ConfigDocument::from_yaml(&yaml).unwrap();
        assert_eq!(back, doc);
    }
}
