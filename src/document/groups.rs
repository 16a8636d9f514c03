//! Proxy group layout

use serde::{Deserialize, Serialize};
use std::fmt;

/// Built-in outbound that connects without a proxy
pub const DIRECT: &str = "DIRECT";

/// Built-in outbound that drops the connection
pub const REJECT: &str = "REJECT";

/// Default URL for url-test and fallback probes
pub const DEFAULT_TEST_URL: &str = "http://www.gstatic.com/generate_204";

/// Default probe interval of url-test and fallback groups, in seconds
pub const DEFAULT_TEST_INTERVAL: u64 = 300;

/// Latency difference below which url-test keeps its current pick, in ms
pub const DEFAULT_TOLERANCE: u32 = 50;

/// Group strategy, as understood by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupType {
    /// Manual choice
    Select,
    /// Lowest latency
    UrlTest,
    /// First healthy member in order
    Fallback,
}

impl GroupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupType::Select => "select",
            GroupType::UrlTest => "url-test",
            GroupType::Fallback => "fallback",
        }
    }

    /// Whether the client probes members of this group
    pub fn is_tested(&self) -> bool {
        matches!(self, GroupType::UrlTest | GroupType::Fallback)
    }
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of `proxy-groups`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyGroup {
    pub name: String,

    #[serde(rename = "type")]
    pub group_type: GroupType,

    /// Member names: proxies, other groups, `DIRECT` or `REJECT`
    pub proxies: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<u32>,
}

impl ProxyGroup {
    pub fn select(name: impl Into<String>, proxies: Vec<String>) -> Self {
        ProxyGroup {
            name: name.into(),
            group_type: GroupType::Select,
            proxies,
            url: None,
            interval: None,
            tolerance: None,
        }
    }

    pub fn url_test(name: impl Into<String>, proxies: Vec<String>, probe: &GroupProbe) -> Self {
        ProxyGroup {
            name: name.into(),
            group_type: GroupType::UrlTest,
            proxies,
            url: Some(probe.url.clone()),
            interval: Some(probe.interval),
            tolerance: Some(probe.tolerance),
        }
    }

    pub fn fallback(name: impl Into<String>, proxies: Vec<String>, probe: &GroupProbe) -> Self {
        ProxyGroup {
            name: name.into(),
            group_type: GroupType::Fallback,
            proxies,
            url: Some(probe.url.clone()),
            interval: Some(probe.interval),
            tolerance: None,
        }
    }
}

/// Client-side probing parameters of tested groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GroupProbe {
    pub url: String,
    pub interval: u64,
    pub tolerance: u32,
}

impl Default for GroupProbe {
    fn default() -> Self {
        GroupProbe {
            url: DEFAULT_TEST_URL.to_string(),
            interval: DEFAULT_TEST_INTERVAL,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

/// Display names of the synthesized groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GroupNames {
    pub select: String,
    pub auto: String,
    pub fallback: String,
    pub media: String,
    pub telegram: String,
    pub microsoft: String,
    pub apple: String,
    pub direct: String,
    pub reject: String,
}

impl Default for GroupNames {
    fn default() -> Self {
        GroupNames {
            select: "🚀 Proxy Select".to_string(),
            auto: "♻️ Auto Select".to_string(),
            fallback: "🔯 Fallback".to_string(),
            media: "🌍 Global Media".to_string(),
            telegram: "📲 Telegram".to_string(),
            microsoft: "Ⓜ️ Microsoft".to_string(),
            apple: "🍎 Apple".to_string(),
            direct: "🎯 Global Direct".to_string(),
            reject: "🛑 Global Reject".to_string(),
        }
    }
}

impl GroupNames {
    /// All group names in document order
    pub fn all(&self) -> [&str; 9] {
        [
            self.select.as_str(),
            self.auto.as_str(),
            self.fallback.as_str(),
            self.media.as_str(),
            self.telegram.as_str(),
            self.microsoft.as_str(),
            self.apple.as_str(),
            self.direct.as_str(),
            self.reject.as_str(),
        ]
    }

    /// Names a proxy may never take: built-in outbounds and group names
    pub fn reserved(&self) -> impl Iterator<Item = &str> {
        [DIRECT, REJECT].into_iter().chain(self.all())
    }

    /// Rule list used when none is configured
    pub fn default_rules(&self) -> Vec<String> {
        vec![
            "DOMAIN-SUFFIX,local,DIRECT".to_string(),
            "IP-CIDR,127.0.0.0/8,DIRECT,no-resolve".to_string(),
            "IP-CIDR,192.168.0.0/16,DIRECT,no-resolve".to_string(),
            format!("DOMAIN-KEYWORD,telegram,{}", self.telegram),
            format!("DOMAIN-SUFFIX,apple.com,{}", self.apple),
            format!("DOMAIN-SUFFIX,microsoft.com,{}", self.microsoft),
            format!("DOMAIN-SUFFIX,youtube.com,{}", self.media),
            format!("DOMAIN-SUFFIX,netflix.com,{}", self.media),
            format!("GEOIP,CN,{}", self.direct),
            format!("MATCH,{}", self.select),
        ]
    }
}

/// Build the full group list for the final proxy name list `proxies`.
///
/// No group is ever empty: with no proxies the tested groups fall back to
/// `DIRECT`.
pub fn build_groups(names: &GroupNames, probe: &GroupProbe, proxies: &[String]) -> Vec<ProxyGroup> {
    let pool: Vec<String> = if proxies.is_empty() {
        vec![DIRECT.to_string()]
    } else {
        proxies.to_vec()
    };

    let mut selection = vec![names.auto.clone(), names.fallback.clone(), DIRECT.to_string()];
    selection.extend(proxies.iter().cloned());

    vec![
        ProxyGroup::select(&names.select, selection),
        ProxyGroup::url_test(&names.auto, pool.clone(), probe),
        ProxyGroup::fallback(&names.fallback, pool, probe),
        ProxyGroup::select(
            &names.media,
            vec![names.select.clone(), names.auto.clone(), DIRECT.to_string()],
        ),
        ProxyGroup::select(&names.telegram, vec![names.select.clone(), DIRECT.to_string()]),
        ProxyGroup::select(&names.microsoft, vec![DIRECT.to_string(), names.select.clone()]),
        ProxyGroup::select(&names.apple, vec![DIRECT.to_string(), names.select.clone()]),
        ProxyGroup::select(&names.direct, vec![DIRECT.to_string(), names.select.clone()]),
        ProxyGroup::select(&names.reject, vec![REJECT.to_string(), DIRECT.to_string()]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_type_serde() {
        assert_eq!(serde_yaml::to_string(&GroupType::UrlTest).unwrap().trim(), "url-test");
        let t: GroupType = serde_yaml::from_str("fallback").unwrap();
        assert_eq!(t, GroupType::Fallback);
        assert!(GroupType::UrlTest.is_tested());
        assert!(!GroupType::Select.is_tested());
    }

    #[test]
    fn test_build_groups_with_proxies() {
        let names = GroupNames::default();
        let proxies = vec!["a".to_string(), "b".to_string()];
        let groups = build_groups(&names, &GroupProbe::default(), &proxies);

        assert_eq!(groups.len(), 9);
        assert_eq!(
            groups[0].proxies,
            vec![names.auto.as_str(), names.fallback.as_str(), "DIRECT", "a", "b"]
        );
        assert_eq!(groups[1].proxies, proxies);
        assert_eq!(groups[1].tolerance, Some(DEFAULT_TOLERANCE));
        assert_eq!(groups[2].proxies, proxies);
        assert_eq!(groups[2].url.as_deref(), Some(DEFAULT_TEST_URL));
        assert_eq!(groups[2].interval, Some(DEFAULT_TEST_INTERVAL));
        assert_eq!(groups[8].proxies, vec!["REJECT", "DIRECT"]);
    }

    #[test]
    fn test_build_groups_without_proxies() {
        let names = GroupNames::default();
        let groups = build_groups(&names, &GroupProbe::default(), &[]);

        assert!(groups.iter().all(|g| !g.proxies.is_empty()));
        assert_eq!(groups[0].proxies, vec![names.auto.as_str(), names.fallback.as_str(), "DIRECT"]);
        assert_eq!(groups[1].proxies, vec!["DIRECT"]);
        assert_eq!(groups[2].proxies, vec!["DIRECT"]);
    }

    #[test]
    fn test_category_groups_only_reference_dynamic_groups() {
        let names = GroupNames::default();
        let groups = build_groups(&names, &GroupProbe::default(), &["x".to_string()]);
        let allowed = [
            names.select.as_str(),
            names.auto.as_str(),
            names.fallback.as_str(),
            DIRECT,
            REJECT,
        ];
        for group in &groups[3..] {
            for member in &group.proxies {
                assert!(allowed.contains(&member.as_str()), "{} -> {}", group.name, member);
            }
        }
    }

    #[test]
    fn test_reserved_names() {
        let names = GroupNames::default();
        let reserved: Vec<&str> = names.reserved().collect();
        assert_eq!(reserved.len(), 11);
        assert!(reserved.contains(&"DIRECT"));
        assert!(reserved.contains(&names.apple.as_str()));
    }
}
