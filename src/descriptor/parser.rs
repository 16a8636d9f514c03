//! Descriptor parser
//!
//! Accepted forms:
//! - `vless://<uuid>@<host>:<port>?<query>#<fragment>`
//! - `<host>:<port>:<username>:<password>` (SOCKS5)

use super::{
    DescriptorError, NameStyle, PortError, ProxyDescriptor, ProxyKind, ProxyOptions,
    RealityOptions, Socks5Options, VlessOptions,
};
use std::collections::HashMap;
use uuid::Uuid;

/// Transport used when the `type` query key is absent
pub const DEFAULT_NETWORK: &str = "tcp";

/// Client TLS fingerprint used when the `fp` query key is absent
pub const DEFAULT_FINGERPRINT: &str = "chrome";

/// Flow applied to reality descriptors that do not name one
pub const DEFAULT_REALITY_FLOW: &str = "xtls-rprx-vision";

/// Descriptor parser with its naming and default settings
#[derive(Debug, Clone)]
pub struct Parser {
    name_style: NameStyle,
    fingerprint: String,
}

impl Default for Parser {
    fn default() -> Self {
        Parser {
            name_style: NameStyle::default(),
            fingerprint: DEFAULT_FINGERPRINT.to_string(),
        }
    }
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name_style(mut self, name_style: NameStyle) -> Self {
        self.name_style = name_style;
        self
    }

    pub fn with_fingerprint<S: Into<String>>(mut self, fingerprint: S) -> Self {
        self.fingerprint = fingerprint.into();
        self
    }

    pub fn name_style(&self) -> NameStyle {
        self.name_style
    }

    /// Parse one raw descriptor.
    ///
    /// `hint` is the kind recorded next to the descriptor (a node's `type`
    /// column). Without a hint the kind is detected from the string itself.
    pub fn parse(
        &self,
        raw: &str,
        hint: Option<ProxyKind>,
    ) -> Result<ProxyDescriptor, DescriptorError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(DescriptorError::Empty);
        }

        match raw.find("://").map(|idx| (&raw[..idx], &raw[idx + 3..])) {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("vless") => match hint {
                Some(ProxyKind::Socks5) => Err(DescriptorError::BadScheme {
                    expected: ProxyKind::Socks5,
                }),
                _ => self.parse_vless(rest),
            },
            Some((scheme, _)) => match hint {
                Some(expected) => Err(DescriptorError::BadScheme { expected }),
                None => Err(DescriptorError::UnsupportedScheme(scheme.to_ascii_lowercase())),
            },
            None => match hint {
                Some(ProxyKind::Vless) => Err(DescriptorError::BadScheme {
                    expected: ProxyKind::Vless,
                }),
                Some(ProxyKind::Socks5) => self.parse_socks5(raw),
                None if raw.contains(':') => self.parse_socks5(raw),
                None => Err(DescriptorError::UnrecognizedFormat),
            },
        }
    }

    fn parse_vless(&self, rest: &str) -> Result<ProxyDescriptor, DescriptorError> {
        // The fragment is a client-side label; names are always derived.
        let rest = rest.split_once('#').map_or(rest, |(body, _)| body);

        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, query),
            None => (rest, ""),
        };
        let authority = authority.trim_end_matches('/');

        let (credential, host_port) = authority
            .rsplit_once('@')
            .ok_or(DescriptorError::MissingCredential)?;
        if credential.is_empty() {
            return Err(DescriptorError::MissingCredential);
        }
        let uuid = Uuid::parse_str(credential)
            .map_err(|_| DescriptorError::InvalidCredential(credential.to_string()))?;

        let (host, port) = split_host_port(host_port)?;
        let params = parse_query(query)?;
        let param = |key: &str| params.get(key).filter(|v| !v.is_empty()).cloned();

        let reality = param("pbk").map(|public_key| RealityOptions {
            public_key,
            short_id: params.get("sid").cloned().unwrap_or_default(),
        });
        let flow = param("flow").or_else(|| {
            reality
                .as_ref()
                .map(|_| DEFAULT_REALITY_FLOW.to_string())
        });
        let skip_cert_verify = params
            .get("allowInsecure")
            .map_or(true, |v| !matches!(v.as_str(), "0" | "false"));

        let options = VlessOptions {
            uuid,
            network: param("type").unwrap_or_else(|| DEFAULT_NETWORK.to_string()),
            servername: param("sni").unwrap_or_else(|| host.clone()),
            skip_cert_verify,
            flow,
            reality,
            client_fingerprint: param("fp").unwrap_or_else(|| self.fingerprint.clone()),
        };

        let name = self.name_style.display_name(ProxyKind::Vless, &host, port);
        Ok(ProxyDescriptor::new(name, host, port, ProxyOptions::Vless(options)))
    }

    fn parse_socks5(&self, raw: &str) -> Result<ProxyDescriptor, DescriptorError> {
        let fields: Vec<&str> = raw.split(':').collect();
        let &[host, port, username, password] = fields.as_slice() else {
            return Err(DescriptorError::FieldCount {
                found: fields.len(),
            });
        };

        if host.is_empty() {
            return Err(DescriptorError::MissingHost);
        }
        let port = parse_port(port)?;

        let options = Socks5Options {
            username: username.to_string(),
            password: password.to_string(),
        };
        let name = self.name_style.display_name(ProxyKind::Socks5, host, port);
        Ok(ProxyDescriptor::new(
            name,
            host.to_string(),
            port,
            ProxyOptions::Socks5(options),
        ))
    }
}

/// Parse with default settings
pub fn parse(raw: &str, hint: Option<ProxyKind>) -> Result<ProxyDescriptor, DescriptorError> {
    Parser::default().parse(raw, hint)
}

/// Split `host:port` or `[v6]:port`
fn split_host_port(s: &str) -> Result<(String, u16), DescriptorError> {
    let (host, port) = match s.strip_prefix('[') {
        Some(bracketed) => {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or(DescriptorError::MissingHost)?;
            (host, after.strip_prefix(':').unwrap_or(after))
        }
        None => s.rsplit_once(':').unwrap_or((s, "")),
    };

    if host.is_empty() {
        return Err(DescriptorError::MissingHost);
    }
    Ok((host.to_string(), parse_port(port)?))
}

pub(crate) fn parse_port(value: &str) -> Result<u16, DescriptorError> {
    let invalid = |reason| DescriptorError::InvalidPort {
        value: value.to_string(),
        reason,
    };

    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(PortError::Unparseable));
    }
    match value.parse::<u32>() {
        Ok(port) if (1..=65535).contains(&port) => Ok(port as u16),
        _ => Err(invalid(PortError::OutOfRange)),
    }
}

/// Decode a `&` or `;` delimited query string. Later keys win.
fn parse_query(query: &str) -> Result<HashMap<String, String>, DescriptorError> {
    let mut params = HashMap::new();

    for pair in query.split(['&', ';']) {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = urlencoding::decode(value).map_err(|_| DescriptorError::InvalidEncoding {
            key: key.to_string(),
        })?;
        params.insert(key.to_string(), value.into_owned());
    }

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    fn vless(d: &ProxyDescriptor) -> &VlessOptions {
        match d.options() {
            ProxyOptions::Vless(v) => v,
            other => panic!("expected vless, got {:?}", other),
        }
    }

    #[test]
    fn test_vless_defaults() {
        let d = parse(&format!("vless://{}@host:443?sni=x.com", UUID), None).unwrap();
        let v = vless(&d);

        assert_eq!(d.kind(), ProxyKind::Vless);
        assert_eq!(d.port(), 443);
        assert_eq!(d.server(), "host");
        assert_eq!(d.name(), "vless-host-443");
        assert_eq!(v.servername, "x.com");
        assert_eq!(v.network, "tcp");
        assert_eq!(v.client_fingerprint, DEFAULT_FINGERPRINT);
        assert!(v.skip_cert_verify);
        assert!(v.reality.is_none());
        assert!(v.flow.is_none());
    }

    #[test]
    fn test_vless_servername_falls_back_to_host() {
        let d = parse(&format!("vless://{}@edge.example.net:8443", UUID), None).unwrap();
        assert_eq!(vless(&d).servername, "edge.example.net");
    }

    #[test]
    fn test_vless_reality_and_transport() {
        let raw = format!(
            "vless://{}@1.2.3.4:443?type=grpc;sni=www.yahoo.com&pbk=PUB%2Bkey&sid=6ba8&fp=firefox&unknown=1#My%20Node",
            UUID
        );
        let d = parse(&raw, Some(ProxyKind::Vless)).unwrap();
        let v = vless(&d);

        assert_eq!(v.network, "grpc");
        assert_eq!(v.servername, "www.yahoo.com");
        assert_eq!(v.client_fingerprint, "firefox");
        let reality = v.reality.as_ref().unwrap();
        assert_eq!(reality.public_key, "PUB+key");
        assert_eq!(reality.short_id, "6ba8");
        assert_eq!(v.flow.as_deref(), Some(DEFAULT_REALITY_FLOW));
        assert_eq!(d.name(), "vless-1.2.3.4-443");
    }

    #[test]
    fn test_vless_allow_insecure_off() {
        let d = parse(&format!("vless://{}@h:1?allowInsecure=0", UUID), None).unwrap();
        assert!(!vless(&d).skip_cert_verify);
    }

    #[test]
    fn test_vless_port_out_of_range() {
        let err = parse(&format!("vless://{}@host:999999?type=tcp", UUID), None).unwrap_err();
        assert!(matches!(
            err,
            DescriptorError::InvalidPort {
                reason: PortError::OutOfRange,
                ..
            }
        ));
        assert!(parse("vless://@host:999999?type=tcp", None).is_err());
    }

    #[test]
    fn test_vless_credential_rules() {
        assert_eq!(
            parse("vless://@host:443", None).unwrap_err(),
            DescriptorError::MissingCredential
        );
        assert_eq!(
            parse("vless://host:443", None).unwrap_err(),
            DescriptorError::MissingCredential
        );
        assert!(matches!(
            parse("vless://not-a-uuid@host:443", None).unwrap_err(),
            DescriptorError::InvalidCredential(_)
        ));
    }

    #[test]
    fn test_vless_host_and_port_rules() {
        assert_eq!(
            parse(&format!("vless://{}@:443", UUID), None).unwrap_err(),
            DescriptorError::MissingHost
        );
        assert!(matches!(
            parse(&format!("vless://{}@host:https", UUID), None).unwrap_err(),
            DescriptorError::InvalidPort {
                reason: PortError::Unparseable,
                ..
            }
        ));
        assert!(matches!(
            parse(&format!("vless://{}@host:0", UUID), None).unwrap_err(),
            DescriptorError::InvalidPort {
                reason: PortError::OutOfRange,
                ..
            }
        ));
    }

    #[test]
    fn test_vless_ipv6_host() {
        let d = parse(&format!("vless://{}@[2001:db8::1]:443/?type=ws", UUID), None).unwrap();
        assert_eq!(d.server(), "2001:db8::1");
        assert_eq!(d.port(), 443);
        assert_eq!(vless(&d).network, "ws");
    }

    #[test]
    fn test_socks5() {
        let d = parse("host:1080:user:pass", None).unwrap();
        assert_eq!(d.kind(), ProxyKind::Socks5);
        assert_eq!(d.server(), "host");
        assert_eq!(d.port(), 1080);
        assert_eq!(d.name(), "socks5-host-1080");
        match d.options() {
            ProxyOptions::Socks5(s) => {
                assert_eq!(s.username, "user");
                assert_eq!(s.password, "pass");
            }
            other => panic!("expected socks5, got {:?}", other),
        }
    }

    #[test]
    fn test_socks5_field_count() {
        assert_eq!(
            parse("host:1080:user", None).unwrap_err(),
            DescriptorError::FieldCount { found: 3 }
        );
        assert_eq!(
            parse("host:1080:user:pass:extra", None).unwrap_err(),
            DescriptorError::FieldCount { found: 5 }
        );
    }

    #[test]
    fn test_socks5_bad_port() {
        assert!(matches!(
            parse("host:70000:u:p", None).unwrap_err(),
            DescriptorError::InvalidPort {
                reason: PortError::OutOfRange,
                ..
            }
        ));
        assert!(matches!(
            parse("host:abc:u:p", None).unwrap_err(),
            DescriptorError::InvalidPort {
                reason: PortError::Unparseable,
                ..
            }
        ));
    }

    #[test]
    fn test_scheme_detection() {
        assert_eq!(parse("   ", None).unwrap_err(), DescriptorError::Empty);
        assert_eq!(
            parse("garbage", None).unwrap_err(),
            DescriptorError::UnrecognizedFormat
        );
        assert_eq!(
            parse("trojan://pw@host:443", None).unwrap_err(),
            DescriptorError::UnsupportedScheme("trojan".to_string())
        );
        assert_eq!(
            parse("host:1080:u:p", Some(ProxyKind::Vless)).unwrap_err(),
            DescriptorError::BadScheme {
                expected: ProxyKind::Vless
            }
        );
        assert_eq!(
            parse(&format!("vless://{}@h:1", UUID), Some(ProxyKind::Socks5)).unwrap_err(),
            DescriptorError::BadScheme {
                expected: ProxyKind::Socks5
            }
        );
    }

    #[test]
    fn test_host_port_name_style() {
        let parser = Parser::new().with_name_style(NameStyle::HostPort);
        let d = parser.parse("10.0.0.1:1080:u:p", None).unwrap();
        assert_eq!(d.name(), "10.0.0.1:1080");
    }

    #[test]
    fn test_custom_fingerprint() {
        let parser = Parser::new().with_fingerprint("safari");
        let d = parser.parse(&format!("vless://{}@h:443", UUID), None).unwrap();
        assert_eq!(vless(&d).client_fingerprint, "safari");
    }

    #[test]
    fn test_reparse_is_stable() {
        let raw = format!("  vless://{}@host:443?sni=x.com&type=ws  ", UUID);
        assert_eq!(parse(&raw, None).unwrap(), parse(&raw, None).unwrap());
    }
}
