//! Proxy descriptors
//!
//! A descriptor is the normalized form of one stored connection string. It is
//! only ever produced by [`Parser`], which keeps the invariants (valid port,
//! UUID-shaped VLESS credential, non-empty host) in one place.

mod batch;
mod parser;

pub use batch::{parse_batch, parse_hinted_batch, BatchError, IndexedError, ParseMode, ParsedBatch};
pub use parser::{parse, Parser, DEFAULT_FINGERPRINT, DEFAULT_NETWORK, DEFAULT_REALITY_FLOW};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Protocol of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Vless,
    Socks5,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Vless => "vless",
            ProxyKind::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyKind {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vless" => Ok(ProxyKind::Vless),
            "socks5" | "socks" => Ok(ProxyKind::Socks5),
            other => Err(DescriptorError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// How display names are derived from a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NameStyle {
    /// `vless-example.com-443`
    #[default]
    Kind,
    /// `example.com:443`
    HostPort,
}

impl NameStyle {
    pub fn display_name(&self, kind: ProxyKind, host: &str, port: u16) -> String {
        match self {
            NameStyle::Kind => format!("{}-{}-{}", kind, host, port),
            NameStyle::HostPort => format!("{}:{}", host, port),
        }
    }
}

/// Why a port field was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    Unparseable,
    OutOfRange,
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortError::Unparseable => f.write_str("not an integer"),
            PortError::OutOfRange => f.write_str("outside 1-65535"),
        }
    }
}

/// A rule violated while parsing a single descriptor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("empty descriptor")]
    Empty,

    #[error("unrecognized descriptor format")]
    UnrecognizedFormat,

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("bad scheme: expected a {expected} descriptor")]
    BadScheme { expected: ProxyKind },

    #[error("missing credential")]
    MissingCredential,

    #[error("credential is not a UUID: {0}")]
    InvalidCredential(String),

    #[error("missing host")]
    MissingHost,

    #[error("invalid port {value:?}: {reason}")]
    InvalidPort { value: String, reason: PortError },

    #[error("expected 4 colon-separated fields, found {found}")]
    FieldCount { found: usize },

    #[error("invalid percent-encoding in query parameter {key:?}")]
    InvalidEncoding { key: String },
}

/// Reality parameters of a VLESS descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealityOptions {
    pub public_key: String,
    pub short_id: String,
}

/// VLESS transport and TLS parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlessOptions {
    pub uuid: Uuid,
    pub network: String,
    pub servername: String,
    pub skip_cert_verify: bool,
    pub flow: Option<String>,
    pub reality: Option<RealityOptions>,
    pub client_fingerprint: String,
}

/// SOCKS5 credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Options {
    pub username: String,
    pub password: String,
}

/// Protocol-specific part of a descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyOptions {
    Vless(VlessOptions),
    Socks5(Socks5Options),
}

/// Normalized connection parameters of one proxy endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDescriptor {
    name: String,
    server: String,
    port: u16,
    options: ProxyOptions,
}

impl ProxyDescriptor {
    pub(crate) fn new(name: String, server: String, port: u16, options: ProxyOptions) -> Self {
        ProxyDescriptor {
            name,
            server,
            port,
            options,
        }
    }

    pub fn kind(&self) -> ProxyKind {
        match self.options {
            ProxyOptions::Vless(_) => ProxyKind::Vless,
            ProxyOptions::Socks5(_) => ProxyKind::Socks5,
        }
    }

    /// Display name derived at parse time
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Render the descriptor back into its canonical string form.
    ///
    /// Parsing the result with the same [`Parser`] settings yields an equal
    /// descriptor.
    pub fn to_descriptor_string(&self) -> String {
        match &self.options {
            ProxyOptions::Vless(v) => {
                let host = if self.server.contains(':') {
                    format!("[{}]", self.server)
                } else {
                    self.server.clone()
                };
                let mut query = vec![
                    format!("type={}", urlencoding::encode(&v.network)),
                    format!("sni={}", urlencoding::encode(&v.servername)),
                    format!("fp={}", urlencoding::encode(&v.client_fingerprint)),
                ];
                if let Some(reality) = &v.reality {
                    query.push(format!("pbk={}", urlencoding::encode(&reality.public_key)));
                    query.push(format!("sid={}", urlencoding::encode(&reality.short_id)));
                }
                if let Some(flow) = &v.flow {
                    query.push(format!("flow={}", urlencoding::encode(flow)));
                }
                if !v.skip_cert_verify {
                    query.push("allowInsecure=0".to_string());
                }
                format!("vless://{}@{}:{}?{}", v.uuid, host, self.port, query.join("&"))
            }
            ProxyOptions::Socks5(s) => {
                format!("{}:{}:{}:{}", self.server, self.port, s.username, s.password)
            }
        }
    }
}
