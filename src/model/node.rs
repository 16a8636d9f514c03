//! Upstream proxy node

use crate::descriptor::{Parser, ProxyDescriptor, ProxyKind};
use crate::lifecycle::{self, Lifecycle, Status};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Region a node is located in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Country {
    Cn,
    Hk,
    Tw,
    Jp,
    Kr,
    Sg,
    Us,
}

impl Country {
    pub const ALL: [Country; 7] = [
        Country::Cn,
        Country::Hk,
        Country::Tw,
        Country::Jp,
        Country::Kr,
        Country::Sg,
        Country::Us,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Country::Cn => "CN",
            Country::Hk => "HK",
            Country::Tw => "TW",
            Country::Jp => "JP",
            Country::Kr => "KR",
            Country::Sg => "SG",
            Country::Us => "US",
        }
    }
}

impl fmt::Display for Country {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Country {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Country::ALL
            .into_iter()
            .find(|c| c.code().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::validation(format!("unsupported country code: {}", s)))
    }
}

/// A registered upstream endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Node {
    pub id: Uuid,
    pub name: String,
    pub kind: ProxyKind,
    /// Raw connection string as entered by an administrator
    pub descriptor: String,
    pub country: Country,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bandwidth_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
}

impl Node {
    /// Build a node from a descriptor string, taking kind, host and port from
    /// the parsed descriptor.
    pub fn from_descriptor(
        parser: &Parser,
        name: impl Into<String>,
        descriptor: impl Into<String>,
        country: Country,
    ) -> Result<Self> {
        let descriptor = descriptor.into();
        let parsed = parser.parse(&descriptor, None)?;

        let node = Node {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: parsed.kind(),
            descriptor,
            country,
            city: None,
            host: parsed.server().to_string(),
            port: parsed.port(),
            status: Status::Active,
            latency_ms: None,
            last_checked_at: None,
            last_error: None,
            last_error_at: None,
            expire_at: None,
            bandwidth_used: 0,
            bandwidth_limit: None,
            remark: None,
        };
        node.validate()?;
        Ok(node)
    }

    pub fn validate(&self) -> Result<()> {
        super::validate_name("node", &self.name)?;
        if self.descriptor.trim().is_empty() {
            return Err(Error::validation(format!("node {} has an empty descriptor", self.name)));
        }
        if self.host.is_empty() {
            return Err(Error::validation(format!("node {} has no host", self.name)));
        }
        if self.port == 0 {
            return Err(Error::validation(format!("node {} has port 0", self.name)));
        }
        Ok(())
    }

    /// Parse the stored descriptor, using the recorded kind as a hint.
    pub fn parse_descriptor(&self, parser: &Parser) -> Result<ProxyDescriptor> {
        Ok(parser.parse(&self.descriptor, Some(self.kind))?)
    }

    /// Successful probe: store latency and lift a prober-owned error.
    pub fn record_latency(&mut self, latency_ms: u32, now: DateTime<Utc>) {
        self.latency_ms = Some(latency_ms);
        self.last_checked_at = Some(now);
        if self.status == Status::Error {
            self.status = Status::Active;
        }
        lifecycle::refresh(self, now);
    }

    /// Failed probe
    pub fn mark_error(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = Status::Error;
        self.latency_ms = None;
        self.last_error = Some(message.into());
        self.last_error_at = Some(now);
        self.last_checked_at = Some(now);
    }

    pub fn add_bandwidth(&mut self, bytes: u64, now: DateTime<Utc>) {
        self.bandwidth_used = self.bandwidth_used.saturating_add(bytes);
        lifecycle::refresh(self, now);
    }
}

impl Lifecycle for Node {
    fn status(&self) -> Status {
        self.status
    }

    fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    fn expire_at(&self) -> Option<DateTime<Utc>> {
        self.expire_at
    }

    fn bandwidth_used(&self) -> u64 {
        self.bandwidth_used
    }

    fn bandwidth_limit(&self) -> Option<u64> {
        self.bandwidth_limit
    }
}
