//! Token-addressed bundle of nodes

use crate::lifecycle::{self, Lifecycle, Status};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default node limit for new subscriptions
pub const DEFAULT_NODE_LIMIT: u32 = 100;

const NODE_LIMIT_RANGE: std::ops::RangeInclusive<u32> = 1..=1000;

/// Whether a member is rendered into the subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipState {
    #[default]
    Active,
    Disabled,
}

/// Link between a subscription and a node, with its own traffic counter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Membership {
    pub node_id: Uuid,
    #[serde(default)]
    pub bandwidth_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_access_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: MembershipState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
}

impl Membership {
    pub fn new(node_id: Uuid) -> Self {
        Membership {
            node_id,
            bandwidth_used: 0,
            last_access_at: None,
            state: MembershipState::Active,
            remark: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state == MembershipState::Active
    }

    pub fn add_bandwidth(&mut self, bytes: u64, now: DateTime<Utc>) {
        self.bandwidth_used = self.bandwidth_used.saturating_add(bytes);
        self.last_access_at = Some(now);
    }
}

/// A user's subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub token: Uuid,
    #[serde(default)]
    pub members: Vec<Membership>,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bandwidth_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_limit: Option<u64>,
    #[serde(default = "default_node_limit")]
    pub node_limit: u32,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_access_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_access_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
}

fn default_node_limit() -> u32 {
    DEFAULT_NODE_LIMIT
}

impl Subscription {
    /// New active subscription with a fresh random token.
    pub fn new(user_id: Uuid, name: impl Into<String>, node_limit: u32) -> Result<Self> {
        let sub = Subscription {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            token: Uuid::new_v4(),
            members: Vec::new(),
            status: Status::Active,
            expire_at: None,
            bandwidth_used: 0,
            bandwidth_limit: None,
            node_limit,
            access_count: 0,
            last_access_at: None,
            last_access_ip: None,
            remark: None,
        };
        sub.validate()?;
        Ok(sub)
    }

    pub fn validate(&self) -> Result<()> {
        super::validate_name("subscription", &self.name)?;
        if !NODE_LIMIT_RANGE.contains(&self.node_limit) {
            return Err(Error::validation(format!(
                "node limit must be {}-{}, got {}",
                NODE_LIMIT_RANGE.start(),
                NODE_LIMIT_RANGE.end(),
                self.node_limit
            )));
        }
        if self.members.len() > self.node_limit as usize {
            return Err(Error::validation(format!(
                "subscription {} has {} nodes, limit is {}",
                self.name,
                self.members.len(),
                self.node_limit
            )));
        }
        Ok(())
    }

    pub fn can_add_node(&self) -> bool {
        self.members.len() < self.node_limit as usize
    }

    /// Attach a node. Fails when the node is already a member or the limit
    /// is reached.
    pub fn add_node(&mut self, node_id: Uuid) -> Result<&mut Membership> {
        if self.member(node_id).is_some() {
            return Err(Error::validation(format!(
                "node {} is already in subscription {}",
                node_id, self.name
            )));
        }
        if !self.can_add_node() {
            return Err(Error::validation(format!(
                "subscription {} reached its limit of {} nodes",
                self.name, self.node_limit
            )));
        }
        self.members.push(Membership::new(node_id));
        let last = self.members.len() - 1;
        Ok(&mut self.members[last])
    }

    pub fn member(&self, node_id: Uuid) -> Option<&Membership> {
        self.members.iter().find(|m| m.node_id == node_id)
    }

    pub fn member_mut(&mut self, node_id: Uuid) -> Option<&mut Membership> {
        self.members.iter_mut().find(|m| m.node_id == node_id)
    }

    /// Node ids of enabled members, in membership order
    pub fn enabled_node_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.members
            .iter()
            .filter(|m| m.is_enabled())
            .map(|m| m.node_id)
    }

    pub fn record_access(&mut self, ip: impl Into<String>, now: DateTime<Utc>) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_access_at = Some(now);
        self.last_access_ip = Some(ip.into());
    }

    /// Account traffic on one member edge and on the subscription total.
    pub fn record_traffic(&mut self, node_id: Uuid, bytes: u64, now: DateTime<Utc>) -> Result<()> {
        let member = self.member_mut(node_id).ok_or_else(|| {
            Error::not_found(format!("node {} is not in this subscription", node_id))
        })?;
        member.add_bandwidth(bytes, now);
        self.bandwidth_used = self.bandwidth_used.saturating_add(bytes);
        lifecycle::refresh(self, now);
        Ok(())
    }
}

impl Lifecycle for Subscription {
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
