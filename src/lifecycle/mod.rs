//! Lifecycle evaluation
//!
//! Status of nodes and subscriptions is derived from expiry and bandwidth
//! counters by a pure function. Callers run it right before persisting a
//! change to those counters and before rendering a subscription.
//!
//! `Error` belongs to the health prober: evaluation can push an entity to
//! `Inactive` but never clears an existing `Error`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Activity state of a node or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Active,
    Inactive,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Inactive => "inactive",
            Status::Error => "error",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Status::Active)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Fields the evaluator reads and writes
pub trait Lifecycle {
    fn status(&self) -> Status;

    fn set_status(&mut self, status: Status);

    fn expire_at(&self) -> Option<DateTime<Utc>>;

    fn bandwidth_used(&self) -> u64;

    /// Quota in bytes. `Some(0)` is treated as no quota.
    fn bandwidth_limit(&self) -> Option<u64>;
}

/// Whether the entity's expiry lies strictly before `now`
pub fn is_expired<E: Lifecycle + ?Sized>(entity: &E, now: DateTime<Utc>) -> bool {
    entity.expire_at().map_or(false, |expire_at| now > expire_at)
}

/// Whether the entity has used up a non-zero quota
pub fn is_over_limit<E: Lifecycle + ?Sized>(entity: &E) -> bool {
    match entity.bandwidth_limit() {
        Some(limit) if limit > 0 => entity.bandwidth_used() >= limit,
        _ => false,
    }
}

/// Derive the status an entity should have at `now`.
pub fn derive_status<E: Lifecycle + ?Sized>(entity: &E, now: DateTime<Utc>) -> Status {
    if is_expired(entity, now) || is_over_limit(entity) {
        return Status::Inactive;
    }
    match entity.status() {
        Status::Error => Status::Error,
        _ => Status::Active,
    }
}

/// Write the derived status back. Returns whether it changed.
pub fn refresh<E: Lifecycle + ?Sized>(entity: &mut E, now: DateTime<Utc>) -> bool {
    let derived = derive_status(entity, now);
    if derived == entity.status() {
        return false;
    }
    entity.set_status(derived);
    true
}

/// Reason a subscription must not be rendered
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    #[error("subscription has expired")]
    Expired,

    #[error("subscription bandwidth is used up")]
    OverQuota,

    #[error("subscription is not active")]
    Inactive,
}

/// Render guard: `Ok` only when the entity is usable at `now`.
///
/// The stored status is checked as-is, so callers refresh first.
pub fn ensure_renderable<E: Lifecycle + ?Sized>(entity: &E, now: DateTime<Utc>) -> Result<(), Refusal> {
    if is_expired(entity, now) {
        return Err(Refusal::Expired);
    }
    if is_over_limit(entity) {
        return Err(Refusal::OverQuota);
    }
    if !entity.status().is_active() {
        return Err(Refusal::Inactive);
    }
    Ok(())
}
