//! Entities the engine operates on
//!
//! These are plain in-memory records handed over by a store. The engine never
//! creates or deletes them; it only re-derives status and updates counters.

mod node;
mod subscription;

pub use node::{Country, Node};
pub use subscription::{Membership, MembershipState, Subscription, DEFAULT_NODE_LIMIT};

use crate::{Error, Result};

/// Shortest allowed entity name, in characters
pub const NAME_MIN_CHARS: usize = 2;

/// Longest allowed entity name, in characters
pub const NAME_MAX_CHARS: usize = 50;

pub(crate) fn validate_name(entity: &str, name: &str) -> Result<()> {
    let len = name.chars().count();
    if !(NAME_MIN_CHARS..=NAME_MAX_CHARS).contains(&len) {
        return Err(Error::validation(format!(
            "{} name must be {}-{} characters, got {}",
            entity, NAME_MIN_CHARS, NAME_MAX_CHARS, len
        )));
    }
    Ok(())
}
