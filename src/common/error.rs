//! Error types for the engine

use crate::descriptor::{BatchError, DescriptorError};
use crate::lifecycle::Refusal;
use std::io;
use thiserror::Error;

/// Engine error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("Batch rejected: {0}")]
    Batch(#[from] BatchError),

    /// Produced only when a synthesized document breaks its own invariants.
    #[error("Synthesis invariant violated: {0}")]
    SynthesisInvariant(String),

    #[error("Subscription refused: {0}")]
    Refused(#[from] Refusal),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialize(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn synthesis<S: Into<String>>(msg: S) -> Self {
        Error::SynthesisInvariant(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Error::Validation(msg.into())
    }

}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialize(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialize(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;
