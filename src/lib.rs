//! nodeconfig - proxy configuration engine
//!
//! Turns stored proxy connection strings into Clash/mihomo client documents
//! for token-addressed subscriptions:
//! - VLESS and SOCKS5 descriptor parsing with strict or lenient batches
//! - Document synthesis with selection, url-test, fallback and category groups
//! - Expiry and bandwidth driven lifecycle of nodes and subscriptions
//! - Concurrent TCP health checks with single-flight per node
//!
//! # Architecture
//!
//! ```text
//!                  +------------------+
//!                  |    service/      |
//!                  | (retrieve, bill) |
//!                  +--------+---------+
//!                           |
//!        +------------------+------------------+
//!        |                  |                  |
//! +------v------+   +-------v-------+   +------v------+
//! | lifecycle/  |   |  descriptor/  |   |  document/  |
//! |  (status)   |   |   (parser)    |   | (synthesis) |
//! +------+------+   +---------------+   +-------------+
//!        |
//! +------v------+   +---------------+
//! |   model/    |<--+    probe/     |
//! |  (entities) |   | (health check)|
//! +-------------+   +---------------+
//! ```

pub mod cache;
pub mod common;
pub mod config;
pub mod descriptor;
pub mod document;
pub mod lifecycle;
pub mod model;
pub mod probe;
pub mod service;

pub use common::error::{Error, Result};
pub use config::Config;
pub use descriptor::{ParseMode, Parser, ProxyDescriptor, ProxyKind};
pub use document::{ConfigDocument, Synthesizer};
pub use lifecycle::{Lifecycle, Refusal, Status};

use tracing::info;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Parser and synthesizer configured together
#[derive(Debug, Clone, Default)]
pub struct Engine {
    parser: Parser,
    synthesizer: Synthesizer,
    mode: ParseMode,
}

impl Engine {
    pub fn new(parser: Parser, synthesizer: Synthesizer, mode: ParseMode) -> Self {
        Engine {
            parser,
            synthesizer,
            mode,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.parser(), config.synthesizer(), config.parser.mode)
    }

    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    pub fn synthesizer(&self) -> &Synthesizer {
        &self.synthesizer
    }

    pub fn mode(&self) -> ParseMode {
        self.mode
    }

    /// Parse raw descriptors with the configured error policy and build a
    /// document from the ones that parsed.
    pub fn render<I, S>(&self, raws: I) -> Result<ConfigDocument>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let batch = self.parser.parse_batch(raws, self.mode)?;
        let doc = self.synthesizer.synthesize(&batch.descriptors)?;
        info!(
            "Rendered {} proxies ({} descriptors skipped)",
            doc.proxies.len(),
            batch.errors.len()
        );
        Ok(doc)
    }
}
