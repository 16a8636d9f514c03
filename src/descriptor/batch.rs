//! Batch parsing with strict or lenient error policy

use super::{DescriptorError, Parser, ProxyDescriptor, ProxyKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// What to do when some descriptors in a batch fail to parse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    /// Any failure rejects the whole batch
    #[default]
    Strict,
    /// Failures are collected, the rest of the batch is kept
    Lenient,
}

/// A descriptor error attributed to its position in the input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("descriptor #{}: {}", .index + 1, .error)]
pub struct IndexedError {
    /// Zero-based input position
    pub index: usize,
    pub error: DescriptorError,
}

/// Strict-mode rejection carrying every failure of the batch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} of {} descriptors failed to parse", .errors.len(), .total)]
pub struct BatchError {
    pub errors: Vec<IndexedError>,
    /// Number of non-blank inputs
    pub total: usize,
}

/// Outcome of a batch parse
#[derive(Debug, Clone, Default)]
pub struct ParsedBatch {
    /// Parsed descriptors in input order
    pub descriptors: Vec<ProxyDescriptor>,
    /// Failures; always empty in strict mode
    pub errors: Vec<IndexedError>,
}

impl ParsedBatch {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Parser {
    /// Parse a batch of raw descriptors, detecting each kind from the string.
    pub fn parse_batch<I, S>(&self, raws: I, mode: ParseMode) -> Result<ParsedBatch, BatchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.parse_hinted_batch(raws.into_iter().map(|raw| (raw, None)), mode)
    }

    /// Parse a batch where each descriptor may carry its recorded kind.
    ///
    /// Blank entries are skipped but still occupy an index, so reported
    /// positions line up with the caller's input.
    pub fn parse_hinted_batch<I, S>(
        &self,
        items: I,
        mode: ParseMode,
    ) -> Result<ParsedBatch, BatchError>
    where
        I: IntoIterator<Item = (S, Option<ProxyKind>)>,
        S: AsRef<str>,
    {
        let mut batch = ParsedBatch::default();
        let mut total = 0;

        for (index, (raw, hint)) in items.into_iter().enumerate() {
            let raw = raw.as_ref();
            if raw.trim().is_empty() {
                continue;
            }
            total += 1;

            match self.parse(raw, hint) {
                Ok(descriptor) => batch.descriptors.push(descriptor),
                Err(error) => batch.errors.push(IndexedError { index, error }),
            }
        }

        if batch.errors.is_empty() {
            debug!("Parsed {} descriptors", batch.descriptors.len());
            return Ok(batch);
        }

        match mode {
            ParseMode::Strict => Err(BatchError {
                errors: batch.errors,
                total,
            }),
            ParseMode::Lenient => {
                for e in &batch.errors {
                    warn!("Skipping {}", e);
                }
                Ok(batch)
            }
        }
    }
}

/// Batch-parse with default parser settings
pub fn parse_batch<I, S>(raws: I, mode: ParseMode) -> Result<ParsedBatch, BatchError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Parser::default().parse_batch(raws, mode)
}

/// Batch-parse hinted items with default parser settings
pub fn parse_hinted_batch<I, S>(items: I, mode: ParseMode) -> Result<ParsedBatch, BatchError>
where
    I: IntoIterator<Item = (S, Option<ProxyKind>)>,
    S: AsRef<str>,
{
    Parser::default().parse_hinted_batch(items, mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_VLESS: &str =
        "vless://b831381d-6324-4d53-ad4f-8cda48b30811@example.com:443?sni=example.com";

    fn inputs() -> Vec<&'static str> {
        vec![GOOD_VLESS, "", "host:1080:user", "10.0.0.2:1080:u:p", "nonsense"]
    }

    #[test]
    fn test_strict_rejects_with_all_indices() {
        let err = parse_batch(inputs(), ParseMode::Strict).unwrap_err();

        assert_eq!(err.total, 4);
        let indices: Vec<usize> = err.errors.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![2, 4]);
        assert_eq!(err.errors[0].error, DescriptorError::FieldCount { found: 3 });
        assert_eq!(err.to_string(), "2 of 4 descriptors failed to parse");
        assert_eq!(
            err.errors[0].to_string(),
            "descriptor #3: expected 4 colon-separated fields, found 3"
        );
    }

    #[test]
    fn test_lenient_keeps_partial_result() {
        let batch = parse_batch(inputs(), ParseMode::Lenient).unwrap();

        assert_eq!(batch.descriptors.len(), 2);
        assert_eq!(batch.descriptors[0].name(), "vless-example.com-443");
        assert_eq!(batch.descriptors[1].name(), "socks5-10.0.0.2-1080");
        assert_eq!(batch.errors.len(), 2);
        assert!(!batch.is_clean());
    }

    #[test]
    fn test_clean_batch_in_both_modes() {
        let raws = [GOOD_VLESS, "10.0.0.2:1080:u:p"];
        for mode in [ParseMode::Strict, ParseMode::Lenient] {
            let batch = parse_batch(raws, mode).unwrap();
            assert!(batch.is_clean());
            assert_eq!(batch.descriptors.len(), 2);
        }
    }

    #[test]
    fn test_hinted_batch() {
        let items = vec![
            (GOOD_VLESS, Some(ProxyKind::Socks5)),
            ("10.0.0.2:1080:u:p", Some(ProxyKind::Socks5)),
        ];
        let batch = parse_hinted_batch(items, ParseMode::Lenient).unwrap();
        assert_eq!(batch.descriptors.len(), 1);
        assert_eq!(
            batch.errors[0].error,
            DescriptorError::BadScheme {
                expected: ProxyKind::Socks5
            }
        );
    }
}
