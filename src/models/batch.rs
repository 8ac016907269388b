use std::fmt;

use super::run::RunSignature;

/// Upstream producers drop new batches here.
pub const INBOX_PREFIX: &str = "text_events/";
/// Claimed batches live here while a run owns them.
pub const PROCESSING_PREFIX: &str = "parser_processing/";
/// Batches that failed too many times are parked here.
pub const DEAD_LETTER_PREFIX: &str = "parser_dead_letter/";
/// Only gzip-compressed tarballs are claimable.
pub const ARCHIVE_SUFFIX: &str = ".tgz";

/// Key of an unclaimed batch under the inbox prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey(String);

impl BatchKey {
    /// Accepts inbox keys ending in `.tgz`; anything else is not a batch.
    pub fn parse(key: &str) -> Option<Self> {
        let name = key.strip_prefix(INBOX_PREFIX)?;
        if name.len() <= ARCHIVE_SUFFIX.len() || !name.ends_with(ARCHIVE_SUFFIX) {
            return None;
        }
        Some(Self(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key path below the inbox prefix, e.g. `2013/batch1.tgz`.
    pub fn relative_name(&self) -> &str {
        &self.0[INBOX_PREFIX.len()..]
    }

    pub fn dead_letter_key(&self) -> String {
        format!("{}{}", DEAD_LETTER_PREFIX, self.relative_name())
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A batch this consumer has moved into the processing prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedBatch {
    pub origin: BatchKey,
    pub processing_key: String,
    pub signature: RunSignature,
}

impl ClaimedBatch {
    pub fn new(origin: BatchKey, signature: RunSignature) -> Self {
        Self {
            processing_key: signature.processing_key(),
            origin,
            signature,
        }
    }
}
