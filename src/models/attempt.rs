use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::batch::BatchKey;

/// Failed-attempt counters, keyed by the batch's path below the inbox.
pub const ATTEMPTS_PREFIX: &str = "parser_attempts/";

/// How many times a batch has been restored after a failed run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    pub attempts: u32,
    pub last_failure: String,
    pub last_signature: String,
    pub updated_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn key_for(batch: &BatchKey) -> String {
        format!("{}{}", ATTEMPTS_PREFIX, batch.relative_name())
    }
}
