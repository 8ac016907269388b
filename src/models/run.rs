use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use strum::Display;
use uuid::Uuid;

use super::batch::{ARCHIVE_SUFFIX, PROCESSING_PREFIX};
use super::manifest::MANIFEST_PREFIX;

/// Identifies one claim-process-publish run.
///
/// Format: `{instance-id}_{unix-millis}_{sequence}`. The instance id keeps
/// concurrent consumers apart, the sequence keeps runs of one consumer apart
/// even if the wall clock stalls or steps backwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunSignature(String);

impl RunSignature {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `parser_processing/{sig}.tgz`
    pub fn processing_key(&self) -> String {
        format!("{}{}{}", PROCESSING_PREFIX, self.0, ARCHIVE_SUFFIX)
    }

    /// `data_events/{sig}`
    pub fn manifest_key(&self) -> String {
        format!("{}{}", MANIFEST_PREFIX, self.0)
    }
}

impl fmt::Display for RunSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out run signatures for one consumer process.
#[derive(Debug)]
pub struct SignatureSource {
    instance_id: String,
    sequence: AtomicU64,
}

impl SignatureSource {
    pub fn new(instance_id: impl Into<String>) -> Result<Self, InvalidInstanceId> {
        let instance_id = instance_id.into();
        if instance_id.is_empty() || instance_id.contains('/') || instance_id.contains(char::is_whitespace) {
            return Err(InvalidInstanceId(instance_id));
        }
        Ok(Self {
            instance_id,
            sequence: AtomicU64::new(0),
        })
    }

    /// `{pid}-{8 hex chars}`: the pid alone collides across machines.
    pub fn default_instance_id() -> String {
        let nonce = Uuid::new_v4().simple().to_string();
        format!("{}-{}", std::process::id(), &nonce[..8])
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn next(&self) -> RunSignature {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let millis = Utc::now().timestamp_millis();
        RunSignature(format!("{}_{}_{}", self.instance_id, millis, seq))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Instance id must be non-empty and contain no '/' or whitespace: {0:?}")]
pub struct InvalidInstanceId(pub String);

/// Per-run state machine, logged on each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Idle,
    Scanning,
    Claimed,
    Materialized,
    Processed,
    Published,
    Restored,
    Cleanup,
}
