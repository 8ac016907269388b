use chrono::Utc;

use crate::models::attempt::AttemptRecord;
use crate::models::batch::ClaimedBatch;

use super::retry::{with_retry, RetryPolicy};
use super::storage::{ObjectStore, StorageError};

const ARCHIVE_CONTENT_TYPE: &str = "application/gzip";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Failed attempts after which a batch is dead-lettered. 0 disables.
    pub max_batch_attempts: u32,
    pub retry: RetryPolicy,
}

/// Whether a failed run counts against the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blame {
    /// The archive, or the engine's handling of it, is at fault.
    Batch,
    /// Host or store trouble unrelated to the batch contents. The attempt
    /// record is left alone so a sick worker cannot drain the inbox into the
    /// dead letter.
    Environment,
}

/// Where a failed batch was put back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Restored {
    Inbox { key: String, attempts: u32 },
    DeadLetter { key: String, attempts: u32 },
}

impl Restored {
    pub fn key(&self) -> &str {
        match self {
            Restored::Inbox { key, .. } | Restored::DeadLetter { key, .. } => key,
        }
    }
}

/// Undo a claim after a failed run.
///
/// Writes the archive back under its original inbox key (or the dead-letter
/// key once the batch has failed too often), then deletes the processing
/// copy. With `archive` present the exact claimed bytes are re-uploaded;
/// without it (download never finished) the processing copy is copied back.
/// Only failures blamed on the batch count toward dead-lettering.
pub async fn restore(
    store: &dyn ObjectStore,
    claim: &ClaimedBatch,
    archive: Option<&[u8]>,
    failure: &str,
    blame: Blame,
    policy: RecoveryPolicy,
) -> Result<Restored, RecoveryError> {
    let previous = previous_attempts(store, claim).await;
    let attempts = match blame {
        Blame::Batch => previous + 1,
        Blame::Environment => previous,
    };
    let dead_letter = blame == Blame::Batch
        && policy.max_batch_attempts > 0
        && attempts >= policy.max_batch_attempts;

    let restored = if dead_letter {
        Restored::DeadLetter {
            key: claim.origin.dead_letter_key(),
            attempts,
        }
    } else {
        if blame == Blame::Batch {
            record_attempt(store, claim, attempts, failure).await;
        }
        Restored::Inbox {
            key: claim.origin.to_string(),
            attempts,
        }
    };
    let destination = restored.key();

    let written = match archive {
        Some(bytes) => {
            with_retry(policy.retry, "restore batch", || {
                store.put(destination, bytes, ARCHIVE_CONTENT_TYPE)
            })
            .await
        }
        None => {
            with_retry(policy.retry, "restore batch", || {
                store.copy(&claim.processing_key, destination)
            })
            .await
        }
    };
    written.map_err(|source| RecoveryError::Restore {
        processing_key: claim.processing_key.clone(),
        destination: destination.to_string(),
        source,
    })?;

    match with_retry(policy.retry, "discard claim", || store.delete(&claim.processing_key)).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(source) => {
            return Err(RecoveryError::Discard {
                processing_key: claim.processing_key.clone(),
                source,
            })
        }
    }

    if dead_letter {
        let attempts_key = AttemptRecord::key_for(&claim.origin);
        if let Err(e) = store.delete(&attempts_key).await {
            if !e.is_not_found() {
                tracing::warn!(key = %attempts_key, error = %e, "Failed to clear attempt record");
            }
        }
        metrics::counter!("parser_batches_dead_lettered_total").increment(1);
        tracing::error!(
            origin = %claim.origin,
            dead_letter_key = %destination,
            attempts,
            run = %claim.signature,
            "Batch failed too many times, moved to dead letter"
        );
    } else {
        metrics::counter!("parser_runs_restored_total").increment(1);
        tracing::warn!(
            origin = %claim.origin,
            attempts,
            run = %claim.signature,
            blame = ?blame,
            failure,
            "Restored batch to inbox"
        );
    }

    Ok(restored)
}

async fn previous_attempts(store: &dyn ObjectStore, claim: &ClaimedBatch) -> u32 {
    let key = AttemptRecord::key_for(&claim.origin);
    match store.get(&key).await {
        Ok(body) => match serde_json::from_slice::<AttemptRecord>(&body) {
            Ok(record) => record.attempts,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Unreadable attempt record, counting from zero");
                0
            }
        },
        Err(e) if e.is_not_found() => 0,
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Failed to read attempt record, counting from zero");
            0
        }
    }
}

/// Best effort: a lost counter only delays dead-lettering.
async fn record_attempt(store: &dyn ObjectStore, claim: &ClaimedBatch, attempts: u32, failure: &str) {
    let key = AttemptRecord::key_for(&claim.origin);
    let record = AttemptRecord {
        attempts,
        last_failure: failure.to_string(),
        last_signature: claim.signature.to_string(),
        updated_at: Utc::now(),
    };
    let body = match serde_json::to_vec(&record) {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Failed to encode attempt record");
            return;
        }
    };
    if let Err(e) = store.put(&key, &body, "application/json").await {
        tracing::warn!(key = %key, error = %e, "Failed to write attempt record");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("Failed to restore {processing_key} to {destination}: {source}")]
    Restore {
        processing_key: String,
        destination: String,
        #[source]
        source: StorageError,
    },

    #[error("Restored batch but failed to delete claim record {processing_key}: {source}")]
    Discard {
        processing_key: String,
        #[source]
        source: StorageError,
    },
}
