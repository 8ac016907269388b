use crate::models::batch::{BatchKey, ClaimedBatch, INBOX_PREFIX};
use crate::models::run::RunSignature;

use super::storage::{ObjectStore, StorageError};

/// Result of trying to move one inbox entry into the processing prefix.
#[derive(Debug, PartialEq, Eq)]
pub enum ClaimAttempt {
    Claimed(ClaimedBatch),
    /// Another consumer moved the batch first.
    RaceLost,
}

/// Fresh listing of claimable inbox entries. Never cached: every mutation
/// by any consumer can invalidate it.
pub async fn scan_inbox(store: &dyn ObjectStore) -> Result<Vec<BatchKey>, ClaimError> {
    let keys = store.list(INBOX_PREFIX).await.map_err(ClaimError::Listing)?;
    Ok(keys.iter().filter_map(|key| BatchKey::parse(key)).collect())
}

/// Claim `candidate` by copying it to the run's processing key and deleting
/// the inbox original.
///
/// A missing source at either step means a competitor got there first. That
/// is reported as `RaceLost`, never as an error. Any other store failure is
/// transient and leaves the batch in exactly one place: the inbox, or the
/// processing key when a delete that reported failure was in fact applied.
pub async fn try_claim(
    store: &dyn ObjectStore,
    candidate: &BatchKey,
    signature: &RunSignature,
) -> Result<ClaimAttempt, ClaimError> {
    let claim = ClaimedBatch::new(candidate.clone(), signature.clone());

    match store.copy(candidate.as_str(), &claim.processing_key).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {
            tracing::debug!(key = %candidate, run = %signature, "Batch vanished before copy, race lost");
            return Ok(ClaimAttempt::RaceLost);
        }
        Err(source) => {
            return Err(ClaimError::Transfer {
                key: candidate.to_string(),
                source,
            })
        }
    }

    match store.delete(candidate.as_str()).await {
        Ok(()) => Ok(claimed(claim)),
        Err(e) if e.is_not_found() => {
            // Our copy is keyed by our own signature, so nobody else can be
            // relying on it.
            discard_copy(store, &claim).await;
            tracing::debug!(key = %candidate, run = %signature, "Batch deleted by competitor after copy, race lost");
            Ok(ClaimAttempt::RaceLost)
        }
        Err(e) => settle_failed_delete(store, claim, e).await,
    }
}

/// A failed delete may still have been applied. The processing copy is only
/// dropped once the original is seen back in the inbox; otherwise it may be
/// the last copy of the batch and the claim stands.
async fn settle_failed_delete(
    store: &dyn ObjectStore,
    claim: ClaimedBatch,
    error: StorageError,
) -> Result<ClaimAttempt, ClaimError> {
    match store.exists(claim.origin.as_str()).await {
        Ok(true) => {
            discard_copy(store, &claim).await;
            Err(ClaimError::Transfer {
                key: claim.origin.to_string(),
                source: error,
            })
        }
        Ok(false) => {
            tracing::warn!(
                key = %claim.origin,
                error = %error,
                "Inbox delete reported failure but the batch is gone, keeping claim"
            );
            Ok(claimed(claim))
        }
        Err(check) => {
            tracing::warn!(
                key = %claim.origin,
                error = %error,
                check_error = %check,
                "Could not confirm inbox state after failed delete, keeping claim"
            );
            Ok(claimed(claim))
        }
    }
}

fn claimed(claim: ClaimedBatch) -> ClaimAttempt {
    metrics::counter!("parser_batches_claimed_total").increment(1);
    tracing::info!(
        key = %claim.origin,
        processing_key = %claim.processing_key,
        run = %claim.signature,
        "Claimed batch"
    );
    ClaimAttempt::Claimed(claim)
}

/// Scan the inbox and claim the first entry this consumer wins.
/// Returns `Ok(None)` when nothing is claimable.
pub async fn claim_next(
    store: &dyn ObjectStore,
    signature: &RunSignature,
) -> Result<Option<ClaimedBatch>, ClaimError> {
    for candidate in scan_inbox(store).await? {
        match try_claim(store, &candidate, signature).await? {
            ClaimAttempt::Claimed(claim) => return Ok(Some(claim)),
            ClaimAttempt::RaceLost => {
                metrics::counter!("parser_claim_races_lost_total").increment(1);
            }
        }
    }
    Ok(None)
}

async fn discard_copy(store: &dyn ObjectStore, claim: &ClaimedBatch) {
    if let Err(e) = store.delete(&claim.processing_key).await {
        if !e.is_not_found() {
            tracing::warn!(
                processing_key = %claim.processing_key,
                error = %e,
                "Failed to discard processing copy after abandoned claim"
            );
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("Failed to list inbox: {0}")]
    Listing(#[source] StorageError),

    #[error("Failed to move {key} into processing: {source}")]
    Transfer {
        key: String,
        #[source]
        source: StorageError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::batch::PROCESSING_PREFIX;
    use crate::models::run::SignatureSource;
    use crate::services::memory_store::MemoryStore;
    use async_trait::async_trait;

    #[derive(Clone, Copy)]
    enum Interference {
        /// A competitor moves the batch just before our copy.
        StealBeforeCopy,
        /// A competitor moves the batch between our copy and delete.
        StealBeforeDelete,
        /// The copy fails with a 503 and does nothing.
        CopyUnavailable,
        /// The inbox delete is applied, then the response is lost as a 503.
        DeleteAppliedThenUnavailable,
        /// The inbox delete fails with a 503 and does nothing.
        DeleteUnavailable,
    }

    /// Wraps a store and interferes with the claim sequence at a chosen
    /// point.
    struct InterferingStore {
        inner: MemoryStore,
        interference: Interference,
    }

    fn unavailable(key: &str) -> StorageError {
        StorageError::Status {
            key: key.to_string(),
            status: 503,
        }
    }

    impl InterferingStore {
        fn new(interference: Interference) -> Self {
            Self {
                inner: MemoryStore::new(),
                interference,
            }
        }

        fn move_away(&self, key: &str) {
            if let Some(data) = self.inner.remove(key) {
                self.inner.insert("parser_processing/competitor.tgz", data);
            }
        }
    }

    #[async_trait]
    impl ObjectStore for InterferingStore {
        async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
            self.inner.list(prefix).await
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
            self.inner.put(key, data, content_type).await
        }

        async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
            match self.interference {
                Interference::StealBeforeCopy => self.move_away(from),
                Interference::CopyUnavailable => return Err(unavailable(from)),
                _ => {}
            }
            self.inner.copy(from, to).await
        }

        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            if !key.starts_with(INBOX_PREFIX) {
                return self.inner.delete(key).await;
            }
            match self.interference {
                Interference::StealBeforeDelete => self.move_away(key),
                Interference::DeleteAppliedThenUnavailable => {
                    self.inner.delete(key).await?;
                    return Err(unavailable(key));
                }
                Interference::DeleteUnavailable => return Err(unavailable(key)),
                _ => {}
            }
            self.inner.delete(key).await
        }
    }

    fn signature() -> RunSignature {
        SignatureSource::new("test").unwrap().next()
    }

    #[tokio::test]
    async fn test_claim_moves_exactly_one_key() {
        let store = MemoryStore::new();
        store.insert("text_events/batch1.tgz", b"tarball".to_vec());
        let sig = signature();

        let claim = claim_next(&store, &sig).await.unwrap().unwrap();

        assert_eq!(claim.origin.as_str(), "text_events/batch1.tgz");
        assert_eq!(claim.processing_key, sig.processing_key());
        assert!(store.keys(INBOX_PREFIX).is_empty());
        assert_eq!(store.keys(PROCESSING_PREFIX), vec![sig.processing_key()]);
        assert_eq!(store.object(&claim.processing_key).unwrap(), b"tarball");
    }

    #[tokio::test]
    async fn test_claim_skips_non_archives() {
        let store = MemoryStore::new();
        store.insert("text_events/readme.txt", b"x".to_vec());
        store.insert("text_events/partial.tgz.tmp", b"x".to_vec());

        assert!(claim_next(&store, &signature()).await.unwrap().is_none());
        assert_eq!(store.keys(INBOX_PREFIX).len(), 2);
    }

    #[tokio::test]
    async fn test_empty_inbox_claims_nothing() {
        let store = MemoryStore::new();
        assert!(claim_next(&store, &signature()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_race_lost_at_copy_is_silent() {
        let store = InterferingStore::new(Interference::StealBeforeCopy);
        store.inner.insert("text_events/batch1.tgz", b"tarball".to_vec());
        let sig = signature();

        let claimed = claim_next(&store, &sig).await.unwrap();

        assert!(claimed.is_none());
        assert!(!store.inner.contains(&sig.processing_key()));
        assert_eq!(
            store.inner.keys(PROCESSING_PREFIX),
            vec!["parser_processing/competitor.tgz"]
        );
    }

    #[tokio::test]
    async fn test_race_lost_at_delete_discards_own_copy() {
        let store = InterferingStore::new(Interference::StealBeforeDelete);
        store.inner.insert("text_events/batch1.tgz", b"tarball".to_vec());
        let sig = signature();

        let attempt = try_claim(
            &store,
            &BatchKey::parse("text_events/batch1.tgz").unwrap(),
            &sig,
        )
        .await
        .unwrap();

        assert_eq!(attempt, ClaimAttempt::RaceLost);
        assert!(!store.inner.contains(&sig.processing_key()));
        assert!(store.inner.keys(INBOX_PREFIX).is_empty());
        assert_eq!(store.inner.keys(PROCESSING_PREFIX).len(), 1);
    }

    #[tokio::test]
    async fn test_race_loss_moves_on_to_next_candidate() {
        let store = InterferingStore::new(Interference::StealBeforeCopy);
        store.inner.insert("text_events/a.tgz", b"a".to_vec());
        store.inner.insert("text_events/b.tgz", b"b".to_vec());
        let sig = signature();

        // The competitor steals whatever we try to copy, so both are lost.
        assert!(claim_next(&store, &sig).await.unwrap().is_none());
        assert!(store.inner.keys(INBOX_PREFIX).is_empty());
    }

    #[tokio::test]
    async fn test_copy_fault_leaves_inbox_untouched() {
        let store = InterferingStore::new(Interference::CopyUnavailable);
        store.inner.insert("text_events/batch1.tgz", b"tarball".to_vec());
        let sig = signature();

        let err = claim_next(&store, &sig).await.unwrap_err();

        assert!(matches!(err, ClaimError::Transfer { ref key, .. } if key == "text_events/batch1.tgz"));
        assert_eq!(store.inner.object("text_events/batch1.tgz").unwrap(), b"tarball");
        assert!(store.inner.keys(PROCESSING_PREFIX).is_empty());
    }

    #[tokio::test]
    async fn test_applied_delete_reported_as_fault_keeps_claim() {
        let store = InterferingStore::new(Interference::DeleteAppliedThenUnavailable);
        store.inner.insert("text_events/batch1.tgz", b"tarball".to_vec());
        let sig = signature();

        let claim = claim_next(&store, &sig).await.unwrap().unwrap();

        assert_eq!(claim.processing_key, sig.processing_key());
        assert!(store.inner.keys(INBOX_PREFIX).is_empty());
        assert_eq!(store.inner.object(&sig.processing_key()).unwrap(), b"tarball");
    }

    #[tokio::test]
    async fn test_unapplied_delete_fault_discards_copy_only() {
        let store = InterferingStore::new(Interference::DeleteUnavailable);
        store.inner.insert("text_events/batch1.tgz", b"tarball".to_vec());
        let sig = signature();

        let err = try_claim(
            &store,
            &BatchKey::parse("text_events/batch1.tgz").unwrap(),
            &sig,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ClaimError::Transfer { .. }));
        assert_eq!(store.inner.object("text_events/batch1.tgz").unwrap(), b"tarball");
        assert!(store.inner.keys(PROCESSING_PREFIX).is_empty());
    }
}
