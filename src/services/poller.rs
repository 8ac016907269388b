use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::sleep;

use crate::app_state::AppState;
use crate::models::batch::ClaimedBatch;
use crate::models::run::{RunState, SignatureSource};

use super::claimer::{self, ClaimError};
use super::invoker::ProcessOutcome;
use super::materializer::{self, RunWorkspace};
use super::publisher::{self, PublishError};
use super::recovery::{self, Blame, RecoveryPolicy, Restored};

/// Cap on idle backoff, as a multiple of the poll interval.
const MAX_BACKOFF_FACTOR: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerSettings {
    pub poll_interval: Duration,
    pub max_consecutive_faults: u32,
    pub recovery: RecoveryPolicy,
}

/// What one iteration of the loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing claimable in the inbox.
    Idle,
    Published {
        signature: String,
        manifest_key: String,
        outputs: usize,
    },
    /// The run failed on a bad archive or a store fault; the batch was put
    /// back and the loop carries on.
    Restored { signature: String, restored: Restored },
}

/// Why the worker stopped taking new work.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HaltReason {
    #[error("processing step failed for {batch} ({outcome:?}); batch restored to {restored_to}")]
    ProcessingFailed {
        batch: String,
        outcome: ProcessOutcome,
        restored_to: String,
    },

    #[error("processing step could not run for {batch}: {error}; batch restored to {restored_to}")]
    EngineUnavailable {
        batch: String,
        error: String,
        restored_to: String,
    },

    #[error("engine output for {batch} failed integrity checks: {error}; batch restored to {restored_to}")]
    CorruptOutput {
        batch: String,
        error: String,
        restored_to: String,
    },

    #[error("local environment fault while running {batch}: {error}; batch restored to {restored_to}")]
    EnvironmentFault {
        batch: String,
        error: String,
        restored_to: String,
    },

    #[error("could not restore {batch}: {error}")]
    RecoveryFailed { batch: String, error: String },

    #[error("{count} consecutive object store faults, last: {last}")]
    StoreUnavailable { count: u32, last: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("Worker halted: {0}")]
    Halted(#[from] HaltReason),

    #[error(transparent)]
    Claim(#[from] ClaimError),
}

/// Claims batches one at a time and drives each through
/// materialize → process → publish, or restore on failure.
pub struct Poller {
    state: AppState,
    signatures: SignatureSource,
    work_dir: PathBuf,
    settings: PollerSettings,
}

impl Poller {
    pub fn new(
        state: AppState,
        signatures: SignatureSource,
        work_dir: impl Into<PathBuf>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            state,
            signatures,
            work_dir: work_dir.into(),
            settings,
        }
    }

    pub fn instance_id(&self) -> &str {
        self.signatures.instance_id()
    }

    /// Loop until halted or `shutdown` resolves. Shutdown is only observed
    /// between runs, so a run always reaches PUBLISHED or RESTORED first.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), PollerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut faults: u32 = 0;

        loop {
            let delay = match self.run_once().await {
                Ok(RunOutcome::Published { .. }) => {
                    faults = 0;
                    Duration::ZERO
                }
                Ok(RunOutcome::Idle) => {
                    faults = 0;
                    tracing::trace!(state = %RunState::Idle, "No batches available, sleeping");
                    self.settings.poll_interval
                }
                Ok(RunOutcome::Restored { .. }) => self.settings.poll_interval,
                Err(PollerError::Claim(e)) => {
                    faults += 1;
                    if faults >= self.settings.max_consecutive_faults.max(1) {
                        return Err(HaltReason::StoreUnavailable {
                            count: faults,
                            last: e.to_string(),
                        }
                        .into());
                    }
                    let delay = self.backoff(faults);
                    tracing::error!(
                        error = %e,
                        consecutive_faults = faults,
                        retry_in_ms = delay.as_millis() as u64,
                        "Object store fault, will retry"
                    );
                    delay
                }
                Err(halt) => return Err(halt),
            };

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, stopping poller");
                    return Ok(());
                }
                _ = sleep(delay) => {}
            }
        }
    }

    fn backoff(&self, faults: u32) -> Duration {
        let factor = 1u32 << faults.saturating_sub(1).min(MAX_BACKOFF_FACTOR.trailing_zeros());
        self.settings.poll_interval.saturating_mul(factor)
    }

    /// One pass: scan, claim at most one batch, and carry it to a terminal
    /// state. The working directory is gone by the time this returns.
    pub async fn run_once(&self) -> Result<RunOutcome, PollerError> {
        let signature = self.signatures.next();
        tracing::debug!(state = %RunState::Scanning, run = %signature, "Scanning inbox");

        let Some(claim) = claimer::claim_next(self.state.store.as_ref(), &signature).await? else {
            return Ok(RunOutcome::Idle);
        };
        tracing::info!(state = %RunState::Claimed, run = %signature, batch = %claim.origin, "Run started");

        let outcome = self.execute(&claim).await;
        tracing::debug!(state = %RunState::Cleanup, run = %signature, "Run workspace released");
        outcome
    }

    async fn execute(&self, claim: &ClaimedBatch) -> Result<RunOutcome, PollerError> {
        let store = self.state.store.as_ref();
        let policy = self.settings.recovery;

        let workspace = match RunWorkspace::create(&self.work_dir, &claim.signature) {
            Ok(ws) => ws,
            Err(e) => {
                let failure = format!("failed to create run workspace: {e}");
                return Err(self.halt_on_environment(claim, None, failure).await);
            }
        };

        let archive = match materializer::download(store, claim).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return self
                    .restore_and_continue(claim, None, &e.to_string(), Blame::Environment)
                    .await
            }
        };

        let batch = match materializer::materialize(archive, &workspace).await {
            Ok(batch) => batch,
            Err((bytes, e)) => {
                let bytes = (!bytes.is_empty()).then_some(bytes.as_slice());
                if e.is_local() {
                    return Err(self.halt_on_environment(claim, bytes, e.to_string()).await);
                }
                let blame = if e.is_bad_batch() {
                    Blame::Batch
                } else {
                    Blame::Environment
                };
                return self.restore_and_continue(claim, bytes, &e.to_string(), blame).await;
            }
        };
        tracing::info!(
            state = %RunState::Materialized,
            run = %claim.signature,
            inputs = batch.inputs.len(),
            workspace = %workspace.path().display(),
            "Batch materialized"
        );
        let archive = Some(batch.archive.as_slice());

        let processed = self
            .state
            .engine
            .process(workspace.file_list(), workspace.output_dir())
            .await;
        let outcome = match processed {
            Ok(outcome) if outcome.is_success() => outcome,
            Ok(outcome) => {
                let failure = format!("processing step failed: {outcome:?}");
                let restored = self.restore_or_halt(claim, archive, &failure, Blame::Batch).await?;
                return Err(HaltReason::ProcessingFailed {
                    batch: claim.origin.to_string(),
                    outcome,
                    restored_to: restored.key().to_string(),
                }
                .into());
            }
            Err(e) => {
                // The engine never ran, so the batch is not to blame.
                let failure = e.to_string();
                let restored = self
                    .restore_or_halt(claim, archive, &failure, Blame::Environment)
                    .await?;
                return Err(HaltReason::EngineUnavailable {
                    batch: claim.origin.to_string(),
                    error: failure,
                    restored_to: restored.key().to_string(),
                }
                .into());
            }
        };
        tracing::info!(state = %RunState::Processed, run = %claim.signature, outcome = ?outcome, "Processing finished");

        match publisher::publish(store, &claim.signature, workspace.output_dir(), policy.retry).await {
            Ok(manifest) => {
                publisher::retire(store, claim, policy.retry).await;
                metrics::counter!("parser_runs_published_total").increment(1);
                tracing::info!(
                    state = %RunState::Published,
                    run = %claim.signature,
                    batch = %claim.origin,
                    manifest_key = %manifest.key(),
                    outputs = manifest.keys.len(),
                    "Run committed"
                );
                Ok(RunOutcome::Published {
                    signature: claim.signature.to_string(),
                    manifest_key: manifest.key(),
                    outputs: manifest.keys.len(),
                })
            }
            Err(e) if e.is_data_integrity() => {
                let failure = e.to_string();
                let restored = self.restore_or_halt(claim, archive, &failure, Blame::Batch).await?;
                Err(HaltReason::CorruptOutput {
                    batch: claim.origin.to_string(),
                    error: failure,
                    restored_to: restored.key().to_string(),
                }
                .into())
            }
            Err(PublishError::Io(e)) => {
                let failure = format!("failed to read engine output: {e}");
                Err(self.halt_on_environment(claim, archive, failure).await)
            }
            Err(e) => {
                self.restore_and_continue(claim, archive, &e.to_string(), Blame::Environment)
                    .await
            }
        }
    }

    async fn restore_or_halt(
        &self,
        claim: &ClaimedBatch,
        archive: Option<&[u8]>,
        failure: &str,
        blame: Blame,
    ) -> Result<Restored, HaltReason> {
        tracing::error!(run = %claim.signature, batch = %claim.origin, failure, "Run failed");
        recovery::restore(
            self.state.store.as_ref(),
            claim,
            archive,
            failure,
            blame,
            self.settings.recovery,
        )
        .await
        .map(|restored| {
            tracing::warn!(state = %RunState::Restored, run = %claim.signature, to = %restored.key(), "Batch restored");
            restored
        })
        .map_err(|e| HaltReason::RecoveryFailed {
            batch: claim.origin.to_string(),
            error: e.to_string(),
        })
    }

    async fn restore_and_continue(
        &self,
        claim: &ClaimedBatch,
        archive: Option<&[u8]>,
        failure: &str,
        blame: Blame,
    ) -> Result<RunOutcome, PollerError> {
        let restored = self.restore_or_halt(claim, archive, failure, blame).await?;
        Ok(RunOutcome::Restored {
            signature: claim.signature.to_string(),
            restored,
        })
    }

    /// The host cannot run batches; put this one back untouched and stop
    /// rather than cycle the inbox through a broken worker.
    async fn halt_on_environment(
        &self,
        claim: &ClaimedBatch,
        archive: Option<&[u8]>,
        failure: String,
    ) -> PollerError {
        match self.restore_or_halt(claim, archive, &failure, Blame::Environment).await {
            Ok(restored) => HaltReason::EnvironmentFault {
                batch: claim.origin.to_string(),
                error: failure,
                restored_to: restored.key().to_string(),
            }
            .into(),
            Err(halt) => halt.into(),
        }
    }
}
