use std::path::{Path, PathBuf};

use crate::models::attempt::AttemptRecord;
use crate::models::batch::ClaimedBatch;
use crate::models::manifest::Manifest;
use crate::models::output::{OutputId, OutputNameError};
use crate::models::run::RunSignature;

use super::retry::{with_retry, RetryPolicy};
use super::storage::{ObjectStore, StorageError};

const XML_CONTENT_TYPE: &str = "application/xml";
const MANIFEST_CONTENT_TYPE: &str = "text/plain";

/// An engine output file with its identity already decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub id: OutputId,
    pub path: PathBuf,
}

/// Decode every output filename before anything is uploaded, so a malformed
/// name fails the run with nothing published. Sorted by filename.
pub fn collect_outputs(output_dir: &Path) -> Result<Vec<OutputFile>, PublishError> {
    let mut outputs = Vec::new();
    for entry in std::fs::read_dir(output_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            tracing::warn!(path = %entry.path().display(), "Ignoring non-file entry in engine output");
            continue;
        }
        let name = entry.file_name();
        let name = name
            .to_str()
            .ok_or_else(|| OutputNameError::BadShape(name.to_string_lossy().into_owned()))?;
        outputs.push(OutputFile {
            id: OutputId::from_file_name(name)?,
            path: entry.path(),
        });
    }
    if outputs.is_empty() {
        return Err(PublishError::NoOutputs);
    }
    outputs.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
    Ok(outputs)
}

/// Upload every output, then write the manifest. The manifest goes last:
/// it is the commit record and must only reference confirmed uploads.
pub async fn publish(
    store: &dyn ObjectStore,
    signature: &RunSignature,
    output_dir: &Path,
    retry: RetryPolicy,
) -> Result<Manifest, PublishError> {
    let outputs = collect_outputs(output_dir)?;
    let mut keys = Vec::with_capacity(outputs.len());

    for output in &outputs {
        let key = output.id.destination_key();
        let data = tokio::fs::read(&output.path).await?;
        with_retry(retry, "upload output", || store.put(&key, &data, XML_CONTENT_TYPE))
            .await
            .map_err(|source| PublishError::Upload {
                key: key.clone(),
                source,
            })?;
        tracing::debug!(key = %key, bytes = data.len(), run = %signature, "Uploaded output");
        keys.push(key);
    }
    metrics::counter!("parser_outputs_published_total").increment(keys.len() as u64);

    let manifest = Manifest {
        signature: signature.clone(),
        keys,
    };
    let manifest_key = manifest.key();
    let body = manifest.body();
    with_retry(retry, "write manifest", || {
        store.put(&manifest_key, body.as_bytes(), MANIFEST_CONTENT_TYPE)
    })
    .await
    .map_err(|source| PublishError::Manifest {
        key: manifest_key.clone(),
        source,
    })?;

    tracing::info!(
        manifest_key = %manifest_key,
        outputs = manifest.keys.len(),
        run = %signature,
        "Wrote manifest"
    );
    Ok(manifest)
}

/// Retire a committed batch: drop the claim record and its attempt counter.
/// The manifest already exists, so failures here only leave garbage behind.
pub async fn retire(store: &dyn ObjectStore, claim: &ClaimedBatch, retry: RetryPolicy) {
    match with_retry(retry, "delete claim record", || store.delete(&claim.processing_key)).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => tracing::error!(
            processing_key = %claim.processing_key,
            run = %claim.signature,
            error = %e,
            "Failed to delete claim record of committed run"
        ),
    }

    let attempts_key = AttemptRecord::key_for(&claim.origin);
    if let Err(e) = store.delete(&attempts_key).await {
        if !e.is_not_found() {
            tracing::warn!(key = %attempts_key, error = %e, "Failed to clear attempt record");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Malformed engine output: {0}")]
    MalformedOutput(#[from] OutputNameError),

    #[error("Engine reported success but produced no output files")]
    NoOutputs,

    #[error("Failed to read engine output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to upload {key}: {source}")]
    Upload {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("Failed to write manifest {key}: {source}")]
    Manifest {
        key: String,
        #[source]
        source: StorageError,
    },
}

impl PublishError {
    /// Faults in what the engine produced, as opposed to store trouble.
    pub fn is_data_integrity(&self) -> bool {
        matches!(
            self,
            PublishError::MalformedOutput(_) | PublishError::NoOutputs
        )
    }
}
