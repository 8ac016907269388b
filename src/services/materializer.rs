use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tempfile::TempDir;

use crate::models::batch::ClaimedBatch;
use crate::models::run::RunSignature;

use super::storage::{ObjectStore, StorageError};

/// Private working tree of one run. Removed when dropped, on every path.
#[derive(Debug)]
pub struct RunWorkspace {
    root: TempDir,
    input_dir: PathBuf,
    output_dir: PathBuf,
    file_list: PathBuf,
}

impl RunWorkspace {
    pub fn create(work_dir: &Path, signature: &RunSignature) -> io::Result<Self> {
        fs::create_dir_all(work_dir)?;
        let root = tempfile::Builder::new()
            .prefix(&format!("run-{}-", signature))
            .tempdir_in(work_dir)?;
        // The file list must hold absolute paths.
        let base = fs::canonicalize(root.path())?;
        let input_dir = base.join("input");
        let output_dir = base.join("output");
        fs::create_dir(&input_dir)?;
        fs::create_dir(&output_dir)?;
        Ok(Self {
            file_list: base.join("filelist"),
            root,
            input_dir,
            output_dir,
        })
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn file_list(&self) -> &Path {
        &self.file_list
    }
}

/// A claimed batch unpacked into a run workspace.
#[derive(Debug)]
pub struct MaterializedBatch {
    /// Archive bytes exactly as claimed, kept for restoring on failure.
    pub archive: Vec<u8>,
    pub inputs: Vec<PathBuf>,
}

pub async fn download(
    store: &dyn ObjectStore,
    claim: &ClaimedBatch,
) -> Result<Vec<u8>, MaterializeError> {
    store
        .get(&claim.processing_key)
        .await
        .map_err(|source| MaterializeError::Download {
            key: claim.processing_key.clone(),
            source,
        })
}

/// Unpack `archive` into the workspace input directory and write the file
/// list the engine reads. Extraction runs on the blocking pool.
///
/// On failure the archive bytes are handed back with the error so the batch
/// can still be restored byte for byte.
pub async fn materialize(
    archive: Vec<u8>,
    workspace: &RunWorkspace,
) -> Result<MaterializedBatch, (Vec<u8>, MaterializeError)> {
    let input_dir = workspace.input_dir().to_path_buf();
    let file_list = workspace.file_list().to_path_buf();

    let joined = tokio::task::spawn_blocking(move || {
        let result = unpack_archive(&archive, &input_dir)
            .and_then(|()| collect_inputs(&input_dir))
            .and_then(|inputs| write_file_list(&file_list, &inputs).map(|()| inputs));
        (archive, result)
    })
    .await;

    match joined {
        Ok((archive, Ok(inputs))) => {
            tracing::debug!(inputs = inputs.len(), "Materialized batch");
            Ok(MaterializedBatch { archive, inputs })
        }
        Ok((archive, Err(e))) => Err((archive, e)),
        // The closure owned the bytes; a panicked extraction loses them and
        // recovery falls back to copying the processing key.
        Err(e) => Err((Vec::new(), MaterializeError::Join(e.to_string()))),
    }
}

/// Extract a gzip-compressed tarball, preserving entry names.
pub fn unpack_archive(archive: &[u8], dest: &Path) -> Result<(), MaterializeError> {
    let mut tarball = tar::Archive::new(GzDecoder::new(archive));
    tarball
        .unpack(dest)
        .map_err(|e| MaterializeError::Extract(e.to_string()))
}

/// Every regular file under `dir`, sorted by path.
pub fn collect_inputs(dir: &Path) -> Result<Vec<PathBuf>, MaterializeError> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    if files.is_empty() {
        return Err(MaterializeError::EmptyBatch);
    }
    files.sort();
    Ok(files)
}

/// One absolute path per line.
pub fn write_file_list(path: &Path, inputs: &[PathBuf]) -> Result<(), MaterializeError> {
    let body = inputs
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(path, body)?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("Failed to download {key}: {source}")]
    Download {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("Failed to extract batch archive: {0}")]
    Extract(String),

    #[error("Batch archive contains no files")]
    EmptyBatch,

    #[error("Workspace I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Extraction task failed: {0}")]
    Join(String),
}

impl MaterializeError {
    /// The archive itself is unusable, as opposed to the store or the host.
    pub fn is_bad_batch(&self) -> bool {
        matches!(self, MaterializeError::Extract(_) | MaterializeError::EmptyBatch)
    }

    /// The local workspace, not the batch or the store, failed.
    pub fn is_local(&self) -> bool {
        matches!(self, MaterializeError::Io(_) | MaterializeError::Join(_))
    }
}
