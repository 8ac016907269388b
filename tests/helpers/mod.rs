//! Test helper utilities for driving the poller against an in-memory store

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use nlp_parser_poller::{
    app_state::AppState,
    models::run::SignatureSource,
    services::{
        invoker::{InvokeError, ProcessOutcome, ProcessingStep},
        memory_store::MemoryStore,
        poller::{Poller, PollerSettings},
        recovery::RecoveryPolicy,
        retry::RetryPolicy,
        storage::{ObjectStore, StorageError},
    },
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::fixtures::BatchFixture;

/// Build a gzip-compressed tarball with one entry per document.
pub fn tarball(docs: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, body) in docs {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, body.as_bytes())
            .expect("append tar entry");
    }
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip")
}

/// Upload a fixture into the inbox, returning the archive bytes.
pub fn seed(store: &MemoryStore, fixture: &BatchFixture) -> Vec<u8> {
    let archive = tarball(fixture.docs);
    store.insert(fixture.key, archive.clone());
    archive
}

/// What the fake engine does when invoked.
#[derive(Debug, Clone)]
pub enum Script {
    /// Write `{input-name}_{sub_id}.xml` for every input, then exit 0.
    AnnotateEach { sub_id: &'static str },
    /// Exit with this code without writing anything.
    ExitWith(i32),
    /// Write the given output filenames, then exit 0.
    WriteFiles(Vec<&'static str>),
}

/// Stand-in for CoreNLP that honours the file list / output dir contract.
pub struct ScriptedEngine {
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessingStep for ScriptedEngine {
    async fn process(
        &self,
        file_list: &Path,
        output_dir: &Path,
    ) -> Result<ProcessOutcome, InvokeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let list = tokio::fs::read_to_string(file_list)
            .await
            .map_err(InvokeError::Wait)?;

        match &self.script {
            Script::AnnotateEach { sub_id } => {
                for line in list.lines() {
                    let input = Path::new(line);
                    let name = input.file_name().unwrap().to_str().unwrap();
                    let text = tokio::fs::read_to_string(input)
                        .await
                        .map_err(InvokeError::Wait)?;
                    let xml = format!("<document id=\"{name}\"><text>{text}</text></document>");
                    tokio::fs::write(output_dir.join(format!("{name}_{sub_id}.xml")), xml)
                        .await
                        .map_err(InvokeError::Wait)?;
                }
                Ok(ProcessOutcome::Succeeded)
            }
            Script::ExitWith(code) => Ok(ProcessOutcome::Failed {
                exit_code: Some(*code),
            }),
            Script::WriteFiles(names) => {
                for name in names {
                    tokio::fs::write(output_dir.join(name), "<document/>")
                        .await
                        .map_err(InvokeError::Wait)?;
                }
                Ok(ProcessOutcome::Succeeded)
            }
        }
    }
}

/// Wraps a `MemoryStore` and injects store faults.
pub struct FaultyStore {
    pub inner: Arc<MemoryStore>,
    /// Every `put` to a key under this prefix fails.
    pub fail_puts_under: Option<&'static str>,
    pub fail_lists: bool,
}

fn unavailable(key: &str) -> StorageError {
    StorageError::Status {
        key: key.to_string(),
        status: 503,
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        if self.fail_lists {
            return Err(unavailable(prefix));
        }
        self.inner.list(prefix).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        if matches!(self.fail_puts_under, Some(prefix) if key.starts_with(prefix)) {
            return Err(unavailable(key));
        }
        self.inner.put(key, data, content_type).await
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.inner.copy(from, to).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }
}

pub fn settings(max_batch_attempts: u32) -> PollerSettings {
    PollerSettings {
        poll_interval: Duration::from_millis(5),
        max_consecutive_faults: 3,
        recovery: RecoveryPolicy {
            max_batch_attempts,
            retry: RetryPolicy {
                attempts: 2,
                base_delay: Duration::from_millis(1),
            },
        },
    }
}

pub fn poller(
    store: Arc<dyn ObjectStore>,
    engine: Arc<dyn ProcessingStep>,
    work_dir: &Path,
    instance_id: &str,
    max_batch_attempts: u32,
) -> Poller {
    Poller::new(
        AppState::from_shared(store, engine),
        SignatureSource::new(instance_id).expect("valid instance id"),
        work_dir,
        settings(max_batch_attempts),
    )
}

/// True when no run left a working directory behind.
pub fn work_dir_is_empty(work_dir: &Path) -> bool {
    std::fs::read_dir(work_dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}
