use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::WorkerConfig;

/// Outcome of one engine invocation, judged by exit status alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Succeeded,
    /// Non-zero exit, or `None` when killed by a signal.
    Failed { exit_code: Option<i32> },
    TimedOut { after: Duration },
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessOutcome::Succeeded)
    }
}

/// The external annotation step: reads the file list, writes annotated
/// documents into `output_dir`. Partial output never counts as success.
#[async_trait]
pub trait ProcessingStep: Send + Sync {
    async fn process(
        &self,
        file_list: &Path,
        output_dir: &Path,
    ) -> Result<ProcessOutcome, InvokeError>;
}

/// Stanford CoreNLP run as a Java subprocess.
#[derive(Debug, Clone)]
pub struct CoreNlp {
    java_bin: String,
    classpath: String,
    main_class: String,
    threads: u32,
    timeout: Duration,
}

impl CoreNlp {
    pub fn new(
        java_bin: impl Into<String>,
        corenlp_dir: &Path,
        jars: &[String],
        main_class: impl Into<String>,
        threads: u32,
        timeout: Duration,
    ) -> Self {
        let classpath = jars
            .iter()
            .map(|jar| corenlp_dir.join(jar).display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        Self {
            java_bin: java_bin.into(),
            classpath,
            main_class: main_class.into(),
            threads,
            timeout,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(
            config.java_bin.clone(),
            &PathBuf::from(&config.corenlp_dir),
            &config.corenlp_jars,
            config.corenlp_main_class.clone(),
            config.parser_threads,
            Duration::from_secs(config.parser_timeout_secs),
        )
    }

    pub fn command(&self, file_list: &Path, output_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.java_bin);
        cmd.arg("-cp")
            .arg(&self.classpath)
            .arg(&self.main_class)
            .arg("-filelist")
            .arg(file_list)
            .arg("-outputDirectory")
            .arg(output_dir)
            .arg("-threads")
            .arg(self.threads.to_string());
        cmd
    }
}

#[async_trait]
impl ProcessingStep for CoreNlp {
    async fn process(
        &self,
        file_list: &Path,
        output_dir: &Path,
    ) -> Result<ProcessOutcome, InvokeError> {
        tracing::info!(
            file_list = %file_list.display(),
            output_dir = %output_dir.display(),
            threads = self.threads,
            "Starting CoreNLP"
        );
        run_with_timeout(self.command(file_list, output_dir), self.timeout).await
    }
}

/// Spawn `cmd` and wait for it, killing it once `timeout` elapses.
pub async fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
) -> Result<ProcessOutcome, InvokeError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(InvokeError::Spawn)?;

    let outcome = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            let status = status.map_err(InvokeError::Wait)?;
            if status.success() {
                ProcessOutcome::Succeeded
            } else {
                ProcessOutcome::Failed {
                    exit_code: status.code(),
                }
            }
        }
        Err(_) => {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill timed-out engine process");
            }
            ProcessOutcome::TimedOut { after: timeout }
        }
    };

    metrics::histogram!("parser_processing_seconds").record(started.elapsed().as_secs_f64());
    tracing::info!(
        outcome = ?outcome,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Engine finished"
    );
    Ok(outcome)
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("Failed to start engine: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed waiting for engine: {0}")]
    Wait(#[source] std::io::Error),
}
