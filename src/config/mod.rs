use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::services::poller::PollerSettings;
use crate::services::recovery::RecoveryPolicy;
use crate::services::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Bucket holding the inbox, processing, output and manifest prefixes
    pub s3_bucket: String,

    /// AWS region name; used as the signing region for custom endpoints
    #[serde(default = "default_region")]
    pub s3_region: String,

    /// Custom S3-compatible endpoint (MinIO, R2). Enables path-style URLs.
    #[serde(default)]
    pub s3_endpoint: Option<String>,

    /// Access key ID. Falls back to the default credential chain when unset.
    #[serde(default)]
    pub s3_access_key: Option<String>,

    #[serde(default)]
    pub s3_secret_key: Option<String>,

    /// Distinguishes concurrent consumers in run signatures. Defaults to
    /// `{pid}-{random}`.
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Parent of the per-run working directories
    #[serde(default = "default_work_dir")]
    pub work_dir: String,

    #[serde(default = "default_java_bin")]
    pub java_bin: String,

    /// Directory holding the CoreNLP jars
    #[serde(default = "default_corenlp_dir")]
    pub corenlp_dir: String,

    /// Comma-separated jar names, resolved against `corenlp_dir`
    #[serde(default = "default_corenlp_jars")]
    pub corenlp_jars: Vec<String>,

    #[serde(default = "default_corenlp_main_class")]
    pub corenlp_main_class: String,

    /// Passed to the engine as `-threads`
    #[serde(default = "default_parser_threads")]
    pub parser_threads: u32,

    /// Wall-clock limit for one engine run
    #[serde(default = "default_parser_timeout_secs")]
    pub parser_timeout_secs: u64,

    /// Idle time between scans that found nothing to claim
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Consecutive store faults tolerated before the worker gives up
    #[serde(default = "default_max_consecutive_faults")]
    pub max_consecutive_faults: u32,

    /// Failed attempts before a batch is dead-lettered (0 disables)
    #[serde(default = "default_max_batch_attempts")]
    pub max_batch_attempts: u32,

    /// Prometheus scrape address, e.g. "0.0.0.0:9000". Disabled when unset.
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_work_dir() -> String {
    "/tmp/nlp-parser".to_string()
}

fn default_java_bin() -> String {
    "java".to_string()
}

fn default_corenlp_dir() -> String {
    "/home/ubuntu/corenlp/".to_string()
}

fn default_corenlp_jars() -> Vec<String> {
    [
        "stanford-corenlp-3.2.0.jar",
        "stanford-corenlp-3.2.0-models.jar",
        "xom.jar",
        "joda-time.jar",
        "jollyday.jar",
    ]
    .iter()
    .map(|jar| jar.to_string())
    .collect()
}

fn default_corenlp_main_class() -> String {
    "edu.stanford.nlp.pipeline.StanfordCoreNLP".to_string()
}

fn default_parser_threads() -> u32 {
    8
}

fn default_parser_timeout_secs() -> u64 {
    3600
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_max_consecutive_faults() -> u32 {
    10
}

fn default_max_batch_attempts() -> u32 {
    5
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.s3_bucket.trim().is_empty() {
            return Err(ConfigError::Invalid("S3_BUCKET must not be empty".into()));
        }
        if let Some(id) = &self.instance_id {
            if id.is_empty() || id.contains('/') || id.contains(char::is_whitespace) {
                return Err(ConfigError::Invalid(format!(
                    "INSTANCE_ID must be non-empty and contain no '/' or whitespace: {id:?}"
                )));
            }
        }
        if self.parser_threads == 0 {
            return Err(ConfigError::Invalid("PARSER_THREADS must be at least 1".into()));
        }
        if self.parser_timeout_secs == 0 {
            return Err(ConfigError::Invalid("PARSER_TIMEOUT_SECS must be at least 1".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("POLL_INTERVAL_SECS must be at least 1".into()));
        }
        if self.corenlp_jars.is_empty() {
            return Err(ConfigError::Invalid("CORENLP_JARS must list at least one jar".into()));
        }
        self.metrics_socket()?;
        Ok(())
    }

    pub fn metrics_socket(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.metrics_addr
            .as_deref()
            .map(|addr| {
                addr.parse()
                    .map_err(|_| ConfigError::Invalid(format!("METRICS_ADDR is not a socket address: {addr:?}")))
            })
            .transpose()
    }

    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_consecutive_faults: self.max_consecutive_faults,
            recovery: RecoveryPolicy {
                max_batch_attempts: self.max_batch_attempts,
                retry: RetryPolicy::default(),
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
