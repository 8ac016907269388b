use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};

use crate::config::WorkerConfig;

/// Keyed blob operations the poller needs. Copy followed by delete is the
/// claim primitive, so both must report a missing source as `NotFound`
/// wherever the backend can tell.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// All keys under `prefix`, across every listing page.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    /// Server-side copy within the bucket.
    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Client for S3-compatible object storage.
pub struct S3Store {
    bucket: Box<Bucket>,
}

impl S3Store {
    pub fn new(
        bucket_name: &str,
        region: Region,
        credentials: Credentials,
        path_style: bool,
    ) -> Result<Self, StorageError> {
        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;
        let bucket = if path_style {
            bucket.with_path_style()
        } else {
            bucket
        };
        Ok(Self { bucket })
    }

    /// Custom endpoints (MinIO, R2) get path-style addressing. Missing keys
    /// fall back to rust-s3's credential chain (env, profile, instance role).
    pub fn from_config(config: &WorkerConfig) -> Result<Self, StorageError> {
        let region = match &config.s3_endpoint {
            Some(endpoint) => Region::Custom {
                region: config.s3_region.clone(),
                endpoint: endpoint.clone(),
            },
            None => config.s3_region.parse::<Region>().map_err(|e| {
                StorageError::Config(format!("invalid region {:?}: {}", config.s3_region, e))
            })?,
        };

        let credentials = Credentials::new(
            config.s3_access_key.as_deref(),
            config.s3_secret_key.as_deref(),
            None,
            None,
            None,
        )
        .map_err(|e| StorageError::Config(e.to_string()))?;

        Self::new(
            &config.s3_bucket,
            region,
            credentials,
            config.s3_endpoint.is_some(),
        )
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let pages = self
            .bucket
            .list(prefix.to_string(), None)
            .await
            .map_err(|e| classify(prefix, e))?;
        Ok(pages
            .into_iter()
            .flat_map(|page| page.contents.into_iter().map(|object| object.key))
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .bucket
            .get_object(key)
            .await
            .map_err(|e| classify(key, e))?;
        check_status(key, response.status_code())?;
        Ok(response.to_vec())
    }

    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await
            .map_err(|e| classify(key, e))?;
        check_status(key, response.status_code())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let status = self
            .bucket
            .copy_object_internal(from, to)
            .await
            .map_err(|e| classify(from, e))?;
        check_status(from, status)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .delete_object(key)
            .await
            .map_err(|e| classify(key, e))?;
        check_status(key, response.status_code())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let (_, status) = match self.bucket.head_object(key).await {
            Ok(head) => head,
            Err(e) => {
                let e = classify(key, e);
                return if e.is_not_found() { Ok(false) } else { Err(e) };
            }
        };
        match check_status(key, status) {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn check_status(key: &str, status: u16) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        status => Err(StorageError::Status {
            key: key.to_string(),
            status,
        }),
    }
}

fn classify(key: &str, error: S3Error) -> StorageError {
    match error {
        S3Error::HttpFailWithBody(404, _) => StorageError::NotFound(key.to_string()),
        other => StorageError::S3(other),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object store returned HTTP {status} for {key}")]
    Status { key: String, status: u16 },

    #[error("S3 operation failed: {0}")]
    S3(#[from] S3Error),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// The key was moved or deleted by someone else.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}
