//! Object Store seam: blob storage addressed by bucket + key.
//!
//! The coordinator is the only caller and the only component that builds
//! keys; implementations treat keys as opaque strings.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("region `{0}` is not supported")]
    UnsupportedRegion(String),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("object store request failed: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ObjectStoreError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// Bytes and content type of a stored object.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write (or overwrite) an object.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> ObjectStoreResult<()>;

    /// Read an object back in full.
    async fn get_object(&self, bucket: &str, key: &str) -> ObjectStoreResult<StoredObject>;

    /// Remove an object. Removing a missing object is not an error.
    async fn remove_object(&self, bucket: &str, key: &str) -> ObjectStoreResult<()>;

    async fn bucket_exists(&self, bucket: &str) -> ObjectStoreResult<bool>;

    /// Create a bucket. Creating a bucket that already exists succeeds.
    async fn make_bucket(&self, bucket: &str, region: &str) -> ObjectStoreResult<()>;

    /// Readiness probe: the bucket must be reachable.
    async fn ping(&self, bucket: &str) -> ObjectStoreResult<()> {
        if self.bucket_exists(bucket).await? {
            Ok(())
        } else {
            Err(ObjectStoreError::BucketNotFound(bucket.to_string()))
        }
    }
}
