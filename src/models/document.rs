//! Represents an uploaded document and the handles used to address its bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

/// File extension appended to every blob key.
const BLOB_KEY_EXTENSION: &str = "pdf";

/// Process-generated identifier of a document (random UUID v4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for DocumentId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Object-store key of a document's bytes. Always derived from the id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlobKey(String);

impl BlobKey {
    pub fn for_document(id: DocumentId) -> Self {
        Self(format!("{}.{}", id, BLOB_KEY_EXTENSION))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocatorParseError {
    #[error("locator `{0}` is missing a `://` scheme separator")]
    MissingScheme(String),
    #[error("locator `{0}` has an empty scheme")]
    EmptyScheme(String),
    #[error("locator `{0}` has no bucket")]
    MissingBucket(String),
    #[error("locator `{0}` has no object key")]
    MissingKey(String),
}

/// Canonical external handle of a blob: `<scheme>://<bucket>/<key>`.
///
/// Bucket names never contain `/`, so the first `/` after the scheme always
/// separates bucket from key and the key keeps any slashes of its own.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StorageLocator {
    scheme: String,
    bucket: String,
    key: String,
}

impl StorageLocator {
    pub fn new(scheme: impl Into<String>, bucket: impl Into<String>, key: &BlobKey) -> Self {
        Self {
            scheme: scheme.into(),
            bucket: bucket.into(),
            key: key.as_str().to_string(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for StorageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}

impl FromStr for StorageLocator {
    type Err = LocatorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| LocatorParseError::MissingScheme(s.to_string()))?;
        if scheme.is_empty() {
            return Err(LocatorParseError::EmptyScheme(s.to_string()));
        }
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| LocatorParseError::MissingKey(s.to_string()))?;
        if bucket.is_empty() {
            return Err(LocatorParseError::MissingBucket(s.to_string()));
        }
        if key.is_empty() {
            return Err(LocatorParseError::MissingKey(s.to_string()));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

/// Descriptive attributes supplied with every upload or replace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentAttributes {
    pub file_name: String,
    pub file_size: i64,
    pub content_type: String,
}

/// A single metadata row in the `documents` table.
///
/// Only metadata lives here; the bytes are in the object store under the
/// key named by `storage_locator`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Document {
    /// Unique identifier, also the basis of the blob key.
    pub id: Uuid,

    /// `scheme://bucket/key` handle of the stored bytes.
    pub storage_locator: String,

    /// Original filename of the uploaded file.
    pub file_name: String,

    /// Size in bytes as reported by the uploader.
    pub file_size: i64,

    /// Content type (MIME type).
    pub content_type: String,

    /// When the current content was uploaded.
    pub uploaded_at: DateTime<Utc>,
}

impl Document {
    pub fn new(
        id: DocumentId,
        locator: &StorageLocator,
        attributes: DocumentAttributes,
        uploaded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.as_uuid(),
            storage_locator: locator.to_string(),
            file_name: attributes.file_name,
            file_size: attributes.file_size,
            content_type: attributes.content_type,
            uploaded_at,
        }
    }
}
