//! src/services/local_store.rs
//!
//! LocalObjectStore: an `ObjectStore` that keeps payloads on local disk,
//! sharded beneath `base_path/{bucket}/{shard}/{shard}/{key}`. Buckets are
//! plain directories. The content type of each object lives in a hidden
//! sidecar file next to the payload.

use crate::services::object_store::{
    ObjectStore, ObjectStoreError, ObjectStoreResult, StoredObject,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const STAGE_ATTEMPTS: usize = 3;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const SUPPORTED_REGIONS: [&str; 16] = [
    "local",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "ap-southeast-1",
    "ap-northeast-1",
    "ap-south-1",
    "ap-south-2",
    "ap-southeast-2",
    "ap-southeast-3",
    "ap-southeast-4",
    "ap-northeast-2",
    "ap-northeast-3",
    "me-south-1",
];

#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    /// Base directory on disk where buckets live.
    pub base_path: PathBuf,
}

impl LocalObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Rejects keys that begin with `/` or contain `..`.
    fn ensure_key_safe(&self, key: &str) -> ObjectStoreResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(ObjectStoreError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.ends_with('/') || key.contains("..") {
            return Err(ObjectStoreError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(ObjectStoreError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// Enforces S3-like naming rules:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    fn ensure_bucket_name_safe(&self, name: &str) -> ObjectStoreResult<()> {
        let invalid = |reason: &str| ObjectStoreError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.into(),
        };

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }

        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }

        if name.starts_with('.')
            || name.ends_with('.')
            || name.starts_with('-')
            || name.ends_with('-')
        {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }

        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }

        if is_ipv4_like(name) {
            return Err(invalid("must not be formatted like an IP address"));
        }

        Ok(())
    }

    /// Case-insensitive check against SUPPORTED_REGIONS.
    fn ensure_region_valid(&self, region: &str) -> ObjectStoreResult<()> {
        if SUPPORTED_REGIONS
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(region))
        {
            Ok(())
        } else {
            Err(ObjectStoreError::UnsupportedRegion(region.to_string()))
        }
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    /// Two-level shard directories for a key: the first two bytes of
    /// MD5(bucket/key) as lowercase hex.
    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// `base_path/bucket/{shard}/{shard}/{key}`. Parents may not exist yet.
    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket, key);
        let mut path = self.bucket_root(bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn content_type_path(object_path: &Path) -> PathBuf {
        let file_name = object_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        object_path.with_file_name(format!(".{}.content-type", file_name))
    }

    async fn ensure_bucket_present(&self, bucket: &str) -> ObjectStoreResult<()> {
        if self.bucket_exists(bucket).await? {
            Ok(())
        } else {
            Err(ObjectStoreError::BucketNotFound(bucket.to_string()))
        }
    }

    /// Write `bytes` to a fresh temp file in `dir` and fsync it.
    ///
    /// A concurrent `remove_object` in the same shard may prune `dir` between
    /// creating it and creating the temp file, so the directory is recreated
    /// and the write retried.
    async fn stage(dir: &Path, bytes: &[u8]) -> ObjectStoreResult<PathBuf> {
        let mut attempt = 1;
        loop {
            fs::create_dir_all(dir).await?;
            let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
            let file = match File::create(&tmp_path).await {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::NotFound && attempt < STAGE_ATTEMPTS => {
                    debug!("{} pruned concurrently, retrying", dir.display());
                    attempt += 1;
                    continue;
                }
                Err(err) => return Err(ObjectStoreError::Io(err)),
            };

            let written = async move {
                let mut file = file;
                file.write_all(bytes).await?;
                file.flush().await?;
                file.sync_all().await
            }
            .await;
            return match written {
                Ok(()) => Ok(tmp_path),
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    Err(ObjectStoreError::Io(err))
                }
            };
        }
    }

    /// Rename a staged temp file over `target`. The temp file is removed on failure.
    async fn publish(tmp_path: &Path, target: &Path) -> ObjectStoreResult<()> {
        let renamed = match fs::rename(tmp_path, target).await {
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                match fs::remove_file(target).await {
                    Ok(()) => fs::rename(tmp_path, target).await,
                    Err(err) => Err(err),
                }
            }
            other => other,
        };
        if let Err(err) = renamed {
            let _ = fs::remove_file(tmp_path).await;
            return Err(ObjectStoreError::Io(err));
        }
        Ok(())
    }

    /// Remove a file, treating "already gone" as success.
    async fn remove_if_present(path: &Path) -> ObjectStoreResult<()> {
        match fs::remove_file(path).await {
            Ok(_) => {
                debug!("removed file {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", path.display());
                Ok(())
            }
            Err(err) => Err(ObjectStoreError::Io(err)),
        }
    }

    /// Remove empty directories from `start` up to (not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> ObjectStoreResult<()> {
        self.ensure_key_safe(key)?;
        self.ensure_bucket_present(bucket).await?;

        let file_path = self.object_path(bucket, key);
        let sidecar_path = Self::content_type_path(&file_path);
        let parent = file_path.parent().ok_or_else(|| {
            ObjectStoreError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;

        // Both files are staged before either replaces the current object, and
        // the payload goes first: a failed put never relabels the old bytes.
        let payload_tmp = Self::stage(parent, &bytes).await?;
        let sidecar_tmp = match Self::stage(parent, content_type.as_bytes()).await {
            Ok(path) => path,
            Err(err) => {
                let _ = fs::remove_file(&payload_tmp).await;
                return Err(err);
            }
        };
        if let Err(err) = Self::publish(&payload_tmp, &file_path).await {
            let _ = fs::remove_file(&sidecar_tmp).await;
            return Err(err);
        }
        Self::publish(&sidecar_tmp, &sidecar_path).await?;

        debug!(bucket, key, size = bytes.len(), "stored object on disk");
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> ObjectStoreResult<StoredObject> {
        self.ensure_key_safe(key)?;
        self.ensure_bucket_present(bucket).await?;

        let file_path = self.object_path(bucket, key);
        let bytes = fs::read(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ObjectStoreError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                ObjectStoreError::Io(err)
            }
        })?;
        let content_type = fs::read_to_string(Self::content_type_path(&file_path))
            .await
            .ok();

        Ok(StoredObject {
            bytes: Bytes::from(bytes),
            content_type,
        })
    }

    async fn remove_object(&self, bucket: &str, key: &str) -> ObjectStoreResult<()> {
        self.ensure_key_safe(key)?;
        self.ensure_bucket_present(bucket).await?;

        let file_path = self.object_path(bucket, key);
        Self::remove_if_present(&file_path).await?;
        Self::remove_if_present(&Self::content_type_path(&file_path)).await?;

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(bucket);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> ObjectStoreResult<bool> {
        self.ensure_bucket_name_safe(bucket)?;
        match fs::metadata(self.bucket_root(bucket)).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(ObjectStoreError::Io(err)),
        }
    }

    async fn make_bucket(&self, bucket: &str, region: &str) -> ObjectStoreResult<()> {
        self.ensure_bucket_name_safe(bucket)?;
        self.ensure_region_valid(&region.to_lowercase())?;
        fs::create_dir_all(self.bucket_root(bucket)).await?;
        Ok(())
    }
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|segment| {
        !segment.is_empty()
            && segment.len() <= 3
            && segment.chars().all(|c| c.is_ascii_digit())
            && segment.parse::<u8>().is_ok()
    })
}
