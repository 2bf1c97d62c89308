//! src/services/document_service.rs
//!
//! DocumentService: coordinates the object store (document bytes) and the
//! metadata repository (one row per document) so that every metadata row
//! points at a blob that exists.
//!
//! Write ordering:
//! - upload:  blob first, then row; a failed row insert retracts the row
//!   (it may have committed) and only then removes the blob.
//! - replace: blob overwrite, then row update; a failed update is reported
//!   and the row lags one generation behind the bytes until retried.
//! - delete:  row first, then blob; a failed blob removal leaves an orphan
//!   that is logged, the delete itself still succeeds.
//!
//! Backend error detail is logged here and never crosses this boundary;
//! callers only see a `DocumentError` kind.

use crate::{
    models::document::{
        BlobKey, Document, DocumentAttributes, DocumentId, StorageLocator,
    },
    services::{
        metadata_repository::MetadataRepository,
        object_store::{ObjectStore, ObjectStoreError, StoredObject},
    },
};
use bytes::Bytes;
use chrono::Utc;
use std::{fmt, future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Bootstrap step that failed during `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    Schema,
    Bucket,
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitStage::Schema => f.write_str("metadata schema"),
            InitStage::Bucket => f.write_str("object store bucket"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("document `{0}` not found")]
    NotFound(DocumentId),
    #[error("failed to store document data")]
    StorageWriteFailure,
    #[error("failed to read document data")]
    StorageReadFailure,
    #[error("failed to save document metadata")]
    MetadataWriteFailure,
    #[error("failed to read document metadata")]
    MetadataReadFailure,
    #[error("failed to initialize {stage}")]
    InitializationFailure { stage: InitStage },
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// Bytes plus descriptive attributes handed over by the API layer.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub bytes: Bytes,
    pub file_name: String,
    pub size: i64,
    pub content_type: String,
}

impl UploadRequest {
    fn into_parts(self) -> (Bytes, DocumentAttributes) {
        (
            self.bytes,
            DocumentAttributes {
                file_name: self.file_name,
                file_size: self.size,
                content_type: self.content_type,
            },
        )
    }
}

#[derive(Debug, Clone)]
pub struct DocumentServiceConfig {
    /// Bucket holding every document blob.
    pub bucket: String,
    /// Region passed to `make_bucket` when the bucket is missing.
    pub region: String,
    /// Scheme of the persisted storage locators, e.g. `minio`.
    pub locator_scheme: String,
    /// Upper bound on every individual backend call.
    pub operation_timeout: Duration,
}

impl Default for DocumentServiceConfig {
    fn default() -> Self {
        Self {
            bucket: "pdfs".into(),
            region: "us-east-1".into(),
            locator_scheme: "minio".into(),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of a single bounded backend call.
#[derive(Debug, Error)]
enum StepError<E: std::error::Error + 'static> {
    #[error(transparent)]
    Backend(E),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

async fn within<T, E, F>(limit: Duration, step: F) -> Result<T, StepError<E>>
where
    E: std::error::Error + 'static,
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, step).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(StepError::Backend(err)),
        Err(_) => Err(StepError::TimedOut(limit)),
    }
}

/// Undo of a partially completed upload.
///
/// Once the metadata insert has been issued it may have committed even if
/// the caller never saw the reply, so the row is retracted first and the
/// blob is only removed once the row is known to be gone. A row that cannot
/// be retracted keeps its blob; an orphaned blob is preferable to a row that
/// resolves to nothing.
struct Rollback {
    objects: Arc<dyn ObjectStore>,
    row: Option<(Arc<dyn MetadataRepository>, DocumentId)>,
    bucket: String,
    key: BlobKey,
    limit: Duration,
}

impl Rollback {
    async fn execute(self) {
        if let Some((metadata, id)) = &self.row {
            match within(self.limit, metadata.delete_returning_locator(*id)).await {
                Ok(Some(_)) => warn!(document_id = %id, "retracted metadata row of failed upload"),
                Ok(None) => {}
                Err(err) => {
                    error!(
                        document_id = %id,
                        bucket = %self.bucket,
                        key = %self.key,
                        error = %err,
                        "could not retract metadata row; keeping blob, it may be orphaned"
                    );
                    return;
                }
            }
        }

        match within(
            self.limit,
            self.objects.remove_object(&self.bucket, self.key.as_str()),
        )
        .await
        {
            Ok(()) => info!(bucket = %self.bucket, key = %self.key, "removed orphaned blob"),
            Err(err) => error!(
                bucket = %self.bucket,
                key = %self.key,
                error = %err,
                "failed to clean up orphaned blob"
            ),
        }
    }
}

/// Guard over an in-flight upload: rolls it back unless disarmed.
///
/// An armed guard that is dropped (the request future was cancelled) hands
/// the rollback to a detached task on the current runtime.
struct BlobCompensation {
    rollback: Option<Rollback>,
}

impl BlobCompensation {
    fn arm(objects: Arc<dyn ObjectStore>, bucket: &str, key: &BlobKey, limit: Duration) -> Self {
        Self {
            rollback: Some(Rollback {
                objects,
                row: None,
                bucket: bucket.to_string(),
                key: key.clone(),
                limit,
            }),
        }
    }

    /// From here on the metadata row for `id` may exist.
    fn cover_row(&mut self, metadata: Arc<dyn MetadataRepository>, id: DocumentId) {
        if let Some(rollback) = self.rollback.as_mut() {
            rollback.row = Some((metadata, id));
        }
    }

    fn disarm(mut self) {
        self.rollback = None;
    }

    /// Roll back now. Failures are logged only.
    async fn run(mut self) {
        if let Some(rollback) = self.rollback.take() {
            rollback.execute().await;
        }
    }
}

impl Drop for BlobCompensation {
    fn drop(&mut self) {
        let Some(rollback) = self.rollback.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    bucket = %rollback.bucket,
                    key = %rollback.key,
                    "upload cancelled; rolling back"
                );
                handle.spawn(rollback.execute());
            }
            Err(_) => error!(
                bucket = %rollback.bucket,
                key = %rollback.key,
                "upload cancelled outside a runtime; blob left orphaned"
            ),
        }
    }
}

/// Stateless coordinator over the two shared backends. Cloning is cheap.
#[derive(Clone)]
pub struct DocumentService {
    objects: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataRepository>,
    config: Arc<DocumentServiceConfig>,
}

impl DocumentService {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataRepository>,
        config: DocumentServiceConfig,
    ) -> Self {
        Self {
            objects,
            metadata,
            config: Arc::new(config),
        }
    }

    fn timeout(&self) -> Duration {
        self.config.operation_timeout
    }

    fn locator_for(&self, key: &BlobKey) -> StorageLocator {
        StorageLocator::new(&self.config.locator_scheme, &self.config.bucket, key)
    }

    /// Ensure the metadata schema and the bucket exist.
    ///
    /// Safe to call repeatedly and concurrently: the schema uses
    /// `IF NOT EXISTS` and the bucket is only created when missing.
    pub async fn initialize(&self) -> DocumentResult<()> {
        if let Err(err) = within(self.timeout(), self.metadata.ensure_schema()).await {
            error!(error = %err, "failed to initialize metadata schema");
            return Err(DocumentError::InitializationFailure {
                stage: InitStage::Schema,
            });
        }
        info!("metadata schema initialized");

        let bucket = &self.config.bucket;
        let bucket_failure = |err: &dyn fmt::Display| {
            error!(bucket = %bucket, error = %err, "failed to initialize bucket");
            DocumentError::InitializationFailure {
                stage: InitStage::Bucket,
            }
        };

        let exists = within(self.timeout(), self.objects.bucket_exists(bucket))
            .await
            .map_err(|err| bucket_failure(&err))?;
        if exists {
            info!(bucket = %bucket, "bucket already exists");
        } else {
            within(
                self.timeout(),
                self.objects.make_bucket(bucket, &self.config.region),
            )
            .await
            .map_err(|err| bucket_failure(&err))?;
            info!(bucket = %bucket, region = %self.config.region, "bucket created");
        }
        Ok(())
    }

    /// Store a new document and return its generated id.
    pub async fn upload(&self, request: UploadRequest) -> DocumentResult<DocumentId> {
        let id = DocumentId::new();
        let key = BlobKey::for_document(id);
        let locator = self.locator_for(&key);
        let (bytes, attributes) = request.into_parts();
        let bucket = self.config.bucket.as_str();

        // Armed before the write so a cancelled put is cleaned up too.
        let mut compensation =
            BlobCompensation::arm(self.objects.clone(), bucket, &key, self.timeout());

        let put = self
            .objects
            .put_object(bucket, key.as_str(), bytes, &attributes.content_type);
        match within(self.timeout(), put).await {
            Ok(()) => {}
            Err(StepError::Backend(err)) => {
                compensation.disarm();
                error!(document_id = %id, key = %key, error = %err, "object store write failed");
                return Err(DocumentError::StorageWriteFailure);
            }
            Err(err @ StepError::TimedOut(_)) => {
                error!(document_id = %id, key = %key, error = %err, "object store write failed");
                compensation.run().await;
                return Err(DocumentError::StorageWriteFailure);
            }
        }

        let document = Document::new(id, &locator, attributes, Utc::now());
        compensation.cover_row(self.metadata.clone(), id);
        if let Err(err) = within(self.timeout(), self.metadata.insert(&document)).await {
            error!(
                document_id = %id,
                error = %err,
                "metadata insert failed; rolling back object store write"
            );
            compensation.run().await;
            return Err(DocumentError::MetadataWriteFailure);
        }
        compensation.disarm();

        info!(
            document_id = %id,
            locator = %locator,
            size = document.file_size,
            "document uploaded"
        );
        Ok(id)
    }

    /// Look up the storage locator of a document. Never touches the object store.
    pub async fn resolve(&self, id: DocumentId) -> DocumentResult<StorageLocator> {
        let raw = self
            .lookup_locator(id)
            .await?
            .ok_or(DocumentError::NotFound(id))?;
        parse_locator(id, &raw)
    }

    /// Full metadata row of a document.
    pub async fn describe(&self, id: DocumentId) -> DocumentResult<Document> {
        match within(self.timeout(), self.metadata.find(id)).await {
            Ok(Some(document)) => Ok(document),
            Ok(None) => Err(DocumentError::NotFound(id)),
            Err(err) => {
                error!(document_id = %id, error = %err, "metadata lookup failed");
                Err(DocumentError::MetadataReadFailure)
            }
        }
    }

    /// Metadata row plus the stored bytes of a document.
    pub async fn download(&self, id: DocumentId) -> DocumentResult<(Document, StoredObject)> {
        let document = self.describe(id).await?;
        let locator = parse_locator(id, &document.storage_locator)?;

        let get = self.objects.get_object(locator.bucket(), locator.key());
        match within(self.timeout(), get).await {
            Ok(object) => Ok((document, object)),
            Err(StepError::Backend(ObjectStoreError::ObjectNotFound { .. })) => {
                error!(document_id = %id, locator = %locator, "metadata row has no blob");
                Err(DocumentError::NotFound(id))
            }
            Err(err) => {
                error!(document_id = %id, locator = %locator, error = %err, "object store read failed");
                Err(DocumentError::StorageReadFailure)
            }
        }
    }

    /// Overwrite the content and attributes of an existing document in place.
    pub async fn replace(&self, id: DocumentId, request: UploadRequest) -> DocumentResult<()> {
        let raw = self
            .lookup_locator(id)
            .await?
            .ok_or(DocumentError::NotFound(id))?;
        let locator = parse_locator(id, &raw)?;
        let (bytes, attributes) = request.into_parts();

        let put = self.objects.put_object(
            locator.bucket(),
            locator.key(),
            bytes,
            &attributes.content_type,
        );
        if let Err(err) = within(self.timeout(), put).await {
            error!(document_id = %id, locator = %locator, error = %err, "object store overwrite failed");
            return Err(DocumentError::StorageWriteFailure);
        }

        let update = self
            .metadata
            .update_attributes(id, &attributes, Utc::now());
        match within(self.timeout(), update).await {
            Ok(true) => {
                info!(document_id = %id, locator = %locator, "document replaced");
                Ok(())
            }
            Ok(false) => {
                // A concurrent delete removed the row after our lookup; the
                // bytes just written belong to nobody.
                warn!(document_id = %id, locator = %locator, "document deleted during replace");
                self.remove_blob(id, &locator).await;
                Err(DocumentError::NotFound(id))
            }
            Err(err) => {
                error!(
                    document_id = %id,
                    locator = %locator,
                    error = %err,
                    "metadata update failed after content was overwritten"
                );
                Err(DocumentError::MetadataWriteFailure)
            }
        }
    }

    /// Remove a document. The row is authoritative: once it is gone the
    /// delete succeeds even if the blob cannot be removed.
    pub async fn delete(&self, id: DocumentId) -> DocumentResult<()> {
        let raw = match within(self.timeout(), self.metadata.delete_returning_locator(id)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Err(DocumentError::NotFound(id)),
            Err(err) => {
                error!(document_id = %id, error = %err, "metadata delete failed");
                return Err(DocumentError::MetadataWriteFailure);
            }
        };

        match raw.parse::<StorageLocator>() {
            Ok(locator) => self.remove_blob(id, &locator).await,
            Err(err) => warn!(
                document_id = %id,
                locator = %raw,
                error = %err,
                "could not parse storage locator; blob left in place"
            ),
        }

        info!(document_id = %id, "document deleted");
        Ok(())
    }

    /// Readiness of the metadata repository.
    pub async fn check_metadata(&self) -> Result<(), String> {
        within(self.timeout(), self.metadata.ping())
            .await
            .map_err(|err| err.to_string())
    }

    /// Readiness of the object store bucket.
    pub async fn check_object_store(&self) -> Result<(), String> {
        within(self.timeout(), self.objects.ping(&self.config.bucket))
            .await
            .map_err(|err| err.to_string())
    }

    async fn lookup_locator(&self, id: DocumentId) -> DocumentResult<Option<String>> {
        within(self.timeout(), self.metadata.find_locator(id))
            .await
            .map_err(|err| {
                error!(document_id = %id, error = %err, "metadata lookup failed");
                DocumentError::MetadataReadFailure
            })
    }

    /// Best-effort blob removal; a failure leaves an orphaned blob behind.
    async fn remove_blob(&self, id: DocumentId, locator: &StorageLocator) {
        let remove = self
            .objects
            .remove_object(locator.bucket(), locator.key());
        match within(self.timeout(), remove).await {
            Ok(()) => debug!(document_id = %id, locator = %locator, "blob removed"),
            Err(err) => warn!(
                document_id = %id,
                locator = %locator,
                error = %err,
                "failed to remove blob; it is now orphaned"
            ),
        }
    }
}

fn parse_locator(id: DocumentId, raw: &str) -> DocumentResult<StorageLocator> {
    raw.parse().map_err(|err| {
        error!(document_id = %id, locator = %raw, error = %err, "stored locator is malformed");
        DocumentError::MetadataReadFailure
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        local_store::LocalObjectStore,
        metadata_repository::{RepositoryError, RepositoryResult, SqliteMetadataRepository},
        object_store::{ObjectStoreError, ObjectStoreResult, StoredObject},
    };
    use async_trait::async_trait;
    use chrono::DateTime;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const PDF_MAGIC: &[u8] = b"%PDF-1.7\n%\xE2\xE3\xCF\xD3\n";

    /// Switches flipped by tests to make a backend step fail.
    #[derive(Default)]
    struct Faults {
        fail_put: AtomicBool,
        stall_put: AtomicBool,
        fail_get: AtomicBool,
        fail_remove: AtomicBool,
        fail_schema: AtomicBool,
        fail_insert: AtomicBool,
        /// Commit the insert, then never reply.
        hang_after_insert: AtomicBool,
        fail_update: AtomicBool,
        /// Delete the row just before the update runs.
        delete_during_update: AtomicBool,
        fail_delete: AtomicBool,
        fail_find: AtomicBool,
    }

    fn injected() -> ObjectStoreError {
        ObjectStoreError::Backend("injected failure".into())
    }

    fn injected_sql() -> RepositoryError {
        RepositoryError::Sqlx(sqlx::Error::Protocol("injected failure".into()))
    }

    struct FaultyObjects {
        inner: LocalObjectStore,
        faults: Arc<Faults>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ObjectStore for FaultyObjects {
        async fn put_object(
            &self,
            bucket: &str,
            key: &str,
            bytes: Bytes,
            content_type: &str,
        ) -> ObjectStoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.faults.fail_put.load(Ordering::SeqCst) {
                return Err(injected());
            }
            self.inner
                .put_object(bucket, key, bytes, content_type)
                .await?;
            if self.faults.stall_put.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn get_object(&self, bucket: &str, key: &str) -> ObjectStoreResult<StoredObject> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.faults.fail_get.load(Ordering::SeqCst) {
                return Err(injected());
            }
            self.inner.get_object(bucket, key).await
        }

        async fn remove_object(&self, bucket: &str, key: &str) -> ObjectStoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.faults.fail_remove.load(Ordering::SeqCst) {
                return Err(injected());
            }
            self.inner.remove_object(bucket, key).await
        }

        async fn bucket_exists(&self, bucket: &str) -> ObjectStoreResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.bucket_exists(bucket).await
        }

        async fn make_bucket(&self, bucket: &str, region: &str) -> ObjectStoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.make_bucket(bucket, region).await
        }
    }

    struct FaultyMetadata {
        inner: SqliteMetadataRepository,
        faults: Arc<Faults>,
    }

    #[async_trait]
    impl MetadataRepository for FaultyMetadata {
        async fn ensure_schema(&self) -> RepositoryResult<()> {
            if self.faults.fail_schema.load(Ordering::SeqCst) {
                return Err(injected_sql());
            }
            self.inner.ensure_schema().await
        }

        async fn insert(&self, document: &Document) -> RepositoryResult<()> {
            if self.faults.fail_insert.load(Ordering::SeqCst) {
                return Err(injected_sql());
            }
            self.inner.insert(document).await?;
            if self.faults.hang_after_insert.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn find_locator(&self, id: DocumentId) -> RepositoryResult<Option<String>> {
            if self.faults.fail_find.load(Ordering::SeqCst) {
                return Err(injected_sql());
            }
            self.inner.find_locator(id).await
        }

        async fn find(&self, id: DocumentId) -> RepositoryResult<Option<Document>> {
            self.inner.find(id).await
        }

        async fn update_attributes(
            &self,
            id: DocumentId,
            attributes: &DocumentAttributes,
            uploaded_at: DateTime<Utc>,
        ) -> RepositoryResult<bool> {
            if self.faults.fail_update.load(Ordering::SeqCst) {
                return Err(injected_sql());
            }
            if self.faults.delete_during_update.load(Ordering::SeqCst) {
                self.inner.delete_returning_locator(id).await?;
            }
            self.inner
                .update_attributes(id, attributes, uploaded_at)
                .await
        }

        async fn delete_returning_locator(
            &self,
            id: DocumentId,
        ) -> RepositoryResult<Option<String>> {
            if self.faults.fail_delete.load(Ordering::SeqCst) {
                return Err(injected_sql());
            }
            self.inner.delete_returning_locator(id).await
        }

        async fn ping(&self) -> RepositoryResult<()> {
            self.inner.ping().await
        }
    }

    struct Harness {
        service: DocumentService,
        objects: LocalObjectStore,
        repo: SqliteMetadataRepository,
        faults: Arc<Faults>,
        object_calls: Arc<AtomicUsize>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        async fn blob(&self, id: DocumentId) -> Option<StoredObject> {
            self.objects
                .get_object("pdfs", BlobKey::for_document(id).as_str())
                .await
                .ok()
        }

        fn bucket_is_empty(&self) -> bool {
            std::fs::read_dir(self.objects.base_path.join("pdfs"))
                .unwrap()
                .next()
                .is_none()
        }

        async fn row_count(&self) -> i64 {
            sqlx::query_scalar("SELECT COUNT(*) FROM documents")
                .fetch_one(&*self.repo.db)
                .await
                .unwrap()
        }
    }

    async fn harness_with(config: DocumentServiceConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let objects = LocalObjectStore::new(dir.path());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repo = SqliteMetadataRepository::new(Arc::new(pool));
        let faults = Arc::new(Faults::default());
        let object_calls = Arc::new(AtomicUsize::new(0));

        let service = DocumentService::new(
            Arc::new(FaultyObjects {
                inner: objects.clone(),
                faults: faults.clone(),
                calls: object_calls.clone(),
            }),
            Arc::new(FaultyMetadata {
                inner: repo.clone(),
                faults: faults.clone(),
            }),
            config,
        );

        Harness {
            service,
            objects,
            repo,
            faults,
            object_calls,
            _dir: dir,
        }
    }

    async fn harness() -> Harness {
        let h = harness_with(DocumentServiceConfig::default()).await;
        h.service.initialize().await.unwrap();
        h.object_calls.store(0, Ordering::SeqCst);
        h
    }

    fn pdf_upload(name: &str, body: &'static [u8]) -> UploadRequest {
        UploadRequest {
            bytes: Bytes::from_static(body),
            file_name: name.into(),
            size: body.len() as i64,
            content_type: "application/pdf".into(),
        }
    }

    #[tokio::test]
    async fn upload_resolve_delete_scenario() {
        let h = harness().await;
        let id = h
            .service
            .upload(UploadRequest {
                bytes: Bytes::from_static(PDF_MAGIC),
                file_name: "a.pdf".into(),
                size: 1024,
                content_type: "application/pdf".into(),
            })
            .await
            .unwrap();

        let locator = h.service.resolve(id).await.unwrap();
        assert_eq!(locator.to_string(), format!("minio://pdfs/{}.pdf", id));

        h.service.delete(id).await.unwrap();
        assert_eq!(h.service.resolve(id).await, Err(DocumentError::NotFound(id)));
        assert_eq!(h.service.delete(id).await, Err(DocumentError::NotFound(id)));
    }

    #[tokio::test]
    async fn uploaded_bytes_are_retrievable_through_locator() {
        let h = harness().await;
        let id = h.service.upload(pdf_upload("a.pdf", PDF_MAGIC)).await.unwrap();

        let locator = h.service.resolve(id).await.unwrap();
        let stored = h
            .objects
            .get_object(locator.bucket(), locator.key())
            .await
            .unwrap();
        assert_eq!(&stored.bytes[..], PDF_MAGIC);
        assert_eq!(stored.content_type.as_deref(), Some("application/pdf"));

        let document = h.service.describe(id).await.unwrap();
        assert_eq!(document.file_name, "a.pdf");
        assert_eq!(document.file_size, PDF_MAGIC.len() as i64);
        assert_eq!(document.storage_locator, locator.to_string());
    }

    #[tokio::test]
    async fn download_returns_metadata_and_bytes() {
        let h = harness().await;
        let id = h.service.upload(pdf_upload("a.pdf", PDF_MAGIC)).await.unwrap();

        let (document, object) = h.service.download(id).await.unwrap();
        assert_eq!(document.file_name, "a.pdf");
        assert_eq!(&object.bytes[..], PDF_MAGIC);

        let missing = DocumentId::new();
        assert_eq!(
            h.service.download(missing).await.unwrap_err(),
            DocumentError::NotFound(missing)
        );
    }

    #[tokio::test]
    async fn failed_object_write_persists_nothing() {
        let h = harness().await;
        h.faults.fail_put.store(true, Ordering::SeqCst);

        let err = h.service.upload(pdf_upload("a.pdf", PDF_MAGIC)).await;

        assert_eq!(err, Err(DocumentError::StorageWriteFailure));
        assert_eq!(h.row_count().await, 0);
        assert!(h.bucket_is_empty());
    }

    #[tokio::test]
    async fn failed_metadata_insert_removes_written_blob() {
        let h = harness().await;
        h.faults.fail_insert.store(true, Ordering::SeqCst);

        let err = h.service.upload(pdf_upload("a.pdf", PDF_MAGIC)).await;

        assert_eq!(err, Err(DocumentError::MetadataWriteFailure));
        assert_eq!(h.row_count().await, 0);
        assert!(h.bucket_is_empty());
        // put + compensating remove
        assert_eq!(h.object_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_compensation_does_not_mask_metadata_error() {
        let h = harness().await;
        h.faults.fail_insert.store(true, Ordering::SeqCst);
        h.faults.fail_remove.store(true, Ordering::SeqCst);

        let err = h.service.upload(pdf_upload("a.pdf", PDF_MAGIC)).await;

        assert_eq!(err, Err(DocumentError::MetadataWriteFailure));
        assert_eq!(h.row_count().await, 0);
        assert!(!h.bucket_is_empty());
    }

    #[tokio::test]
    async fn timed_out_object_write_is_cleaned_up() {
        let h = harness_with(DocumentServiceConfig {
            operation_timeout: Duration::from_millis(50),
            ..DocumentServiceConfig::default()
        })
        .await;
        h.service.initialize().await.unwrap();
        h.faults.stall_put.store(true, Ordering::SeqCst);

        let err = h.service.upload(pdf_upload("a.pdf", PDF_MAGIC)).await;

        assert_eq!(err, Err(DocumentError::StorageWriteFailure));
        assert_eq!(h.row_count().await, 0);
        assert!(h.bucket_is_empty());
    }

    #[tokio::test]
    async fn cancelled_upload_cleans_up_partial_blob() {
        let h = harness().await;
        h.faults.stall_put.store(true, Ordering::SeqCst);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            h.service.upload(pdf_upload("a.pdf", PDF_MAGIC)),
        )
        .await;
        assert!(cancelled.is_err());

        let mut cleaned = false;
        for _ in 0..100 {
            if h.bucket_is_empty() {
                cleaned = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cleaned, "blob of cancelled upload was not removed");
        assert_eq!(h.row_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found_without_touching_object_store() {
        let h = harness().await;
        let id = DocumentId::new();

        assert_eq!(h.service.resolve(id).await, Err(DocumentError::NotFound(id)));
        assert_eq!(
            h.service.replace(id, pdf_upload("b.pdf", b"%PDF-2")).await,
            Err(DocumentError::NotFound(id))
        );
        assert_eq!(h.service.delete(id).await, Err(DocumentError::NotFound(id)));
        assert_eq!(h.service.describe(id).await, Err(DocumentError::NotFound(id)));

        assert_eq!(h.object_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.row_count().await, 0);
    }

    #[tokio::test]
    async fn replace_keeps_id_and_key_and_updates_attributes() {
        let h = harness().await;
        let id = h.service.upload(pdf_upload("a.pdf", PDF_MAGIC)).await.unwrap();
        let before = h.service.resolve(id).await.unwrap();
        let described = h.service.describe(id).await.unwrap();

        h.service
            .replace(id, pdf_upload("b.pdf", b"%PDF-2.0 replaced"))
            .await
            .unwrap();

        let after = h.service.resolve(id).await.unwrap();
        assert_eq!(before, after);

        let replaced = h.service.describe(id).await.unwrap();
        assert_eq!(replaced.id, id.as_uuid());
        assert_eq!(replaced.file_name, "b.pdf");
        assert_eq!(replaced.file_size, 17);
        assert!(replaced.uploaded_at >= described.uploaded_at);

        let blob = h.blob(id).await.unwrap();
        assert_eq!(&blob.bytes[..], b"%PDF-2.0 replaced");
        assert_eq!(h.row_count().await, 1);
    }

    #[tokio::test]
    async fn replace_with_failed_object_write_leaves_old_state() {
        let h = harness().await;
        let id = h.service.upload(pdf_upload("a.pdf", PDF_MAGIC)).await.unwrap();
        h.faults.fail_put.store(true, Ordering::SeqCst);

        let err = h.service.replace(id, pdf_upload("b.pdf", b"%PDF-2")).await;

        assert_eq!(err, Err(DocumentError::StorageWriteFailure));
        assert_eq!(&h.blob(id).await.unwrap().bytes[..], PDF_MAGIC);
        assert_eq!(h.service.describe(id).await.unwrap().file_name, "a.pdf");
    }

    #[tokio::test]
    async fn replace_with_failed_metadata_update_keeps_new_bytes() {
        let h = harness().await;
        let id = h.service.upload(pdf_upload("a.pdf", PDF_MAGIC)).await.unwrap();
        h.faults.fail_update.store(true, Ordering::SeqCst);

        let err = h.service.replace(id, pdf_upload("b.pdf", b"%PDF-2")).await;

        assert_eq!(err, Err(DocumentError::MetadataWriteFailure));
        assert_eq!(&h.blob(id).await.unwrap().bytes[..], b"%PDF-2");
        assert_eq!(h.service.describe(id).await.unwrap().file_name, "a.pdf");
        assert!(h.service.resolve(id).await.is_ok());
    }

    #[tokio::test]
    async fn delete_succeeds_even_if_blob_removal_fails() {
        let h = harness().await;
        let id = h.service.upload(pdf_upload("a.pdf", PDF_MAGIC)).await.unwrap();
        h.faults.fail_remove.store(true, Ordering::SeqCst);

        h.service.delete(id).await.unwrap();

        assert_eq!(h.service.resolve(id).await, Err(DocumentError::NotFound(id)));
        // the orphan stays behind but is no longer resolvable
        assert!(h.blob(id).await.is_some());
    }

    #[tokio::test]
    async fn delete_removes_row_and_blob() {
        let h = harness().await;
        let id = h.service.upload(pdf_upload("a.pdf", PDF_MAGIC)).await.unwrap();

        h.service.delete(id).await.unwrap();

        assert!(h.blob(id).await.is_none());
        assert_eq!(h.row_count().await, 0);
        assert!(h.bucket_is_empty());
    }

    #[tokio::test]
    async fn metadata_read_failure_is_reported() {
        let h = harness().await;
        let id = h.service.upload(pdf_upload("a.pdf", PDF_MAGIC)).await.unwrap();
        h.faults.fail_find.store(true, Ordering::SeqCst);

        assert_eq!(
            h.service.resolve(id).await,
            Err(DocumentError::MetadataReadFailure)
        );
        assert_eq!(
            h.service.replace(id, pdf_upload("b.pdf", b"%PDF-2")).await,
            Err(DocumentError::MetadataReadFailure)
        );
        assert_eq!(&h.blob(id).await.unwrap().bytes[..], PDF_MAGIC);
    }

    #[tokio::test]
    async fn concurrent_uploads_are_independent() {
        let h = harness().await;
        let uploads = (0..16).map(|_| h.service.upload(pdf_upload("c.pdf", PDF_MAGIC)));
        let ids: Vec<DocumentId> = futures::future::join_all(uploads)
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();

        let unique: std::collections::HashSet<_> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        for id in &ids {
            assert!(h.service.resolve(*id).await.is_ok());
            assert!(h.blob(*id).await.is_some());
        }
        assert_eq!(h.row_count().await, 16);
    }

    #[tokio::test]
    async fn initialize_is_idempotent_and_concurrency_safe() {
        let h = harness_with(DocumentServiceConfig::default()).await;

        let (a, b) = tokio::join!(h.service.initialize(), h.service.initialize());
        a.unwrap();
        b.unwrap();
        h.service.initialize().await.unwrap();

        assert!(h.objects.bucket_exists("pdfs").await.unwrap());
        assert!(h.service.check_metadata().await.is_ok());
        assert!(h.service.check_object_store().await.is_ok());
    }

    #[tokio::test]
    async fn initialize_reports_failing_stage() {
        let h = harness_with(DocumentServiceConfig::default()).await;
        h.faults.fail_schema.store(true, Ordering::SeqCst);
        assert_eq!(
            h.service.initialize().await,
            Err(DocumentError::InitializationFailure {
                stage: InitStage::Schema
            })
        );

        let h = harness_with(DocumentServiceConfig {
            bucket: "Not_A_Bucket".into(),
            ..DocumentServiceConfig::default()
        })
        .await;
        assert_eq!(
            h.service.initialize().await,
            Err(DocumentError::InitializationFailure {
                stage: InitStage::Bucket
            })
        );
    }

    fn with_short_timeout() -> DocumentServiceConfig {
        DocumentServiceConfig {
            operation_timeout: Duration::from_millis(50),
            ..DocumentServiceConfig::default()
        }
    }

    #[tokio::test]
    async fn timed_out_insert_that_committed_is_rolled_back() {
        let h = harness_with(with_short_timeout()).await;
        h.service.initialize().await.unwrap();
        h.faults.hang_after_insert.store(true, Ordering::SeqCst);

        let err = h.service.upload(pdf_upload("a.pdf", PDF_MAGIC)).await;

        assert_eq!(err, Err(DocumentError::MetadataWriteFailure));
        assert_eq!(h.row_count().await, 0);
        assert!(h.bucket_is_empty());
    }

    #[tokio::test]
    async fn unretractable_row_keeps_its_blob() {
        let h = harness_with(with_short_timeout()).await;
        h.service.initialize().await.unwrap();
        h.faults.hang_after_insert.store(true, Ordering::SeqCst);
        h.faults.fail_delete.store(true, Ordering::SeqCst);

        let err = h.service.upload(pdf_upload("a.pdf", PDF_MAGIC)).await;
        assert_eq!(err, Err(DocumentError::MetadataWriteFailure));

        // The row survived, so its blob must too.
        let id: uuid::Uuid = sqlx::query_scalar("SELECT id FROM documents")
            .fetch_one(&*h.repo.db)
            .await
            .unwrap();
        let id = DocumentId::from(id);
        h.faults.hang_after_insert.store(false, Ordering::SeqCst);
        let (_, object) = h.service.download(id).await.unwrap();
        assert_eq!(&object.bytes[..], PDF_MAGIC);
    }

    #[tokio::test]
    async fn cancelled_upload_during_insert_is_rolled_back() {
        let h = harness().await;
        h.faults.hang_after_insert.store(true, Ordering::SeqCst);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            h.service.upload(pdf_upload("a.pdf", PDF_MAGIC)),
        )
        .await;
        assert!(cancelled.is_err());

        let mut cleaned = false;
        for _ in 0..100 {
            if h.bucket_is_empty() && h.row_count().await == 0 {
                cleaned = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cleaned, "cancelled upload left a row or a blob behind");
    }

    #[tokio::test]
    async fn replace_racing_delete_removes_new_blob() {
        let h = harness().await;
        let id = h.service.upload(pdf_upload("a.pdf", PDF_MAGIC)).await.unwrap();
        h.faults.delete_during_update.store(true, Ordering::SeqCst);

        let err = h.service.replace(id, pdf_upload("b.pdf", b"%PDF-2")).await;

        assert_eq!(err, Err(DocumentError::NotFound(id)));
        assert_eq!(h.row_count().await, 0);
        assert!(h.bucket_is_empty());
    }

    #[tokio::test]
    async fn delete_with_malformed_locator_keeps_blob() {
        let h = harness().await;
        let id = h.service.upload(pdf_upload("a.pdf", PDF_MAGIC)).await.unwrap();
        sqlx::query("UPDATE documents SET storage_locator = 'not-a-locator' WHERE id = ?")
            .bind(id.as_uuid())
            .execute(&*h.repo.db)
            .await
            .unwrap();

        h.service.delete(id).await.unwrap();

        assert_eq!(h.row_count().await, 0);
        assert_eq!(h.service.resolve(id).await, Err(DocumentError::NotFound(id)));
        assert!(h.blob(id).await.is_some());
    }

    #[tokio::test]
    async fn download_failures_are_classified() {
        let h = harness().await;
        let id = h.service.upload(pdf_upload("a.pdf", PDF_MAGIC)).await.unwrap();

        h.faults.fail_get.store(true, Ordering::SeqCst);
        assert_eq!(
            h.service.download(id).await.unwrap_err(),
            DocumentError::StorageReadFailure
        );
        h.faults.fail_get.store(false, Ordering::SeqCst);

        h.objects
            .remove_object("pdfs", BlobKey::for_document(id).as_str())
            .await
            .unwrap();
        assert_eq!(
            h.service.download(id).await.unwrap_err(),
            DocumentError::NotFound(id)
        );
    }

    #[tokio::test]
    async fn readiness_fails_before_bucket_exists() {
        let h = harness_with(DocumentServiceConfig::default()).await;
        assert!(h.service.check_object_store().await.is_err());
    }
}
