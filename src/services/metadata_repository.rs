//! Metadata Store seam: one row per document in the `documents` table.

use crate::models::document::{Document, DocumentAttributes, DocumentId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Schema bootstrap, applied statement by statement on `ensure_schema`.
const SCHEMA_SQL: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("document `{0}` already exists")]
    Duplicate(DocumentId),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait MetadataRepository: Send + Sync {
    /// Create the `documents` table if it does not exist yet.
    async fn ensure_schema(&self) -> RepositoryResult<()>;

    async fn insert(&self, document: &Document) -> RepositoryResult<()>;

    async fn find_locator(&self, id: DocumentId) -> RepositoryResult<Option<String>>;

    async fn find(&self, id: DocumentId) -> RepositoryResult<Option<Document>>;

    /// Overwrite the descriptive fields and timestamp of a row.
    /// Returns `false` when no row matched.
    async fn update_attributes(
        &self,
        id: DocumentId,
        attributes: &DocumentAttributes,
        uploaded_at: DateTime<Utc>,
    ) -> RepositoryResult<bool>;

    /// Delete a row, handing back the locator it held.
    async fn delete_returning_locator(&self, id: DocumentId) -> RepositoryResult<Option<String>>;

    async fn ping(&self) -> RepositoryResult<()>;
}

/// `MetadataRepository` over a shared SQLite pool.
#[derive(Clone)]
pub struct SqliteMetadataRepository {
    pub db: Arc<SqlitePool>,
}

impl SqliteMetadataRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MetadataRepository for SqliteMetadataRepository {
    async fn ensure_schema(&self) -> RepositoryResult<()> {
        let statements = SCHEMA_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty());

        for stmt in statements {
            debug!("Executing schema SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    async fn insert(&self, document: &Document) -> RepositoryResult<()> {
        let result = sqlx::query(
            "INSERT INTO documents (id, storage_locator, file_name, file_size, content_type, uploaded_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(document.id)
        .bind(&document.storage_locator)
        .bind(&document.file_name)
        .bind(document.file_size)
        .bind(&document.content_type)
        .bind(document.uploaded_at)
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(RepositoryError::Duplicate(DocumentId::from(document.id)))
            }
            Err(err) => Err(RepositoryError::Sqlx(err)),
        }
    }

    async fn find_locator(&self, id: DocumentId) -> RepositoryResult<Option<String>> {
        let locator = sqlx::query_scalar::<_, String>(
            "SELECT storage_locator FROM documents WHERE id = ?",
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.db)
        .await?;
        Ok(locator)
    }

    async fn find(&self, id: DocumentId) -> RepositoryResult<Option<Document>> {
        let document = sqlx::query_as::<_, Document>(
            "SELECT id, storage_locator, file_name, file_size, content_type, uploaded_at
             FROM documents WHERE id = ?",
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.db)
        .await?;
        Ok(document)
    }

    async fn update_attributes(
        &self,
        id: DocumentId,
        attributes: &DocumentAttributes,
        uploaded_at: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let result = sqlx::query(
            "UPDATE documents
             SET file_name = ?, file_size = ?, content_type = ?, uploaded_at = ?
             WHERE id = ?",
        )
        .bind(&attributes.file_name)
        .bind(attributes.file_size)
        .bind(&attributes.content_type)
        .bind(uploaded_at)
        .bind(id.as_uuid())
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_returning_locator(&self, id: DocumentId) -> RepositoryResult<Option<String>> {
        let locator = sqlx::query_scalar::<_, String>(
            "DELETE FROM documents WHERE id = ? RETURNING storage_locator",
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.db)
        .await?;
        Ok(locator)
    }

    async fn ping(&self) -> RepositoryResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
