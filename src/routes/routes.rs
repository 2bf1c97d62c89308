//! Defines routes for the document API.
//!
//! ## Structure
//! - **Probes** (mounted at root)
//!   - `GET    /healthz`
//!   - `GET    /readyz`
//!
//! - **Document endpoints** (under `/api/v1`)
//!   - `POST   /upload`                 multipart upload, returns `uploadId`
//!   - `GET    /files/{id}`             storage locator (`filePath`)
//!   - `GET    /files/{id}/metadata`    full metadata row
//!   - `GET    /files/{id}/content`     stored bytes
//!   - `PUT    /files/{id}`             replace content in place
//!   - `DELETE /files/{id}`             delete document

use crate::{
    handlers::{
        document_handlers::{
            delete_document, download_document, get_document, get_document_metadata,
            replace_document, upload_document,
        },
        health_handlers::{healthz, readyz},
    },
    services::document_service::DocumentService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router; request bodies are capped at `max_upload_bytes`.
pub fn routes(max_upload_bytes: usize) -> Router<DocumentService> {
    let api = Router::new()
        .route("/upload", post(upload_document))
        .route(
            "/files/{id}",
            get(get_document)
                .put(replace_document)
                .delete(delete_document),
        )
        .route("/files/{id}/metadata", get(get_document_metadata))
        .route("/files/{id}/content", get(download_document));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .nest("/api/v1", api)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}
