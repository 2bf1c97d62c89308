//! HTTP handlers for document upload, lookup, replace and delete.
//! Multipart parsing and content-type checks happen here; everything that
//! touches storage is delegated to `DocumentService`.

use crate::{
    errors::AppError,
    models::document::{Document, DocumentId},
    services::document_service::{DocumentService, UploadRequest},
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

/// Multipart field carrying the document.
const FILE_FIELD: &str = "file";
const PDF_CONTENT_TYPE: &str = "application/pdf";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub upload_id: DocumentId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePathResponse {
    pub file_path: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadataResponse {
    pub upload_id: DocumentId,
    pub file_path: String,
    pub file_name: String,
    pub file_size: i64,
    pub file_type: String,
    pub uploaded_at: DateTime<Utc>,
}

impl From<Document> for DocumentMetadataResponse {
    fn from(doc: Document) -> Self {
        Self {
            upload_id: DocumentId::from(doc.id),
            file_path: doc.storage_locator,
            file_name: doc.file_name,
            file_size: doc.file_size,
            file_type: doc.content_type,
            uploaded_at: doc.uploaded_at,
        }
    }
}

struct UploadedFile {
    file_name: String,
    content_type: String,
    bytes: Bytes,
}

impl From<UploadedFile> for UploadRequest {
    fn from(file: UploadedFile) -> Self {
        Self {
            size: file.bytes.len() as i64,
            bytes: file.bytes,
            file_name: file.file_name,
            content_type: file.content_type,
        }
    }
}

/// Pull the `file` field out of a multipart body, skipping any others.
async fn read_file_field(mut multipart: Multipart) -> Result<Option<UploadedFile>, AppError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            debug!(field = ?field.name(), "ignoring multipart field");
            continue;
        }
        let file_name = field.file_name().unwrap_or("document.pdf").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field.bytes().await?;
        return Ok(Some(UploadedFile {
            file_name,
            content_type,
            bytes,
        }));
    }
    Ok(None)
}

fn ensure_pdf(file: &UploadedFile) -> Result<(), AppError> {
    if file.content_type == PDF_CONTENT_TYPE {
        Ok(())
    } else {
        Err(AppError::bad_request("Only PDF files are allowed"))
    }
}

/// Ids that do not parse can never have been issued.
fn parse_id(raw: &str) -> Result<DocumentId, AppError> {
    raw.parse()
        .map_err(|_| AppError::not_found("File not found"))
}

/// `POST /api/v1/upload`: multipart upload of a single PDF.
pub async fn upload_document(
    State(service): State<DocumentService>,
    multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let file = read_file_field(multipart)
        .await?
        .ok_or_else(|| AppError::bad_request("No file uploaded"))?;
    ensure_pdf(&file)?;

    let upload_id = service.upload(file.into()).await?;
    Ok((StatusCode::CREATED, Json(UploadResponse { upload_id })))
}

/// `GET /api/v1/files/{id}`: storage locator of a document.
pub async fn get_document(
    State(service): State<DocumentService>,
    Path(id): Path<String>,
) -> Result<Json<FilePathResponse>, AppError> {
    let locator = service.resolve(parse_id(&id)?).await?;
    Ok(Json(FilePathResponse {
        file_path: locator.to_string(),
    }))
}

/// `GET /api/v1/files/{id}/metadata`: full metadata row.
pub async fn get_document_metadata(
    State(service): State<DocumentService>,
    Path(id): Path<String>,
) -> Result<Json<DocumentMetadataResponse>, AppError> {
    let document = service.describe(parse_id(&id)?).await?;
    Ok(Json(document.into()))
}

/// `GET /api/v1/files/{id}/content`: the stored bytes.
pub async fn download_document(
    State(service): State<DocumentService>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let (document, object) = service.download(parse_id(&id)?).await?;
    let content_type = object
        .content_type
        .unwrap_or_else(|| document.content_type.clone());
    let length = object.bytes.len();

    let mut response = Response::new(Body::from(object.bytes));
    *response.status_mut() = StatusCode::OK;
    set_document_headers(response.headers_mut(), &document, &content_type, length);
    Ok(response)
}

/// `PUT /api/v1/files/{id}`: replace content in place.
pub async fn replace_document(
    State(service): State<DocumentService>,
    Path(id): Path<String>,
    multipart: Multipart,
) -> Result<Json<MessageResponse>, AppError> {
    let id = parse_id(&id)?;
    let file = read_file_field(multipart)
        .await?
        .ok_or_else(|| AppError::bad_request("No file in request"))?;
    ensure_pdf(&file)?;

    service.replace(id, file.into()).await?;
    Ok(Json(MessageResponse {
        message: "File successfully replaced".into(),
    }))
}

/// `DELETE /api/v1/files/{id}`
pub async fn delete_document(
    State(service): State<DocumentService>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    service.delete(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn set_document_headers(
    headers: &mut HeaderMap,
    document: &Document,
    content_type: &str,
    length: usize,
) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));

    let disposition = format!(
        "inline; filename=\"{}\"",
        document.file_name.replace(['"', '\\'], "_")
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    if let Ok(value) = HeaderValue::from_str(&document.uploaded_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
