//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the metadata store and the bucket

use crate::services::document_service::DocumentService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Very small liveness probe: always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that pings the metadata store and checks that the
/// document bucket is reachable. HTTP 200 when all checks pass, HTTP 503
/// when any check fails.
pub async fn readyz(State(service): State<DocumentService>) -> impl IntoResponse {
    let (metadata, objects) =
        futures::join!(service.check_metadata(), service.check_object_store());

    let mut checks = HashMap::new();
    checks.insert("metadata", CheckStatus::from(metadata));
    checks.insert("object_store", CheckStatus::from(objects));

    let overall_ok = checks.values().all(|check| check.ok);
    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl From<Result<(), String>> for CheckStatus {
    fn from(result: Result<(), String>) -> Self {
        Self {
            ok: result.is_ok(),
            error: result.err(),
        }
    }
}
