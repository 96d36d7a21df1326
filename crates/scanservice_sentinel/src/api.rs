//! HTTP boundary of the scan service.

use crate::registry::RegistryError;
use crate::service::ScanService;
use crate::task::SubmitError;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use scanservice_protocol::{
    ActiveScansResponse, ErrorResponse, HealthResponse, ScanAccepted, ScanRequest, TaskId,
    TaskStatusResponse,
};
use std::fmt;
use tracing::warn;

pub type ApiResult<T> = Result<T, ApiError>;

/// Error answered as `{"detail": message}` with `status`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            detail: self.message,
        });
        (self.status, body).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::PathNotFound(_) | SubmitError::NonUtf8Path(_) => {
                Self::bad_request(err.to_string())
            }
            SubmitError::ShuttingDown => Self::unavailable(err.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        Self::not_found(err.to_string())
    }
}

/// Routes, with the service as shared state.
pub fn router(service: ScanService) -> Router {
    Router::new()
        .route("/scan", post(submit_scan).get(list_scans))
        .route("/scan/", post(submit_scan))
        .route("/scan/{uuid}", get(scan_status).delete(cancel_scan))
        .route("/health", get(health))
        .with_state(service)
}

async fn submit_scan(
    State(service): State<ScanService>,
    Json(request): Json<ScanRequest>,
) -> ApiResult<Json<ScanAccepted>> {
    let accepted = service.submit(request).map_err(|e| {
        warn!("Rejected scan request: {}", e);
        ApiError::from(e)
    })?;
    Ok(Json(accepted))
}

async fn list_scans(State(service): State<ScanService>) -> Json<ActiveScansResponse> {
    Json(ActiveScansResponse::active(service.registry().list()))
}

fn parse_task_id(raw: &str) -> ApiResult<TaskId> {
    TaskId::parse(raw).map_err(|e| ApiError::bad_request(e.to_string()))
}

async fn scan_status(
    State(service): State<ScanService>,
    Path(uuid): Path<String>,
) -> ApiResult<Json<TaskStatusResponse>> {
    let id = parse_task_id(&uuid)?;
    Ok(Json(service.registry().status(id)?))
}

async fn cancel_scan(
    State(service): State<ScanService>,
    Path(uuid): Path<String>,
) -> ApiResult<Json<TaskStatusResponse>> {
    let id = parse_task_id(&uuid)?;
    service.registry().cancel(id)?;
    Ok(Json(service.registry().status(id)?))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
