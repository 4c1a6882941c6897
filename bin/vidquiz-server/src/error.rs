//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors become a JSON body with an
//! appropriate status code.
//!
//! Internal errors (store, database, I/O) are logged with full detail but
//! only a generic message is returned so file paths and SQL never leak to
//! clients.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;
use vidquiz_core::RuntimeError;
use vidquiz_core::source::SourceError;
use vidquiz_core::store::StoreError;

/// All errors that can occur in the vidquiz-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the pipeline orchestrator.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Propagated from the durable task store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The caller referenced a resource that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The resource exists but is not in a state that allows the request.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// An unclassified internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<SourceError> for ServerError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::TooLarge { .. } => ServerError::PayloadTooLarge(e.to_string()),
            SourceError::Http(m) => ServerError::BadRequest(format!("upload interrupted: {m}")),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = match &self {
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            ServerError::PayloadTooLarge(m) => (StatusCode::PAYLOAD_TOO_LARGE, m.clone()),

            ServerError::Runtime(e) => match e {
                RuntimeError::QueueFull | RuntimeError::Shutdown => {
                    (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
                }
                RuntimeError::TaskNotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()),
                RuntimeError::AlreadyRunning { .. } | RuntimeError::NotPending { .. } => {
                    (StatusCode::CONFLICT, e.to_string())
                }
            },

            ServerError::Store(e) => {
                error!(error = %e, "task store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
            ServerError::Database(e) => {
                error!(error = %e, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
            ServerError::Internal(m) => {
                error!(message = %m, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}
