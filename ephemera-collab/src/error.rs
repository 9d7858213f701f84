//! Errors surfaced by document operations.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::alarm::AlarmError;
use crate::engine::MergeError;
use crate::storage::StoreError;

/// Failure of a request routed to a document.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DocumentError {
    /// Caller supplied bad input
    #[error("{0}")]
    Validation(String),
    /// No live document under this key (never created, or expired)
    #[error("Document not found")]
    NotFound,
    /// Connection cap reached
    #[error("Too many connections")]
    Capacity { max: usize },
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Alarm(#[from] AlarmError),
    /// Persisted state could not be loaded into the engine
    #[error("corrupt document state: {0}")]
    Corrupt(#[from] MergeError),
    /// The owning actor is gone (shutdown in progress)
    #[error("Document unavailable")]
    Unavailable,
}

impl DocumentError {
    pub fn status(&self) -> StatusCode {
        match self {
            DocumentError::Validation(_) => StatusCode::BAD_REQUEST,
            DocumentError::NotFound => StatusCode::NOT_FOUND,
            DocumentError::Capacity { .. } | DocumentError::Unavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DocumentError::Storage(_) | DocumentError::Alarm(_) | DocumentError::Corrupt(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for DocumentError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("Document operation failed: {self}");
            "Internal error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
