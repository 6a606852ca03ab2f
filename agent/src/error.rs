//! Unified error handling for the agent.
//!
//! Local failures ([`StoreError`]) propagate to the caller. Remote failures
//! ([`RemoteError`]) are classified so that the write path and the sync
//! cycle can decide between queueing, retrying and giving up without ever
//! inspecting error messages.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Local store failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Engine(#[from] stockroom_engine::Error),
}

impl StoreError {
    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Storage(err.to_string())
    }
}

/// Remote store failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The call did not finish within its deadline.
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    /// Disabled, offline, unauthenticated or unreachable.
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    /// The remote store answered and refused the request.
    #[error("remote store rejected the request: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Timeouts and unavailability are the expected offline path.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Timeout(_) | RemoteError::Unavailable(_))
    }
}

/// Failure while replaying one queued operation.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_retryable(),
            SyncError::Store(_) => false,
        }
    }
}

/// Application error type for the control API.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Engine error: {0}")]
    Engine(#[from] stockroom_engine::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match &self {
            AppError::Store(StoreError::NotFound { .. }) => {
                (StatusCode::NOT_FOUND, self.to_string(), None)
            }
            AppError::Store(StoreError::Engine(e)) | AppError::Engine(e) => engine_status(e),
            AppError::Store(e) => {
                tracing::error!("Store error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Store error".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

fn engine_status(err: &stockroom_engine::Error) -> (StatusCode, String, Option<String>) {
    tracing::warn!("Engine error: {:?}", err);
    let status = match err {
        stockroom_engine::Error::UnknownCollection(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, err.to_string(), None)
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(RemoteError::Timeout(Duration::from_secs(3)).is_retryable());
        assert!(RemoteError::Unavailable("offline".into()).is_retryable());
        assert!(!RemoteError::Rejected("permission denied".into()).is_retryable());

        let store: SyncError = StoreError::not_found("products", "x").into();
        assert!(!store.is_retryable());
        let remote: SyncError = RemoteError::Unavailable("offline".into()).into();
        assert!(remote.is_retryable());
    }

    #[test]
    fn status_codes() {
        let not_found = AppError::from(StoreError::not_found("products", "x")).into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let unknown = AppError::from(stockroom_engine::Error::UnknownCollection("x".into()))
            .into_response();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let invalid = AppError::from(StoreError::Engine(stockroom_engine::Error::InvalidRecord(
            "name missing".into(),
        )))
        .into_response();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let storage = AppError::from(StoreError::Storage("disk full".into())).into_response();
        assert_eq!(storage.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
