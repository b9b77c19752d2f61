//! Error handling

use axum::{
    response::{IntoResponse, Response},
    http::StatusCode,
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::alerts::Alert;
use crate::session::SessionStatus;

// ============================================================================
// DOMAIN ERRORS
// ============================================================================

/// Errors local to one agent session. None of these are process-fatal.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("frame could not be decrypted with the session key")]
    Decryption,

    #[error("frame could not be encrypted")]
    Encryption,

    #[error("processing task stopped before the session ended")]
    ProcessingStopped,

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition { from: SessionStatus, to: SessionStatus },

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decrypted payload that does not describe a telemetry event.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("no model snapshot has been trained yet")]
    ModelNotReady,

    #[error("model training failed: {0}")]
    Training(String),
}

/// Failure of one notification channel for one alert.
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("smtp error: {0}")]
    Smtp(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("channel misconfigured: {0}")]
    Config(String),

    #[error("channel did not answer within {0:?}")]
    Timeout(std::time::Duration),
}

/// Collaborator boundary failures (history append, event-bus publish).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("history append failed: {0}")]
    History(String),

    #[error("publish to topic '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::History(err.to_string())
    }
}

/// Raised alert whose persistence or publication failed.
///
/// The alert is carried along so callers can still notify on it.
#[derive(Debug, Error)]
#[error("alert {} not fully stored: {source}", alert.id)]
pub struct AlertError {
    pub alert: std::sync::Arc<Alert>,
    #[source]
    pub source: StorageError,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(#[from] validator::ValidationErrors),

    #[error("bad address: {0}")]
    Address(String),

    #[error("encryption key: {0}")]
    Key(String),
}

// ============================================================================
// HTTP SURFACE
// ============================================================================

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub enum AppError {
    // Resource errors
    NotFound(String),

    // Validation errors
    ValidationError(String),

    // Storage errors
    StorageError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.as_str()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg.as_str()),
            AppError::StorageError(msg) => {
                tracing::error!("Storage error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error occurred")
            }
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        AppError::StorageError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_status_codes() {
        let cases = [
            (AppError::NotFound("Session x not found".into()), StatusCode::NOT_FOUND),
            (AppError::ValidationError("limit".into()), StatusCode::BAD_REQUEST),
            (AppError::from(StorageError::History("pool closed".into())), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn test_storage_error_hides_details() {
        let response = AppError::from(StorageError::History("password=hunter2".into())).into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "Storage error occurred");
        assert_eq!(value["status"], 500);
    }
}
