//! Error types for the recall engine.
//!
//! Uses thiserror for ergonomic error definitions that integrate
//! with axum's response system.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Validation errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Durable-log errors: a failed append is fatal for the request.
    #[error("Log write failed: {0}")]
    WriteFailure(String),

    // External service errors
    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    // Startup/configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,

            // 502
            Self::VectorStore(_) | Self::Embedding(_) | Self::Protocol(_) => {
                StatusCode::BAD_GATEWAY
            }

            // 504
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,

            // 500
            Self::WriteFailure(_)
            | Self::Configuration(_)
            | Self::Internal(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::WriteFailure(_) => "WRITE_FAILURE",
            Self::VectorStore(_) => "VECTOR_STORE_ERROR",
            Self::Embedding(_) => "EMBEDDING_ERROR",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Other(_) => "UNKNOWN_ERROR",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

// Convenience conversions
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput(format!("JSON parsing error: {}", err))
    }
}

impl From<recall_log::Error> for Error {
    fn from(err: recall_log::Error) -> Self {
        match err {
            recall_log::Error::InvalidInput(msg) => Self::InvalidInput(msg),
            recall_log::Error::Write(msg) => Self::WriteFailure(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<recall_embeddings::Error> for Error {
    fn from(err: recall_embeddings::Error) -> Self {
        match err {
            recall_embeddings::Error::InvalidInput(msg) => Self::InvalidInput(msg),
            recall_embeddings::Error::Protocol(msg) => Self::Protocol(msg),
            other => Self::Embedding(other.to_string()),
        }
    }
}

impl From<recall_qdrant::Error> for Error {
    fn from(err: recall_qdrant::Error) -> Self {
        match err {
            recall_qdrant::Error::VectorStore(msg) => Self::VectorStore(msg),
        }
    }
}
