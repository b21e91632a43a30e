use std::time::Duration;

use thiserror::Error;
use actix_web::{ResponseError, HttpResponse, http::StatusCode};
use serde_json::json;
use tokio_tungstenite::tungstenite;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Admission error: {0}")]
    AdmissionError(#[from] AdmissionError),

    #[error("Transport error: {0}")]
    TransportError(#[from] TransportError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

// Implement conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = self.to_string();
        let response = json!({
            "error": {
                "status": status.as_u16(),
                "message": message
            }
        });
        HttpResponse::build(status).json(response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::AdmissionError(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Returned synchronously to whoever offered the connection. The caller
/// still owns the transport and is expected to close it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("capacity exhausted ({workers} workers x {per_worker} connections)")]
    CapacityExhausted { workers: usize, per_worker: usize },

    #[error("pool is shutting down")]
    ShuttingDown,
}

/// Per-connection failures. Once a connection is admitted these never leave
/// the worker that owns it; they only decide whether it gets evicted. The
/// listener reports failed handshakes with them.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("connection already closed")]
    Closed,
}

impl TransportError {
    /// Closes initiated or acknowledged by the peer are routine and only
    /// worth a debug line.
    pub fn is_expected_close(&self) -> bool {
        match self {
            TransportError::Closed => true,
            TransportError::WebSocket(err) => matches!(
                err,
                tungstenite::Error::ConnectionClosed
                    | tungstenite::Error::AlreadyClosed
                    | tungstenite::Error::Protocol(
                        tungstenite::error::ProtocolError::ResetWithoutClosingHandshake
                    )
            ),
            _ => false,
        }
    }
}
