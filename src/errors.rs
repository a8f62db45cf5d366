//! Central error types for tarifin-stream.

use axum::http::StatusCode;
use std::fmt;
use thiserror::Error;

/// Why a session stopped before reaching a natural end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The consumer went away (HTTP client disconnect, dropped iterator).
    ClientDisconnected,
    /// The session outlived `session_timeout_secs`.
    Timeout,
    /// The process is shutting down.
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CancelReason::ClientDisconnected => "client disconnected",
            CancelReason::Timeout => "session timed out",
            CancelReason::Shutdown => "server shutting down",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Tokenizer error: {0}")]
    Encoding(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Generation cancelled: {0}")]
    Cancelled(CancelReason),

    #[error("Generator busy: all decode slots are in use")]
    Busy,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// HTTP status used when this error is reported before any body bytes were sent.
    pub fn status_code(&self) -> StatusCode {
        match self {
            StreamError::Validation(_) | StreamError::Encoding(_) => StatusCode::BAD_REQUEST,
            StreamError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            StreamError::Cancelled(CancelReason::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            StreamError::Cancelled(CancelReason::Shutdown) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for errors caused by the request itself rather than the service.
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}
