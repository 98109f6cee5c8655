//! Error types for address normalization, browser sessions and run control.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Why an address could not be turned into a navigable URL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("empty address")]
    Empty,

    #[error("blocked scheme '{0}': only http and https addresses can be visited")]
    BlockedScheme(String),

    #[error("'{0}' does not look like a web address")]
    NotAnAddress(String),

    #[error("unsupported scheme '{0}': only http and https addresses can be visited")]
    UnsupportedScheme(String),

    #[error("invalid address '{input}': {reason}")]
    Invalid { input: String, reason: String },
}

/// Errors raised by the session manager.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("navigation failed: {0}")]
    NavigationFailed(String),

    #[error("timed out after {ms}ms: {what}")]
    Timeout { what: String, ms: u64 },

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("screenshot failed: {0}")]
    ScreenshotFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors reported to control-surface callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("instruction is missing or empty")]
    EmptyInstruction,
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match self {
            ControlError::RunNotFound(_) => StatusCode::NOT_FOUND,
            ControlError::EmptyInstruction => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
