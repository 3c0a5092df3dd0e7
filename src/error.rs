// Relay error taxonomy and its JSON rendering for pre-flight failures.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Bad client input, detected before any network work.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The origin would not reveal the resource length.
    #[error("origin did not report a size for {url}")]
    SizeUnknown { url: String },

    /// A range or process step failed after the transfer started.
    #[error("transfer failed at offset {offset}: {reason}")]
    PartialTransferFailure { offset: u64, reason: String },

    #[error("failed to launch mux process: {0}")]
    ProcessLaunchFailure(String),

    #[error("mux process failed: {stderr}")]
    ProcessExecutionFailure { stderr: String },

    /// Normal cancellation trigger, never reported to the client.
    #[error("client disconnected")]
    ClientDisconnected,

    #[error("upstream error: {0}")]
    Upstream(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::ProcessLaunchFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::SizeUnknown { .. }
            | Self::PartialTransferFailure { .. }
            | Self::ProcessExecutionFailure { .. }
            | Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            // Nobody is listening any more; the status only shows up in logs.
            Self::ClientDisconnected => StatusCode::REQUEST_TIMEOUT,
        }
    }

    /// Short machine-friendly label used as the JSON `error` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::SizeUnknown { .. } => "size_unknown",
            Self::PartialTransferFailure { .. } => "partial_transfer_failure",
            Self::ProcessLaunchFailure(_) => "process_launch_failure",
            Self::ProcessExecutionFailure { .. } => "process_execution_failure",
            Self::ClientDisconnected => "client_disconnected",
            Self::Upstream(_) => "upstream_error",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.kind().to_string(),
            details: Some(self.to_string()),
        };
        (self.status(), Json(body)).into_response()
    }
}
