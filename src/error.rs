//! Error types for the relay endpoint and the status tracker.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Non-standard "client closed request".
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Every way a relay invocation can end other than streaming.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Server misconfigured: upstream API key is not set")]
    Misconfigured,

    #[error("Upstream rejected the request with {status}")]
    UpstreamRejected { status: StatusCode, body: String },

    #[error("Failed to connect to upstream: {0}")]
    ConnectFailed(String),

    #[error("Client closed request")]
    ClientClosed,
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Misconfigured => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::UpstreamRejected { status, .. } => *status,
            RelayError::ConnectFailed(_) => StatusCode::BAD_GATEWAY,
            RelayError::ClientClosed => {
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
            }
        }
    }
}

#[derive(Serialize)]
struct Detail {
    detail: &'static str,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            RelayError::Misconfigured => (
                status,
                Json(Detail { detail: "Server misconfigured: status stream credentials are not set" }),
            )
                .into_response(),
            RelayError::UpstreamRejected { body, .. } => (
                status,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))],
                body,
            )
                .into_response(),
            // cause stays in the server log
            RelayError::ConnectFailed(_) => {
                (status, Json(Detail { detail: "Failed to connect to status stream" })).into_response()
            }
            RelayError::ClientClosed => status.into_response(),
        }
    }
}

/// Connection-level problems surfaced to tracker consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TrackerError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("relay responded with status {status}")]
    Rejected { status: u16 },

    #[error("unexpected content type: {0}")]
    InvalidContentType(String),

    #[error("stream interrupted: {0}")]
    Stream(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}
