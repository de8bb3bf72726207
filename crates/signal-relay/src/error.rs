//! Error types for signal-relay

use std::time::Duration;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Main error type for relay operations
///
/// The first five variants are the relay's error kinds proper; the rest are
/// ambient failures (bad input, config, server plumbing).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    /// Connection or transport failure talking to the upstream provider
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream did not answer in time
    #[error("Upstream timed out: {0}")]
    UpstreamTimeout(String),

    /// Upstream answered with something we cannot interpret
    #[error("Upstream protocol error: {0}")]
    UpstreamProtocol(String),

    /// The client went away mid-stream
    #[error("Client disconnected")]
    ClientDisconnected,

    /// The whole-request deadline elapsed
    #[error("Deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// Request body or headers failed validation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server startup or runtime errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        RelayError::Io(e.to_string())
    }
}

impl RelayError {
    /// Stable, machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::UpstreamUnavailable(_) => "upstream_unavailable",
            RelayError::UpstreamTimeout(_) => "upstream_timeout",
            RelayError::UpstreamProtocol(_) => "upstream_protocol_error",
            RelayError::ClientDisconnected => "client_disconnected",
            RelayError::DeadlineExceeded(_) => "deadline_exceeded",
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::Config(_) => "config_error",
            RelayError::Server(_) => "server_error",
            RelayError::Io(_) => "io_error",
        }
    }

    /// Whether a streaming failure of this kind may be retried on the buffered path
    /// (only meaningful before the commit point)
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            RelayError::UpstreamUnavailable(_)
                | RelayError::UpstreamTimeout(_)
                | RelayError::UpstreamProtocol(_)
                | RelayError::DeadlineExceeded(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RelayError::UpstreamUnavailable(_) | RelayError::UpstreamProtocol(_) => {
                StatusCode::BAD_GATEWAY
            }
            RelayError::UpstreamTimeout(_) | RelayError::DeadlineExceeded(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        });

        (self.status_code(), Json(body)).into_response()
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(
            RelayError::UpstreamUnavailable("x".into()).kind(),
            "upstream_unavailable"
        );
        assert_eq!(RelayError::UpstreamTimeout("x".into()).kind(), "upstream_timeout");
        assert_eq!(
            RelayError::UpstreamProtocol("x".into()).kind(),
            "upstream_protocol_error"
        );
        assert_eq!(RelayError::ClientDisconnected.kind(), "client_disconnected");
        assert_eq!(
            RelayError::DeadlineExceeded(Duration::from_secs(1)).kind(),
            "deadline_exceeded"
        );
    }

    #[test]
    fn test_fallback_eligibility() {
        assert!(RelayError::UpstreamUnavailable("down".into()).is_fallback_eligible());
        assert!(RelayError::UpstreamTimeout("slow".into()).is_fallback_eligible());
        assert!(RelayError::UpstreamProtocol("garbage".into()).is_fallback_eligible());
        assert!(RelayError::DeadlineExceeded(Duration::from_secs(5)).is_fallback_eligible());

        assert!(!RelayError::ClientDisconnected.is_fallback_eligible());
        assert!(!RelayError::InvalidRequest("bad".into()).is_fallback_eligible());
        assert!(!RelayError::Config("bad".into()).is_fallback_eligible());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            RelayError::InvalidRequest("x".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            RelayError::UpstreamUnavailable("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            RelayError::DeadlineExceeded(Duration::from_secs(1)).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            RelayError::Server("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_into_response_renders_structured_body() {
        let response = RelayError::UpstreamTimeout("read timed out".into()).into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "upstream_timeout");
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .contains("read timed out")
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let err: RelayError = std::io::Error::other("disk on fire").into();
        assert_eq!(err.kind(), "io_error");
        assert!(err.to_string().contains("disk on fire"));
    }
}
