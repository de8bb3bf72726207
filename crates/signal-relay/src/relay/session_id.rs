//! Stream session identifiers
//!
//! Every stream session carries an id used to correlate its log lines.
//! Clients may supply one in the `X-Session-Id` header; otherwise a UUID is
//! generated. Supplied ids must be alphanumeric with underscores and
//! hyphens, max 128 chars.

use axum::http::HeaderMap;
use thiserror::Error;
use uuid::Uuid;

use crate::error::RelayError;

/// Header a client may use to name its session
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Maximum length for session IDs
const MAX_SESSION_ID_LEN: usize = 128;

/// Errors that can occur during session ID validation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionIdError {
    #[error("Session ID cannot be empty")]
    Empty,

    #[error("Session ID contains invalid characters: allowed are a-z, A-Z, 0-9, _, -")]
    InvalidChars,

    #[error("Session ID exceeds maximum length of {MAX_SESSION_ID_LEN} characters")]
    TooLong,
}

impl From<SessionIdError> for RelayError {
    fn from(e: SessionIdError) -> Self {
        RelayError::InvalidRequest(e.to_string())
    }
}

/// A validated session ID
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Fresh random id
    pub fn generate() -> Self {
        SessionId(Uuid::new_v4().to_string())
    }

    /// Take the id from request headers, or generate one when absent
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, SessionIdError> {
        match headers.get(SESSION_ID_HEADER) {
            None => Ok(Self::generate()),
            Some(value) => {
                let value = value.to_str().map_err(|_| SessionIdError::InvalidChars)?;
                Self::try_from(value)
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), SessionIdError> {
        if s.is_empty() {
            return Err(SessionIdError::Empty);
        }

        if s.len() > MAX_SESSION_ID_LEN {
            return Err(SessionIdError::TooLong);
        }

        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(SessionIdError::InvalidChars);
        }

        Ok(())
    }
}

impl TryFrom<&str> for SessionId {
    type Error = SessionIdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::validate(value)?;
        Ok(SessionId(value.to_string()))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_valid_session_ids() {
        assert!(SessionId::try_from("reply-abc").is_ok());
        assert!(SessionId::try_from("REPLY_123").is_ok());
        assert!(SessionId::try_from("a").is_ok());
        assert!(SessionId::try_from("123").is_ok());
    }

    #[test]
    fn test_invalid_session_ids() {
        assert_eq!(SessionId::try_from(""), Err(SessionIdError::Empty));
        assert_eq!(
            SessionId::try_from("has spaces"),
            Err(SessionIdError::InvalidChars)
        );
        assert_eq!(
            SessionId::try_from("test@email"),
            Err(SessionIdError::InvalidChars)
        );
    }

    #[test]
    fn test_length_limit() {
        let max_id = "a".repeat(128);
        assert!(SessionId::try_from(max_id.as_str()).is_ok());

        let long_id = "a".repeat(129);
        assert_eq!(
            SessionId::try_from(long_id.as_str()),
            Err(SessionIdError::TooLong)
        );
    }

    #[test]
    fn test_generated_ids_are_valid_and_distinct() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(SessionId::try_from(a.as_str()).is_ok());
    }

    #[test]
    fn test_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(SessionId::from_headers(&headers).is_ok());

        headers.insert(SESSION_ID_HEADER, HeaderValue::from_static("client-42"));
        assert_eq!(
            SessionId::from_headers(&headers).unwrap().as_str(),
            "client-42"
        );

        headers.insert(SESSION_ID_HEADER, HeaderValue::from_static("bad id!"));
        assert_eq!(
            SessionId::from_headers(&headers),
            Err(SessionIdError::InvalidChars)
        );
    }

    #[test]
    fn test_into_relay_error() {
        let err: RelayError = SessionIdError::TooLong.into();
        assert_eq!(err.kind(), "invalid_request");
    }

    #[test]
    fn test_display() {
        let id = SessionId::try_from("test-id").unwrap();
        assert_eq!(id.to_string(), "test-id");
    }
}
