//! Request, response and fragment types shared by the relay
//!
//! `GenerationRequest` is the payload both reply endpoints accept;
//! `Fragment` is one ordered unit of streamed text.

use serde::{Deserialize, Serialize};

/// Where a post was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostSource {
    Linkedin,
    Reddit,
    X,
}

impl PostSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostSource::Linkedin => "linkedin",
            PostSource::Reddit => "reddit",
            PostSource::X => "x",
        }
    }
}

impl std::fmt::Display for PostSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discovered post the reply is written for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub source: PostSource,
    pub title: String,
    pub url: String,
    pub snippet: String,
    /// Publication timestamp as reported by search; not used by the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
}

/// Payload accepted by both `/reply` and `/reply/stream`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub topic: String,
    pub post: Post,
}

/// Buffered-mode response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyResponse {
    pub response: String,
}

/// One ordered unit of generated text
///
/// Sequence numbers start at 1 and increase by one within a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub seq: u64,
    pub text: String,
}

impl Fragment {
    pub fn new(seq: u64, text: impl Into<String>) -> Self {
        Self {
            seq,
            text: text.into(),
        }
    }
}

/// How a stream ended, as told to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Done,
    Error(String),
}
