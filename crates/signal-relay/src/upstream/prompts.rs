//! Reply prompt template

use serde::Serialize;

use crate::types::GenerationRequest;

/// System instructions for every public reply
pub const REPLY_SYSTEM_PROMPT: &str = "Write a concise, non-spammy public reply (2–3 sentences), helpful and respectful. Markdown only.";

/// Message in a chat completion request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

/// Build the chat messages for a reply to the given post
pub fn reply_messages(request: &GenerationRequest) -> Vec<ChatMessage> {
    let post = &request.post;
    vec![
        ChatMessage {
            role: "system",
            content: REPLY_SYSTEM_PROMPT.to_string(),
        },
        ChatMessage {
            role: "user",
            content: format!(
                "Topic: {}\nTitle: {}\nSnippet: {}\nURL: {}",
                request.topic, post.title, post.snippet, post.url
            ),
        },
    ]
}
