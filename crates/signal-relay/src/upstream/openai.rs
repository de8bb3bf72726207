//! Upstream client for OpenAI-compatible chat completion APIs
//!
//! One pooled `reqwest::Client` serves every request. Buffered calls read
//! the whole completion; streaming calls decode the SSE body lazily as the
//! session pulls fragments.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use std::collections::VecDeque;
use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::prompts::{ChatMessage, reply_messages};
use super::sse::{LineDecoder, StreamLine, parse_line};
use super::{FragmentStream, UpstreamClient};
use crate::config::UpstreamConfig;
use crate::error::{RelayError, Result};
use crate::types::{Fragment, GenerationRequest};

/// Upstream client speaking the OpenAI chat completions protocol
#[derive(Debug)]
pub struct OpenAiClient {
    client: Client,
    config: UpstreamConfig,
    api_key: String,
    completions_url: String,
    closed: Arc<AtomicBool>,
}

/// OpenAI-compatible chat completion request
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

impl OpenAiClient {
    /// Create a client with an explicit API key
    pub fn new(config: &UpstreamConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(config.max_idle_connections)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| RelayError::Config(format!("Failed to create HTTP client: {e}")))?;

        let completions_url = format!("{}/chat/completions", config.api_url.trim_end_matches('/'));

        info!(
            "OpenAiClient initialized with model: {}, api_url: {}",
            config.model, config.api_url
        );

        Ok(Self {
            client,
            config: config.clone(),
            api_key: api_key.into(),
            completions_url,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Create a client reading the API key from `config.api_key_env`
    pub fn from_env(config: &UpstreamConfig) -> Result<Self> {
        let api_key = env::var(&config.api_key_env).map_err(|_| {
            RelayError::Config(format!("API key env var '{}' not set", config.api_key_env))
        })?;
        Self::new(config, api_key)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(shut_down_error());
        }
        Ok(())
    }

    fn completion_request(&self, request: &GenerationRequest, stream: bool) -> RequestBuilder {
        let body = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: reply_messages(request),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream,
        };

        self.client
            .post(&self.completions_url)
            .bearer_auth(&self.api_key)
            .json(&body)
    }
}

#[async_trait]
impl UpstreamClient for OpenAiClient {
    async fn generate_buffered(&self, request: &GenerationRequest) -> Result<String> {
        self.ensure_open()?;
        debug!("Calling upstream (buffered) at: {}", self.completions_url);

        let response = self
            .completion_request(request, false)
            .timeout(self.config.timeout())
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status(response).await?;

        let body: serde_json::Value = response.json().await.map_err(map_transport_error)?;
        completion_text(&body)
    }

    fn generate_streaming(&self, request: &GenerationRequest) -> FragmentStream {
        let pending = PendingStream {
            request: self.completion_request(request, true),
            closed: Arc::clone(&self.closed),
            head_timeout: self.config.timeout(),
            idle_timeout: self.config.stream_idle_timeout(),
        };

        stream::unfold(DeltaState::Connect(pending), next_fragment).boxed()
    }

    async fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("OpenAiClient shut down; pooled connections released on drop");
        }
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

fn shut_down_error() -> RelayError {
    RelayError::UpstreamUnavailable("Upstream client has been shut down".to_string())
}

/// Map a reqwest failure onto the relay's error kinds
fn map_transport_error(e: reqwest::Error) -> RelayError {
    if e.is_timeout() {
        RelayError::UpstreamTimeout(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        RelayError::UpstreamUnavailable(format!("Failed to connect to upstream: {e}"))
    } else if e.is_decode() {
        RelayError::UpstreamProtocol(format!("Failed to decode upstream response: {e}"))
    } else {
        RelayError::UpstreamUnavailable(format!("Request failed: {e}"))
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    let message = format!("API returned {status}: {body}");

    Err(match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            RelayError::UpstreamTimeout(message)
        }
        StatusCode::TOO_MANY_REQUESTS => RelayError::UpstreamUnavailable(message),
        s if s.is_server_error() => RelayError::UpstreamUnavailable(message),
        _ => RelayError::UpstreamProtocol(message),
    })
}

/// Pull the reply text out of a non-streaming completion body
fn completion_text(body: &serde_json::Value) -> Result<String> {
    if let Some(text) = body.get("output_text").and_then(|t| t.as_str()) {
        return Ok(text.to_string());
    }

    let message = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| {
            RelayError::UpstreamProtocol("Completion response has no choices".to_string())
        })?;

    Ok(message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string())
}

enum DeltaState {
    Connect(PendingStream),
    Reading(Box<ReadingStream>),
    Finished,
}

/// A streaming request that has been built but not sent
struct PendingStream {
    request: RequestBuilder,
    closed: Arc<AtomicBool>,
    head_timeout: Duration,
    idle_timeout: Duration,
}

impl PendingStream {
    async fn connect(self) -> Result<ReadingStream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(shut_down_error());
        }

        let response = tokio::time::timeout(self.head_timeout, self.request.send())
            .await
            .map_err(|_| {
                RelayError::UpstreamTimeout(format!(
                    "No response from upstream within {:?}",
                    self.head_timeout
                ))
            })?
            .map_err(map_transport_error)?;
        let response = check_status(response).await?;

        Ok(ReadingStream {
            body: response.bytes_stream().boxed(),
            decoder: LineDecoder::new(),
            queued: VecDeque::new(),
            seq: 0,
            saw_done: false,
            exhausted: false,
            failure: None,
            idle_timeout: self.idle_timeout,
        })
    }
}

/// An upstream response body being decoded into text deltas
struct ReadingStream {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: LineDecoder,
    queued: VecDeque<String>,
    seq: u64,
    saw_done: bool,
    exhausted: bool,
    /// Raised while decoding; reported once the deltas before it are drained
    failure: Option<RelayError>,
    idle_timeout: Duration,
}

impl ReadingStream {
    async fn next_text(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(text) = self.queued.pop_front() {
                return Ok(Some(text));
            }
            if let Some(e) = self.failure.take() {
                return Err(e);
            }
            if self.saw_done || self.exhausted {
                return Ok(None);
            }

            match tokio::time::timeout(self.idle_timeout, self.body.next()).await {
                Err(_) => {
                    return Err(RelayError::UpstreamTimeout(format!(
                        "No data from upstream for {:?}",
                        self.idle_timeout
                    )));
                }
                Ok(Some(Err(e))) => self.failure = Some(map_transport_error(e)),
                Ok(Some(Ok(chunk))) => {
                    let decoded = self.decoder.push(&chunk);
                    self.accept_all(decoded.lines);
                    if self.failure.is_none() && !self.saw_done {
                        self.failure = decoded.error;
                    }
                }
                Ok(None) => {
                    self.exhausted = true;
                    match self.decoder.finish() {
                        Ok(tail) => self.accept_all(tail),
                        Err(e) => self.failure = Some(e),
                    }
                    if !self.saw_done && self.failure.is_none() {
                        warn!("Upstream stream ended without [DONE]");
                    }
                }
            }
        }
    }

    fn accept_all(&mut self, lines: impl IntoIterator<Item = String>) {
        for line in lines {
            if let Err(e) = self.accept(&line) {
                self.failure = Some(e);
                return;
            }
        }
    }

    fn accept(&mut self, line: &str) -> Result<()> {
        if self.saw_done {
            return Ok(());
        }
        match parse_line(line)? {
            StreamLine::Delta(text) => self.queued.push_back(text),
            StreamLine::Done => self.saw_done = true,
            StreamLine::Skip => {}
        }
        Ok(())
    }
}

async fn next_fragment(state: DeltaState) -> Option<(Result<Fragment>, DeltaState)> {
    let mut reading = match state {
        DeltaState::Finished => return None,
        DeltaState::Reading(reading) => reading,
        DeltaState::Connect(pending) => match pending.connect().await {
            Ok(reading) => Box::new(reading),
            Err(e) => return Some((Err(e), DeltaState::Finished)),
        },
    };

    match reading.next_text().await {
        Ok(Some(text)) => {
            reading.seq += 1;
            let fragment = Fragment::new(reading.seq, text);
            Some((Ok(fragment), DeltaState::Reading(reading)))
        }
        Ok(None) => None,
        Err(e) => Some((Err(e), DeltaState::Finished)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_text_from_choices() {
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "Hi there!"}}]
        });
        assert_eq!(completion_text(&body).unwrap(), "Hi there!");
    }

    #[test]
    fn test_completion_text_prefers_output_text() {
        let body = serde_json::json!({
            "output_text": "from output_text",
            "choices": [{"message": {"content": "from choices"}}]
        });
        assert_eq!(completion_text(&body).unwrap(), "from output_text");
    }

    #[test]
    fn test_completion_text_null_content() {
        let body = serde_json::json!({"choices": [{"message": {"content": null}}]});
        assert_eq!(completion_text(&body).unwrap(), "");
    }

    #[test]
    fn test_completion_text_missing_choices() {
        let body = serde_json::json!({"object": "list"});
        let err = completion_text(&body).unwrap_err();
        assert!(matches!(err, RelayError::UpstreamProtocol(_)));
    }

    #[test]
    fn test_request_serialization_omits_stream_when_false() {
        let request = ChatCompletionRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![],
            temperature: 0.2,
            max_tokens: 900,
            stream: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("stream").is_none());

        let request = ChatCompletionRequest {
            stream: true,
            ..request
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stream"], true);
    }

    #[test]
    fn test_from_env_missing_key() {
        let config = UpstreamConfig {
            api_key_env: "SIGNAL_RELAY_TEST_MISSING_KEY".to_string(),
            ..UpstreamConfig::default()
        };
        unsafe { env::remove_var("SIGNAL_RELAY_TEST_MISSING_KEY") };

        let err = OpenAiClient::from_env(&config).unwrap_err();
        assert!(err.to_string().contains("SIGNAL_RELAY_TEST_MISSING_KEY"));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_further_calls() {
        let client = OpenAiClient::new(&UpstreamConfig::default(), "test-key").unwrap();
        client.shutdown().await;

        let request = crate::testing::sample_request();
        let err = client.generate_buffered(&request).await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamUnavailable(_)));

        let mut fragments = client.generate_streaming(&request);
        let first = fragments.next().await.unwrap();
        assert!(matches!(first, Err(RelayError::UpstreamUnavailable(_))));
        assert!(fragments.next().await.is_none());
    }
}
