//! Reference client for the relay's reply endpoints
//!
//! Used by the `reply` subcommand. Streaming replies are decoded frame by
//! frame; if the stream cannot be decoded before any fragment arrived, the
//! client asks the buffered endpoint instead.

use futures::StreamExt;
use reqwest::{Client, Response, StatusCode, header};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::relay::framing::{Frame, FrameDecoder};
use crate::types::{GenerationRequest, ReplyResponse};
use crate::upstream::sse::LineDecoder;

/// A reply obtained through the streaming endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct StreamedReply {
    pub text: String,
    /// Fragment frames received; zero when the reply came back buffered
    pub fragments: u64,
    /// The reply arrived as one JSON body, from either side's fallback
    pub buffered: bool,
}

/// Where a streaming attempt stopped
enum StreamEnd {
    Done,
    /// Nothing usable arrived; safe to retry buffered
    Undecodable(RelayError),
}

pub struct ReplyClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl ReplyClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RelayError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// `POST /reply`
    pub async fn reply(&self, request: &GenerationRequest) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/reply", self.base_url))
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| RelayError::UpstreamUnavailable(format!("Request failed: {e}")))?;
        let response = check_status(response).await?;

        let body: ReplyResponse = response
            .json()
            .await
            .map_err(|e| RelayError::UpstreamProtocol(format!("Invalid reply body: {e}")))?;
        Ok(body.response)
    }

    /// `POST /reply/stream`, calling `on_fragment` for each text fragment
    ///
    /// A buffered JSON answer is passed to `on_fragment` whole. An error from
    /// `on_fragment` stops reading and is returned as is.
    pub async fn reply_stream<F>(
        &self,
        request: &GenerationRequest,
        mut on_fragment: F,
    ) -> Result<StreamedReply>
    where
        F: FnMut(&str) -> Result<()>,
    {
        let response = self
            .client
            .post(format!("{}/reply/stream", self.base_url))
            .timeout(self.timeout)
            .header(header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| RelayError::UpstreamUnavailable(format!("Request failed: {e}")))?;
        let response = check_status(response).await?;

        if !is_event_stream(&response) {
            debug!("Relay answered buffered");
            let body: ReplyResponse = response
                .json()
                .await
                .map_err(|e| RelayError::UpstreamProtocol(format!("Invalid reply body: {e}")))?;
            on_fragment(&body.response)?;
            return Ok(StreamedReply {
                text: body.response,
                fragments: 0,
                buffered: true,
            });
        }

        let mut reply = StreamedReply {
            text: String::new(),
            fragments: 0,
            buffered: false,
        };

        match read_stream(response, &mut reply, &mut on_fragment).await? {
            StreamEnd::Done => Ok(reply),
            StreamEnd::Undecodable(e) => {
                warn!("Stream unusable before first fragment, retrying buffered: {e}");
                let text = self.reply(request).await?;
                on_fragment(&text)?;
                Ok(StreamedReply {
                    text,
                    fragments: 0,
                    buffered: true,
                })
            }
        }
    }
}

async fn read_stream<F>(
    response: Response,
    reply: &mut StreamedReply,
    on_fragment: &mut F,
) -> Result<StreamEnd>
where
    F: FnMut(&str) -> Result<()>,
{
    let mut body = response.bytes_stream();
    let mut lines = LineDecoder::new();
    let mut frames = FrameDecoder::new();

    let failure = loop {
        let decoded = match body.next().await {
            Some(Ok(chunk)) => lines.push(&chunk),
            Some(Err(e)) => {
                break RelayError::UpstreamUnavailable(format!("Stream interrupted: {e}"));
            }
            None => match lines.finish() {
                Ok(tail) => {
                    let tail = tail.into_iter().collect();
                    if let Some(end) = apply_lines(tail, &mut frames, reply, on_fragment)? {
                        return Ok(end);
                    }
                    break RelayError::UpstreamProtocol(
                        "Stream ended without a termination frame".to_string(),
                    );
                }
                Err(e) => break e,
            },
        };

        if let Some(end) = apply_lines(decoded.lines, &mut frames, reply, on_fragment)? {
            return Ok(end);
        }
        if let Some(e) = decoded.error {
            break e;
        }
    };

    if reply.fragments == 0 {
        Ok(StreamEnd::Undecodable(failure))
    } else {
        Err(failure)
    }
}

/// Feed decoded lines through the frame decoder
///
/// Returns `Some` once a termination frame has been seen.
fn apply_lines<F>(
    lines: Vec<String>,
    frames: &mut FrameDecoder,
    reply: &mut StreamedReply,
    on_fragment: &mut F,
) -> Result<Option<StreamEnd>>
where
    F: FnMut(&str) -> Result<()>,
{
    for line in lines {
        match frames.push_line(&line) {
            None => {}
            Some(Frame::Fragment(fragment)) => {
                on_fragment(&fragment.text)?;
                reply.text.push_str(&fragment.text);
                reply.fragments += 1;
            }
            Some(Frame::Done) => return Ok(Some(StreamEnd::Done)),
            Some(Frame::Error(message)) => {
                return Err(RelayError::UpstreamUnavailable(format!(
                    "Stream failed after {} fragments: {message}",
                    reply.fragments
                )));
            }
        }
    }
    Ok(None)
}

fn is_event_stream(response: &Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"))
}

/// Turn a non-2xx relay response into an error carrying its message
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body: serde_json::Value = response.json().await.unwrap_or_default();
    let message = body["error"]["message"]
        .as_str()
        .unwrap_or("Unknown error")
        .to_string();

    Err(match status {
        StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => {
            RelayError::InvalidRequest(message)
        }
        StatusCode::GATEWAY_TIMEOUT => RelayError::UpstreamTimeout(message),
        StatusCode::BAD_GATEWAY => RelayError::UpstreamUnavailable(message),
        _ => RelayError::Server(format!("Relay returned {status}: {message}")),
    })
}
