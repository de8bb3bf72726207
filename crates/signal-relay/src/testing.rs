//! Test utilities for signal-relay
//!
//! - `ScriptedUpstream`: an in-process `UpstreamClient` that replays a fixed
//!   script and counts calls and pulls
//! - `RecordingSink`: a `FrameSink` that keeps every frame and can simulate a
//!   client that disconnects or stops reading

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::relay::sink::FrameSink;
use crate::types::{Fragment, GenerationRequest, Post, PostSource};
use crate::upstream::{FragmentStream, UpstreamClient};

/// The request used throughout the tests
pub fn sample_request() -> GenerationRequest {
    GenerationRequest {
        topic: "CRM for small business".to_string(),
        post: Post {
            source: PostSource::Reddit,
            title: "Looking for CRM recommendations".to_string(),
            url: "https://reddit.com/r/smallbusiness/comments/crm".to_string(),
            snippet: "We're a 10-person team and outgrowing spreadsheets...".to_string(),
            ts: None,
        },
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One step of a scripted upstream stream
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Yield the next fragment with this text
    Text(String),
    /// Yield this error and end the stream
    Fail(RelayError),
    /// Wait before moving on to the next step
    Delay(Duration),
    /// Never yield again
    Stall,
}

impl ScriptStep {
    pub fn text(text: impl Into<String>) -> Self {
        ScriptStep::Text(text.into())
    }

    pub fn fail(error: RelayError) -> Self {
        ScriptStep::Fail(error)
    }
}

#[derive(Debug, Clone)]
enum ScriptItem {
    Item(Result<Fragment>),
    Delay(Duration),
    Stall,
}

#[derive(Debug)]
struct ScriptState {
    stream: Mutex<Vec<ScriptItem>>,
    buffered: Mutex<Result<String>>,
    streaming_calls: AtomicUsize,
    buffered_calls: AtomicUsize,
    pulls: AtomicUsize,
    shut_down: AtomicBool,
}

/// Scriptable upstream client
///
/// Every `generate_streaming` call replays the same script; every
/// `generate_buffered` call returns the same result. Clones share counters.
#[derive(Debug, Clone)]
pub struct ScriptedUpstream {
    state: Arc<ScriptState>,
}

impl Default for ScriptedUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedUpstream {
    /// An upstream whose stream is empty and whose buffered call fails
    pub fn new() -> Self {
        Self {
            state: Arc::new(ScriptState {
                stream: Mutex::new(Vec::new()),
                buffered: Mutex::new(Err(RelayError::UpstreamUnavailable(
                    "No buffered reply scripted".to_string(),
                ))),
                streaming_calls: AtomicUsize::new(0),
                buffered_calls: AtomicUsize::new(0),
                pulls: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Script the stream; text steps are numbered from 1
    pub fn with_stream(self, steps: Vec<ScriptStep>) -> Self {
        let mut seq = 0;
        let items = steps
            .into_iter()
            .map(|step| match step {
                ScriptStep::Text(text) => {
                    seq += 1;
                    ScriptItem::Item(Ok(Fragment::new(seq, text)))
                }
                ScriptStep::Fail(e) => ScriptItem::Item(Err(e)),
                ScriptStep::Delay(d) => ScriptItem::Delay(d),
                ScriptStep::Stall => ScriptItem::Stall,
            })
            .collect();
        *lock(&self.state.stream) = items;
        self
    }

    /// Script the stream with exact items, sequence numbers included
    pub fn with_raw_stream(self, items: Vec<Result<Fragment>>) -> Self {
        *lock(&self.state.stream) = items.into_iter().map(ScriptItem::Item).collect();
        self
    }

    pub fn with_buffered(self, result: Result<String>) -> Self {
        *lock(&self.state.buffered) = result;
        self
    }

    pub fn streaming_calls(&self) -> usize {
        self.state.streaming_calls.load(Ordering::SeqCst)
    }

    pub fn buffered_calls(&self) -> usize {
        self.state.buffered_calls.load(Ordering::SeqCst)
    }

    /// Number of times any stream from this upstream has been polled for an item
    pub fn pulls(&self) -> usize {
        self.state.pulls.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    async fn generate_buffered(&self, _request: &GenerationRequest) -> Result<String> {
        self.state.buffered_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.buffered).clone()
    }

    fn generate_streaming(&self, _request: &GenerationRequest) -> FragmentStream {
        self.state.streaming_calls.fetch_add(1, Ordering::SeqCst);
        let items = lock(&self.state.stream).clone();
        let state = Arc::clone(&self.state);

        stream::unfold(Some(items.into_iter()), move |items| {
            let state = Arc::clone(&state);
            async move {
                let mut items = items?;
                state.pulls.fetch_add(1, Ordering::SeqCst);
                loop {
                    match items.next()? {
                        ScriptItem::Delay(d) => tokio::time::sleep(d).await,
                        ScriptItem::Stall => std::future::pending::<()>().await,
                        ScriptItem::Item(Ok(fragment)) => return Some((Ok(fragment), Some(items))),
                        ScriptItem::Item(Err(e)) => return Some((Err(e), None)),
                    }
                }
            }
        })
        .boxed()
    }

    async fn shutdown(&self) {
        self.state.shut_down.store(true, Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[derive(Debug, Clone, Copy)]
enum SinkBehaviour {
    Accept,
    /// Accept this many frames, then behave as a closed connection
    DisconnectAfter(usize),
    /// Accept this many frames, then block every write forever
    StallAfter(usize),
}

/// Frame sink that records what a client would have received
#[derive(Debug, Clone)]
pub struct RecordingSink {
    frames: Arc<Mutex<Vec<Bytes>>>,
    behaviour: SinkBehaviour,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            frames: Arc::new(Mutex::new(Vec::new())),
            behaviour: SinkBehaviour::Accept,
        }
    }

    pub fn disconnect_after(frames: usize) -> Self {
        Self {
            behaviour: SinkBehaviour::DisconnectAfter(frames),
            ..Self::new()
        }
    }

    pub fn stall_after(frames: usize) -> Self {
        Self {
            behaviour: SinkBehaviour::StallAfter(frames),
            ..Self::new()
        }
    }

    pub fn frames(&self) -> Vec<Bytes> {
        lock(&self.frames).clone()
    }

    pub fn frame_count(&self) -> usize {
        lock(&self.frames).len()
    }

    /// Everything received, as one SSE body
    pub fn text(&self) -> String {
        lock(&self.frames)
            .iter()
            .map(|frame| String::from_utf8_lossy(frame).into_owned())
            .collect()
    }

    fn is_disconnected(&self) -> bool {
        matches!(self.behaviour, SinkBehaviour::DisconnectAfter(n) if self.frame_count() >= n)
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        match self.behaviour {
            SinkBehaviour::DisconnectAfter(n) if self.frame_count() >= n => {
                return Err(RelayError::ClientDisconnected);
            }
            SinkBehaviour::StallAfter(n) if self.frame_count() >= n => {
                std::future::pending::<()>().await;
            }
            _ => {}
        }
        lock(&self.frames).push(frame);
        Ok(())
    }

    async fn closed(&self) {
        if !self.is_disconnected() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_stream_numbers_fragments() {
        let upstream = ScriptedUpstream::new().with_stream(vec![
            ScriptStep::text("a"),
            ScriptStep::Delay(Duration::from_millis(1)),
            ScriptStep::text("b"),
        ]);
        let fragments: Vec<_> = upstream
            .generate_streaming(&sample_request())
            .collect()
            .await;

        assert_eq!(
            fragments,
            vec![Ok(Fragment::new(1, "a")), Ok(Fragment::new(2, "b"))]
        );
        assert_eq!(upstream.streaming_calls(), 1);
        assert_eq!(upstream.pulls(), 3);
    }

    #[tokio::test]
    async fn scripted_stream_ends_after_error() {
        let upstream = ScriptedUpstream::new().with_stream(vec![
            ScriptStep::fail(RelayError::UpstreamTimeout("slow".into())),
            ScriptStep::text("never"),
        ]);
        let fragments: Vec<_> = upstream
            .generate_streaming(&sample_request())
            .collect()
            .await;
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].is_err());
    }

    #[tokio::test]
    async fn scripted_stream_is_lazy() {
        let upstream = ScriptedUpstream::new().with_stream(vec![ScriptStep::text("a")]);
        let _stream = upstream.generate_streaming(&sample_request());
        assert_eq!(upstream.pulls(), 0);
    }

    #[tokio::test]
    async fn recording_sink_disconnects() {
        let mut sink = RecordingSink::disconnect_after(1);
        sink.send(Bytes::from("one")).await.unwrap();
        assert!(sink.send(Bytes::from("two")).await.is_err());
        sink.closed().await;
        assert_eq!(sink.text(), "one");
    }
}
