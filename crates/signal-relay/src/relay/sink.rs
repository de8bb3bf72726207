//! Client connection abstraction
//!
//! A session writes frames into a `FrameSink`. In the HTTP server the sink is
//! a bounded channel whose receiving end is the response body, so a dropped
//! client connection shows up as a closed channel.

use async_trait::async_trait;
use bytes::Bytes;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{RelayError, Result};

/// Destination for a session's frames
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Hand one frame to the client, waiting while the client is slow
    ///
    /// Fails with `ClientDisconnected` once the peer is gone.
    async fn send(&mut self, frame: Bytes) -> Result<()>;

    /// Resolves once the client has gone away
    async fn closed(&self);
}

/// Response body stream fed by a `ChannelSink`
pub type FrameBody = ReceiverStream<std::result::Result<Bytes, Infallible>>;

/// Sink backed by a bounded channel feeding an HTTP response body
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<std::result::Result<Bytes, Infallible>>,
}

impl ChannelSink {
    /// Create a sink and the body stream it feeds
    ///
    /// `capacity` bounds how many frames may wait on a slow client.
    pub fn channel(capacity: usize) -> (Self, FrameBody) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, ReceiverStream::new(rx))
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.tx
            .send(Ok(frame))
            .await
            .map_err(|_| RelayError::ClientDisconnected)
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}
