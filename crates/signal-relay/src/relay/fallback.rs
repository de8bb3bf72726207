//! Streaming vs buffered mode selection
//!
//! A streaming request that fails before its commit point is retried once on
//! the buffered path, so the client gets a plain reply instead of an error.
//! After the commit point the session owns failure reporting and nothing is
//! retried here.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::session::StreamSession;
use super::session_id::SessionId;
use crate::config::RelayConfig;
use crate::error::Result;
use crate::types::GenerationRequest;
use crate::upstream::UpstreamClient;

/// Delivery mode requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    Buffered,
    Streaming,
}

/// What the front door should send back
#[derive(Debug)]
pub enum Reply {
    /// One complete payload
    Buffered(String),
    /// A session past its first pull, ready to be pumped into a client
    Streaming(StreamSession),
}

#[derive(Clone)]
pub struct FallbackController {
    upstream: Arc<dyn UpstreamClient>,
    config: RelayConfig,
}

impl FallbackController {
    pub fn new(upstream: Arc<dyn UpstreamClient>, config: RelayConfig) -> Self {
        Self { upstream, config }
    }

    pub async fn handle(
        &self,
        id: SessionId,
        request: &GenerationRequest,
        mode: ReplyMode,
    ) -> Result<Reply> {
        match mode {
            ReplyMode::Buffered => {
                debug!(session = %id, upstream = self.upstream.name(), "Buffered reply");
                let text = self.upstream.generate_buffered(request).await?;
                Ok(Reply::Buffered(text))
            }
            ReplyMode::Streaming => self.handle_streaming(id, request).await,
        }
    }

    async fn handle_streaming(&self, id: SessionId, request: &GenerationRequest) -> Result<Reply> {
        let fragments = self.upstream.generate_streaming(request);
        let err = match StreamSession::begin(id.clone(), fragments, self.config.request_timeout())
            .await
        {
            Ok(session) => return Ok(Reply::Streaming(session)),
            Err(e) => e,
        };

        if !self.config.fallback_to_buffered || !err.is_fallback_eligible() {
            warn!(
                session = %id,
                error_type = err.kind(),
                "Stream failed before commit, no fallback: {err}"
            );
            return Err(err);
        }

        info!(
            session = %id,
            error_type = err.kind(),
            "Stream failed before commit, retrying buffered: {err}"
        );

        match self.upstream.generate_buffered(request).await {
            Ok(text) => Ok(Reply::Buffered(text)),
            Err(retry_err) => {
                warn!(
                    session = %id,
                    error_type = retry_err.kind(),
                    "Buffered fallback failed: {retry_err}"
                );
                Err(retry_err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::relay::session::SessionState;
    use crate::testing::{ScriptStep, ScriptedUpstream, sample_request};

    fn controller(upstream: &ScriptedUpstream, fallback: bool) -> FallbackController {
        let config = RelayConfig {
            fallback_to_buffered: fallback,
            ..RelayConfig::default()
        };
        FallbackController::new(Arc::new(upstream.clone()), config)
    }

    #[tokio::test]
    async fn test_buffered_mode_single_call() {
        let upstream = ScriptedUpstream::new().with_buffered(Ok("full reply".to_string()));
        let reply = controller(&upstream, true)
            .handle(SessionId::generate(), &sample_request(), ReplyMode::Buffered)
            .await
            .unwrap();

        assert!(matches!(reply, Reply::Buffered(ref t) if t == "full reply"));
        assert_eq!(upstream.buffered_calls(), 1);
        assert_eq!(upstream.streaming_calls(), 0);
    }

    #[tokio::test]
    async fn test_buffered_mode_error_is_not_retried() {
        let upstream = ScriptedUpstream::new()
            .with_buffered(Err(RelayError::UpstreamUnavailable("down".into())));
        let err = controller(&upstream, true)
            .handle(SessionId::generate(), &sample_request(), ReplyMode::Buffered)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "upstream_unavailable");
        assert_eq!(upstream.buffered_calls(), 1);
    }

    #[tokio::test]
    async fn test_streaming_mode_returns_session() {
        let upstream = ScriptedUpstream::new().with_stream(vec![ScriptStep::text("hi")]);
        let reply = controller(&upstream, true)
            .handle(SessionId::generate(), &sample_request(), ReplyMode::Streaming)
            .await
            .unwrap();

        match reply {
            Reply::Streaming(session) => assert_eq!(session.state(), SessionState::Streaming),
            Reply::Buffered(_) => panic!("expected a streaming reply"),
        }
        assert_eq!(upstream.buffered_calls(), 0);
    }

    #[tokio::test]
    async fn test_pre_commit_failure_falls_back() {
        let upstream = ScriptedUpstream::new()
            .with_stream(vec![ScriptStep::fail(RelayError::UpstreamTimeout("slow".into()))])
            .with_buffered(Ok("buffered instead".to_string()));
        let reply = controller(&upstream, true)
            .handle(SessionId::generate(), &sample_request(), ReplyMode::Streaming)
            .await
            .unwrap();

        assert!(matches!(reply, Reply::Buffered(ref t) if t == "buffered instead"));
        assert_eq!(upstream.streaming_calls(), 1);
        assert_eq!(upstream.buffered_calls(), 1);
    }

    #[tokio::test]
    async fn test_fallback_failure_surfaces_retry_error() {
        let upstream = ScriptedUpstream::new()
            .with_stream(vec![ScriptStep::fail(RelayError::UpstreamTimeout("slow".into()))])
            .with_buffered(Err(RelayError::UpstreamUnavailable("still down".into())));
        let err = controller(&upstream, true)
            .handle(SessionId::generate(), &sample_request(), ReplyMode::Streaming)
            .await
            .unwrap_err();

        assert_eq!(err, RelayError::UpstreamUnavailable("still down".into()));
        assert_eq!(upstream.buffered_calls(), 1);
    }

    #[tokio::test]
    async fn test_fallback_disabled_surfaces_stream_error() {
        let upstream = ScriptedUpstream::new()
            .with_stream(vec![ScriptStep::fail(RelayError::UpstreamProtocol("bad".into()))]);
        let err = controller(&upstream, false)
            .handle(SessionId::generate(), &sample_request(), ReplyMode::Streaming)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "upstream_protocol_error");
        assert_eq!(upstream.buffered_calls(), 0);
    }
}
