//! HTTP front door
//!
//! Routes:
//! - `POST /reply` buffered reply as JSON
//! - `POST /reply/stream` SSE stream, or a JSON reply after a pre-commit fallback
//! - `GET /health`

use axum::{
    Json, Router,
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, HeaderName, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, error, info, info_span};

use super::fallback::{FallbackController, Reply, ReplyMode};
use super::session_id::{SESSION_ID_HEADER, SessionId};
use super::sink::ChannelSink;
use crate::config::{Config, RelayConfig};
use crate::error::{RelayError, Result};
use crate::types::{GenerationRequest, ReplyResponse};
use crate::upstream::UpstreamClient;

/// Name reported by the health endpoint
pub const SERVICE_NAME: &str = "signal-relay";

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Shared application state for all handlers
pub struct AppState {
    pub controller: FallbackController,
    pub relay: RelayConfig,
}

impl AppState {
    pub fn new(upstream: Arc<dyn UpstreamClient>, relay: RelayConfig) -> Self {
        Self {
            controller: FallbackController::new(upstream, relay.clone()),
            relay,
        }
    }
}

/// The relay server
pub struct RelayServer {
    config: Config,
    upstream: Arc<dyn UpstreamClient>,
}

impl RelayServer {
    pub fn new(config: Config, upstream: Arc<dyn UpstreamClient>) -> Self {
        Self { config, upstream }
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(AppState::new(
            Arc::clone(&self.upstream),
            self.config.relay.clone(),
        ));
        create_router(state)
    }

    /// Bind the configured address and serve until Ctrl+C or SIGTERM
    pub async fn serve(&self) -> Result<()> {
        let addr: SocketAddr = self.config.server.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::Server(format!("Failed to bind to {addr}: {e}")))?;

        self.serve_with_listener(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    ///
    /// The upstream client is shut down once in-flight requests have drained.
    pub async fn serve_with_listener<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener
            .local_addr()
            .map_err(|e| RelayError::Server(format!("Failed to read local address: {e}")))?;

        info!("Starting relay server on {addr}");
        info!(
            "Upstream: {}, request timeout: {:?}, buffered fallback: {}",
            self.upstream.name(),
            self.config.relay.request_timeout(),
            if self.config.relay.fallback_to_buffered {
                "enabled"
            } else {
                "disabled"
            }
        );

        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| RelayError::Server(format!("Server error: {e}")));

        self.upstream.shutdown().await;
        served?;

        info!("Relay server shut down gracefully");
        Ok(())
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/reply", post(reply_handler))
        .route("/reply/stream", post(reply_stream_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy", "service": SERVICE_NAME}))
}

/// Buffered reply: one upstream call, one JSON body
async fn reply_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Response> {
    let request = parse_request(payload)?;
    let id = SessionId::from_headers(&headers)?;

    match state
        .controller
        .handle(id.clone(), &request, ReplyMode::Buffered)
        .await?
    {
        Reply::Buffered(text) => Ok(buffered_response(&id, text)),
        Reply::Streaming(_) => Err(RelayError::Server(
            "Buffered request produced a stream".to_string(),
        )),
    }
}

/// Streaming reply
///
/// The response head is only produced after the session's first upstream
/// pull, so any failure up to that point can still become a JSON reply.
async fn reply_stream_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Response> {
    let request = parse_request(payload)?;
    let id = SessionId::from_headers(&headers)?;

    let session = match state
        .controller
        .handle(id.clone(), &request, ReplyMode::Streaming)
        .await?
    {
        Reply::Buffered(text) => return Ok(buffered_response(&id, text)),
        Reply::Streaming(session) => session,
    };

    let (sink, body) = ChannelSink::channel(state.relay.client_buffer_frames);
    let span = info_span!("session", id = %id);
    tokio::spawn(
        async move {
            session.run(sink).await;
        }
        .instrument(span),
    );

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        [(SESSION_ID_HEADER, id.to_string())],
        Body::from_stream(body),
    )
        .into_response())
}

fn parse_request(
    payload: std::result::Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<GenerationRequest> {
    payload
        .map(|Json(request)| request)
        .map_err(|rejection| RelayError::InvalidRequest(rejection.body_text()))
}

fn buffered_response(id: &SessionId, text: String) -> Response {
    (
        StatusCode::OK,
        [(SESSION_ID_HEADER, id.to_string())],
        Json(ReplyResponse { response: text }),
    )
        .into_response()
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
