//! Upstream generation provider abstraction
//!
//! A single `UpstreamClient` is built at startup and shared by every request.
//! It produces either one buffered reply or a lazy `FragmentStream`.

mod openai;
pub mod prompts;
pub mod sse;

pub use openai::OpenAiClient;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::types::{Fragment, GenerationRequest};

/// Lazy, finite, non-restartable sequence of fragments
///
/// Nothing is sent upstream until the stream is first polled. It yields no
/// further items after an `Err` or its natural end. Dropping it cancels the
/// in-flight upstream response.
pub type FragmentStream = BoxStream<'static, Result<Fragment>>;

/// Trait for upstream generation providers
///
/// Implementations must be safe to call concurrently from many sessions.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Generate the full reply and return it in one piece
    async fn generate_buffered(&self, request: &GenerationRequest) -> Result<String>;

    /// Generate the reply as a lazy stream of fragments
    fn generate_streaming(&self, request: &GenerationRequest) -> FragmentStream;

    /// Release the shared transport; later calls fail with `UpstreamUnavailable`
    async fn shutdown(&self);

    /// Provider name for logging
    fn name(&self) -> &'static str;
}
