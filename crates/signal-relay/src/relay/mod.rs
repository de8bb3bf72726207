//! Streaming relay: sessions, framing, fallback and the HTTP front door

pub mod fallback;
pub mod framing;
pub mod server;
pub mod session;
pub mod session_id;
pub mod sink;

pub use fallback::{FallbackController, Reply, ReplyMode};
pub use framing::{Frame, FrameDecoder, encode_fragment, encode_termination, parse_frames};
pub use server::{AppState, RelayServer, create_router};
pub use session::{SessionOutcome, SessionReport, SessionState, StreamSession};
pub use session_id::{SESSION_ID_HEADER, SessionId, SessionIdError};
pub use sink::{ChannelSink, FrameSink};
