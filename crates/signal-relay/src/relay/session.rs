//! Per-request stream session
//!
//! A session owns one upstream fragment stream and pumps it, frame by frame,
//! into one client sink:
//!
//! ```text
//! Open -> Streaming -> ClosingOk | ClosingError -> Closed
//! ```
//!
//! `begin` performs the first upstream pull before anything is written, so
//! its failures happen before the commit point and may still be absorbed by
//! the fallback controller. Once `run` hands the first frame to the sink the
//! session is committed: later failures become an in-band error frame.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::time::Duration;
use tokio::time::{Instant, sleep_until, timeout, timeout_at};
use tracing::{debug, info, warn};

use super::framing::{encode_fragment, encode_termination};
use super::session_id::SessionId;
use super::sink::FrameSink;
use crate::error::{RelayError, Result};
use crate::types::{Fragment, Termination};
use crate::upstream::FragmentStream;

/// How long a termination frame may wait on a stalled client
const TERMINATION_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle of a stream session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Streaming,
    ClosingOk,
    ClosingError,
    Closed,
}

/// How a committed session ended
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Upstream finished and the success frame was delivered
    Completed,
    /// Upstream or deadline failure, surfaced as the error frame
    Failed(RelayError),
    /// The client went away; nothing more was written
    ClientGone,
}

/// Summary of a finished session, for logs and tests
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: SessionId,
    pub outcome: SessionOutcome,
    pub state: SessionState,
    pub fragments_delivered: u64,
    /// Concatenated text the client received; diagnostics only
    pub delivered_text: String,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

/// Why the pump loop stopped
enum PumpEnd {
    UpstreamDone,
    Failed(RelayError),
    ClientGone,
}

pub struct StreamSession {
    id: SessionId,
    fragments: FragmentStream,
    state: SessionState,
    /// First fragment, pulled by `begin` and not yet written
    pending: Option<Fragment>,
    exhausted: bool,
    last_seq: u64,
    fragments_delivered: u64,
    delivered_text: String,
    timeout: Duration,
    deadline: Instant,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("last_seq", &self.last_seq)
            .field("fragments_delivered", &self.fragments_delivered)
            .finish_non_exhaustive()
    }
}

impl StreamSession {
    /// Open a session and pull the first upstream item
    ///
    /// Nothing has been sent to the client when this returns, so an `Err`
    /// here is a pre-commit failure. The whole session, `run` included, must
    /// finish within `request_timeout`.
    pub async fn begin(
        id: SessionId,
        fragments: FragmentStream,
        request_timeout: Duration,
    ) -> Result<Self> {
        let started = Instant::now();
        let mut session = Self {
            id,
            fragments,
            state: SessionState::Open,
            pending: None,
            exhausted: false,
            last_seq: 0,
            fragments_delivered: 0,
            delivered_text: String::new(),
            timeout: request_timeout,
            deadline: started + request_timeout,
            started,
            started_at: Utc::now(),
        };

        let pulled = timeout_at(session.deadline, session.fragments.next()).await;
        let first = match pulled {
            Err(_) => Err(RelayError::DeadlineExceeded(request_timeout)),
            Ok(Some(Ok(fragment))) => session.accept(fragment).map(Some),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Ok(None),
        };

        match first {
            Ok(fragment) => {
                session.exhausted = fragment.is_none();
                session.pending = fragment;
                session.state = SessionState::Streaming;
                debug!(session = %session.id, "Stream session opened");
                Ok(session)
            }
            Err(e) => {
                session.state = SessionState::ClosingError;
                debug!(
                    session = %session.id,
                    error_type = e.kind(),
                    "Stream failed before commit: {e}"
                );
                Err(e)
            }
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Pump every fragment into `sink`, then exactly one termination frame
    ///
    /// The upstream stream is dropped before this returns, whatever the
    /// outcome, which releases the upstream call.
    pub async fn run<S: FrameSink>(mut self, mut sink: S) -> SessionReport {
        let end = self.pump(&mut sink).await;

        let outcome = match end {
            PumpEnd::UpstreamDone => {
                self.state = SessionState::ClosingOk;
                if write_termination(&mut sink, &Termination::Done).await {
                    SessionOutcome::Completed
                } else {
                    SessionOutcome::ClientGone
                }
            }
            PumpEnd::Failed(e) => {
                self.state = SessionState::ClosingError;
                warn!(
                    session = %self.id,
                    error_type = e.kind(),
                    fragments = self.fragments_delivered,
                    "Stream failed after commit: {e}"
                );
                if write_termination(&mut sink, &Termination::Error(e.to_string())).await {
                    SessionOutcome::Failed(e)
                } else {
                    SessionOutcome::ClientGone
                }
            }
            PumpEnd::ClientGone => {
                self.state = SessionState::ClosingError;
                SessionOutcome::ClientGone
            }
        };

        drop(sink);
        self.state = SessionState::Closed;

        let report = SessionReport {
            id: self.id,
            outcome,
            state: self.state,
            fragments_delivered: self.fragments_delivered,
            delivered_text: self.delivered_text,
            started_at: self.started_at,
            elapsed: self.started.elapsed(),
        };

        match &report.outcome {
            SessionOutcome::Completed => info!(
                session = %report.id,
                fragments = report.fragments_delivered,
                chars = report.delivered_text.len(),
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Stream session completed"
            ),
            SessionOutcome::Failed(e) => info!(
                session = %report.id,
                error_type = e.kind(),
                fragments = report.fragments_delivered,
                "Stream session ended with error frame"
            ),
            SessionOutcome::ClientGone => info!(
                session = %report.id,
                fragments = report.fragments_delivered,
                "Client disconnected, stream session abandoned"
            ),
        }

        report
    }

    async fn pump<S: FrameSink>(&mut self, sink: &mut S) -> PumpEnd {
        if let Some(fragment) = self.pending.take() {
            if let Err(end) = self.deliver(sink, fragment).await {
                return end;
            }
        }
        if self.exhausted {
            return PumpEnd::UpstreamDone;
        }

        let deadline = self.deadline;
        let request_timeout = self.timeout;
        loop {
            let next = tokio::select! {
                biased;
                _ = sink.closed() => return PumpEnd::ClientGone,
                _ = sleep_until(deadline) => {
                    return PumpEnd::Failed(RelayError::DeadlineExceeded(request_timeout));
                }
                next = self.fragments.next() => next,
            };

            match next {
                None => return PumpEnd::UpstreamDone,
                Some(Err(e)) => return PumpEnd::Failed(e),
                Some(Ok(fragment)) => {
                    let fragment = match self.accept(fragment) {
                        Ok(fragment) => fragment,
                        Err(e) => return PumpEnd::Failed(e),
                    };
                    if let Err(end) = self.deliver(sink, fragment).await {
                        return end;
                    }
                }
            }
        }
    }

    /// Enforce strictly consecutive sequence numbers from the upstream
    fn accept(&mut self, fragment: Fragment) -> Result<Fragment> {
        let expected = self.last_seq + 1;
        if fragment.seq != expected {
            return Err(RelayError::UpstreamProtocol(format!(
                "Fragment out of order: expected {expected}, got {}",
                fragment.seq
            )));
        }
        self.last_seq = fragment.seq;
        Ok(fragment)
    }

    async fn deliver<S: FrameSink>(
        &mut self,
        sink: &mut S,
        fragment: Fragment,
    ) -> std::result::Result<(), PumpEnd> {
        let frame = encode_fragment(&fragment);
        match timeout_at(self.deadline, sink.send(frame)).await {
            Err(_) => Err(PumpEnd::Failed(RelayError::DeadlineExceeded(self.timeout))),
            Ok(Err(_)) => Err(PumpEnd::ClientGone),
            Ok(Ok(())) => {
                self.fragments_delivered += 1;
                self.delivered_text.push_str(&fragment.text);
                Ok(())
            }
        }
    }
}

/// Write the final frame; false if the client could not take it
async fn write_termination<S: FrameSink>(sink: &mut S, termination: &Termination) -> bool {
    let frame = encode_termination(termination);
    matches!(timeout(TERMINATION_GRACE, sink.send(frame)).await, Ok(Ok(())))
}
