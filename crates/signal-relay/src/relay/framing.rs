//! SSE framing for relayed fragments
//!
//! Wire format, one event per frame:
//!
//! ```text
//! id: 1
//! data: Hi there! For
//!
//! event: done
//! data: [DONE]
//!
//! event: error
//! data: [ERROR] upstream timed out
//! ```
//!
//! Fragment frames never carry an `event:` field, so `done` and `error`
//! event names cannot collide with generated text. Clients that only look at
//! `data:` still see the `[DONE]` / `[ERROR]` markers.

use bytes::Bytes;

use crate::types::{Fragment, Termination};

/// Data marker of the success frame
pub const DONE_MARKER: &str = "[DONE]";
/// Data prefix of the error frame
pub const ERROR_MARKER: &str = "[ERROR]";

const DONE_EVENT: &str = "done";
const ERROR_EVENT: &str = "error";

/// Encode one fragment as a self-contained SSE event
pub fn encode_fragment(fragment: &Fragment) -> Bytes {
    let mut frame = String::with_capacity(fragment.text.len() + 24);
    frame.push_str("id: ");
    frame.push_str(&fragment.seq.to_string());
    frame.push('\n');

    let normalized = fragment.text.replace("\r\n", "\n").replace('\r', "\n");
    for line in normalized.split('\n') {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');

    Bytes::from(frame)
}

/// Encode the final frame of a stream
pub fn encode_termination(termination: &Termination) -> Bytes {
    let frame = match termination {
        Termination::Done => format!("event: {DONE_EVENT}\ndata: {DONE_MARKER}\n\n"),
        Termination::Error(message) => {
            let message: String = message
                .chars()
                .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
                .collect();
            format!("event: {ERROR_EVENT}\ndata: {ERROR_MARKER} {message}\n\n")
        }
    };
    Bytes::from(frame)
}

/// A decoded frame as seen by a client
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Fragment(Fragment),
    Done,
    Error(String),
}

impl Frame {
    pub fn is_termination(&self) -> bool {
        matches!(self, Frame::Done | Frame::Error(_))
    }
}

/// Incremental client-side frame decoder, fed one line at a time
#[derive(Debug, Default)]
pub struct FrameDecoder {
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its terminator); returns a frame when the line
    /// completes an event
    pub fn push_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "id" => self.id = Some(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<Frame> {
        let id = self.id.take();
        let event = self.event.take();
        let data = std::mem::take(&mut self.data);

        match event.as_deref() {
            Some(DONE_EVENT) => Some(Frame::Done),
            Some(ERROR_EVENT) => {
                let joined = data.join("\n");
                let message = joined
                    .strip_prefix(ERROR_MARKER)
                    .map(|m| m.trim_start().to_string())
                    .unwrap_or(joined);
                Some(Frame::Error(message))
            }
            None | Some("message") if !data.is_empty() => {
                let seq = id.and_then(|id| id.parse().ok()).unwrap_or(0);
                Some(Frame::Fragment(Fragment::new(seq, data.join("\n"))))
            }
            _ => None,
        }
    }
}

/// Decode a complete SSE body into frames
///
/// A trailing event without its terminating blank line is incomplete and
/// is dropped.
pub fn parse_frames(raw: &str) -> Vec<Frame> {
    let mut decoder = FrameDecoder::new();
    raw.lines()
        .filter_map(|line| decoder.push_line(line))
        .collect()
}
