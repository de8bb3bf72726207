//! Incremental decoding of an OpenAI-style SSE response body
//!
//! Upstream chunks arrive at arbitrary byte boundaries. `LineDecoder` turns
//! them into complete lines and `parse_line` classifies each line:
//!
//! ```text
//! data: {"choices":[{"index":0,"delta":{"content":"Hello"}}]}
//!
//! data: [DONE]
//! ```

use crate::error::{RelayError, Result};

/// Longest line accepted before the stream is treated as broken
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Lines completed by one chunk
///
/// `error` is set when decoding stopped part way through the chunk; `lines`
/// still holds everything decoded before that point.
#[derive(Debug, Default)]
pub struct DecodedLines {
    pub lines: Vec<String>,
    pub error: Option<RelayError>,
}

/// Splits a byte stream into lines, keeping a partial trailing line buffered
#[derive(Debug)]
pub struct LineDecoder {
    pending: Vec<u8>,
    /// Bytes of `pending` already known to hold no newline
    scanned: usize,
    max_line_len: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::with_max_line_len(MAX_LINE_LEN)
    }
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            pending: Vec::new(),
            scanned: 0,
            max_line_len,
        }
    }

    /// Feed a chunk and return every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> DecodedLines {
        self.pending.extend_from_slice(chunk);

        let mut decoded = DecodedLines::default();
        let mut start = 0;
        let mut search_from = self.scanned;

        while let Some(offset) = self.pending[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + offset;
            match decode_utf8(trim_cr(&self.pending[start..end])) {
                Ok(line) => decoded.lines.push(line),
                Err(e) => {
                    self.reset();
                    decoded.error = Some(e);
                    return decoded;
                }
            }
            start = end + 1;
            search_from = start;
        }

        self.pending.drain(..start);
        self.scanned = self.pending.len();

        if self.pending.len() > self.max_line_len {
            self.reset();
            decoded.error = Some(RelayError::UpstreamProtocol(format!(
                "Stream line exceeds {} bytes",
                self.max_line_len
            )));
        }

        decoded
    }

    /// Flush whatever is left once the body has ended
    pub fn finish(&mut self) -> Result<Option<String>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let line = decode_utf8(trim_cr(&self.pending));
        self.reset();
        line.map(Some)
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.scanned = 0;
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn decode_utf8(bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| RelayError::UpstreamProtocol(format!("Stream is not valid UTF-8: {e}")))
}

/// Classification of one upstream SSE line
#[derive(Debug, Clone, PartialEq)]
pub enum StreamLine {
    /// A non-empty content delta
    Delta(String),
    /// Terminal `[DONE]` marker
    Done,
    /// Anything carrying no text: blank lines, comments, role-only deltas,
    /// unparsable payloads
    Skip,
}

/// Classify a single SSE line from the upstream
pub fn parse_line(line: &str) -> Result<StreamLine> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(StreamLine::Skip);
    };
    let data = data.strip_prefix(' ').unwrap_or(data);

    if data == "[DONE]" {
        return Ok(StreamLine::Done);
    }

    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("Skipping unparsable stream payload: {e}");
            return Ok(StreamLine::Skip);
        }
    };

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(RelayError::UpstreamProtocol(format!(
            "Upstream reported an error mid-stream: {message}"
        )));
    }

    match delta_content(&value) {
        Some(text) if !text.is_empty() => Ok(StreamLine::Delta(text.to_string())),
        _ => Ok(StreamLine::Skip),
    }
}

fn delta_content(value: &serde_json::Value) -> Option<&str> {
    value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
}
