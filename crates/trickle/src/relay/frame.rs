//! SSE frame parsing
//!
//! Turns upstream byte chunks into lines and each `data:` line into an
//! [`UpstreamEnvelope`]. Chunk boundaries are arbitrary, so a line (or a
//! multi-byte character) may arrive split across several chunks.
//!
//! Upstream events look like:
//! ```text
//! id:1
//! event:result
//! :HTTP_STATUS/200
//! data:{"output":{"session_id":"4f2a..","text":"Hello","finish_reason":"null"},"request_id":"..."}
//! ```
//!
//! Only `data:` lines carry events; everything else is ignored. A line that
//! fails to decode is discarded and never aborts the relay.

use bytes::{Bytes, BytesMut};
use serde::Deserialize;

/// SSE field prefix for event payloads
const DATA_PREFIX: &str = "data:";

/// Finish reason that ends the relay
pub const FINISH_STOP: &str = "stop";

/// One decoded upstream event
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UpstreamEnvelope {
    /// Upstream request identifier, used for log correlation
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub output: Option<EnvelopeOutput>,
}

/// The `output` object of an upstream event
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EnvelopeOutput {
    #[serde(default)]
    pub session_id: Option<String>,
    /// Cumulative answer text so far
    #[serde(default)]
    pub text: Option<String>,
    /// Reasoning traces; the first entry holds the cumulative trace so far
    #[serde(default)]
    pub thoughts: Option<Vec<ThoughtEntry>>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ThoughtEntry {
    #[serde(default)]
    pub thought: Option<String>,
}

impl UpstreamEnvelope {
    /// Session identifier, if present and non-empty
    pub fn session_id(&self) -> Option<&str> {
        self.output
            .as_ref()?
            .session_id
            .as_deref()
            .filter(|s| !s.is_empty())
    }

    /// Cumulative answer text, if the event carries one
    pub fn text(&self) -> Option<&str> {
        self.output.as_ref()?.text.as_deref()
    }

    /// Cumulative reasoning trace from `thoughts[0].thought`
    pub fn thought(&self) -> Option<&str> {
        self.output
            .as_ref()?
            .thoughts
            .as_ref()?
            .first()?
            .thought
            .as_deref()
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.output.as_ref()?.finish_reason.as_deref()
    }

    /// Whether this event ends the stream
    pub fn is_stop(&self) -> bool {
        self.finish_reason() == Some(FINISH_STOP)
    }
}

/// Why a line produced no event
#[derive(Debug, Clone, PartialEq)]
pub enum DiscardReason {
    /// Comment, `event:`, `id:` or keep-alive line
    NotData,
    /// `data:` with nothing after it
    EmptyPayload,
    InvalidUtf8,
    /// Payload is not a JSON event; carries the parser's message
    MalformedJson(String),
}

/// Result of parsing a single line
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Event(UpstreamEnvelope),
    Discard(DiscardReason),
}

/// Parse one line (without its terminator) into an event or a discard reason
pub fn parse_line(line: &[u8]) -> ParseOutcome {
    let Ok(text) = std::str::from_utf8(line) else {
        return ParseOutcome::Discard(DiscardReason::InvalidUtf8);
    };

    let Some(payload) = text.strip_prefix(DATA_PREFIX) else {
        return ParseOutcome::Discard(DiscardReason::NotData);
    };

    let payload = payload.trim();
    if payload.is_empty() {
        return ParseOutcome::Discard(DiscardReason::EmptyPayload);
    }

    match serde_json::from_str::<UpstreamEnvelope>(payload) {
        Ok(envelope) => ParseOutcome::Event(envelope),
        Err(e) => ParseOutcome::Discard(DiscardReason::MalformedJson(e.to_string())),
    }
}

/// Incremental splitter from byte chunks to lines
///
/// Lines end at `\n`; a preceding `\r` is dropped. Bytes after the last
/// newline are held until more input arrives or [`LineDecoder::finish`] is called.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: BytesMut,
    // Bytes of `buf` already known to contain no newline
    scanned: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of upstream bytes
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete line, if one is buffered
    pub fn next_line(&mut self) -> Option<Bytes> {
        match self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
            Some(offset) => {
                let end = self.scanned + offset;
                let mut line = self.buf.split_to(end + 1);
                line.truncate(end);
                strip_cr(&mut line);
                self.scanned = 0;
                Some(line.freeze())
            }
            None => {
                self.scanned = self.buf.len();
                None
            }
        }
    }

    /// Take the unterminated trailing line at end of input
    pub fn finish(&mut self) -> Option<Bytes> {
        self.scanned = 0;
        if self.buf.is_empty() {
            return None;
        }
        let mut line = self.buf.split();
        strip_cr(&mut line);
        Some(line.freeze())
    }
}

fn strip_cr(line: &mut BytesMut) {
    if line.last() == Some(&b'\r') {
        let len = line.len();
        line.truncate(len - 1);
    }
}
