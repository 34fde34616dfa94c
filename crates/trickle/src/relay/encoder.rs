//! Downstream wire encoding
//!
//! One encoder serves all three downstream protocols:
//!
//! - `plain`: raw UTF-8 answer text, byte-concatenation semantics. The session
//!   id travels in the `X-Session-Id` response header; errors are written as
//!   `[Error] <status>: <body>`.
//! - `json`: one `{"type":"text","content":...}` object per line, answer text
//!   and errors only. Session id in the response header.
//! - `tagged`: one `{"type":<kind>,"content":...}` object per line carrying
//!   text, thought, session, error and done messages.
//!
//! serde_json escapes control characters inside strings, so a line-delimited
//! message never contains a raw newline.

use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Response header carrying the discovered session id
pub const SESSION_HEADER: &str = "x-session-id";

/// Downstream wire shape
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    Plain,
    Json,
    #[default]
    Tagged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Thought,
    Session,
    Error,
    Done,
}

/// A single downstream emission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
}

impl OutputMessage {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Text, content)
    }

    pub fn thought(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Thought, content)
    }

    pub fn session(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Session, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, content)
    }

    pub fn done(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Done, content)
    }
}

/// Serializes [`OutputMessage`]s for the configured [`OutputMode`]
#[derive(Debug, Clone, Copy)]
pub struct Encoder {
    mode: OutputMode,
}

impl Encoder {
    pub fn new(mode: OutputMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    pub fn content_type(&self) -> &'static str {
        match self.mode {
            OutputMode::Plain => "text/plain; charset=utf-8",
            OutputMode::Json | OutputMode::Tagged => "application/x-ndjson",
        }
    }

    /// Whether the session id goes in a response header rather than the body
    pub fn session_in_header(&self) -> bool {
        !matches!(self.mode, OutputMode::Tagged)
    }

    /// Whether messages of `kind` are written to the body in this mode
    pub fn carries(&self, kind: MessageKind) -> bool {
        match self.mode {
            OutputMode::Plain | OutputMode::Json => {
                matches!(kind, MessageKind::Text | MessageKind::Error)
            }
            OutputMode::Tagged => true,
        }
    }

    /// Headers set once before the first body byte
    pub fn response_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(self.content_type()),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        if self.session_in_header() {
            headers.insert(
                header::ACCESS_CONTROL_EXPOSE_HEADERS,
                HeaderValue::from_static("X-Session-Id"),
            );
        }
        headers
    }

    pub fn session_header_name() -> HeaderName {
        HeaderName::from_static(SESSION_HEADER)
    }

    /// Encode one message, or `None` if this mode does not carry it
    pub fn encode(&self, message: &OutputMessage) -> Option<Bytes> {
        if !self.carries(message.kind) {
            return None;
        }

        match self.mode {
            OutputMode::Plain => match message.kind {
                MessageKind::Error => Some(Bytes::from(format!("[Error] {}", message.content))),
                _ => Some(Bytes::from(message.content.clone())),
            },
            OutputMode::Json | OutputMode::Tagged => match serde_json::to_vec(message) {
                Ok(mut line) => {
                    line.push(b'\n');
                    Some(Bytes::from(line))
                }
                Err(e) => {
                    tracing::error!(error = %e, kind = ?message.kind, "Failed to encode message");
                    None
                }
            },
        }
    }
}
