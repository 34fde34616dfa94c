//! Test utilities for trickle - scripted upstreams and recording sinks
//!
//! These stand in for the network on either side of a relay so the pump can
//! be driven deterministically:
//! - [`ScriptedUpstream`] replays a fixed body, optionally failing or hanging
//! - [`RecordingSink`] captures writes and headers, optionally disconnecting

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};

use crate::relay::{
    DownstreamSink, OutputMessage, RelayError, UpstreamClient, UpstreamRequest, UpstreamStream,
};

/// Build one upstream `data:` line (with terminator) in the upstream's shape
pub fn sse_event(
    session_id: Option<&str>,
    text: Option<&str>,
    thought: Option<&str>,
    finish_reason: Option<&str>,
) -> String {
    let mut output = serde_json::Map::new();
    if let Some(session_id) = session_id {
        output.insert("session_id".into(), session_id.into());
    }
    if let Some(text) = text {
        output.insert("text".into(), text.into());
    }
    if let Some(thought) = thought {
        output.insert(
            "thoughts".into(),
            serde_json::json!([{ "thought": thought }]),
        );
    }
    // The upstream sends the string "null" while a stream is in progress
    output.insert(
        "finish_reason".into(),
        finish_reason.unwrap_or("null").into(),
    );

    let event = serde_json::json!({
        "output": output,
        "request_id": "req-test",
    });
    format!("data:{event}\n")
}

/// Build a text-only `data:` line
pub fn text_event(text: &str) -> String {
    sse_event(None, Some(text), None, None)
}

/// Upstream that replays a fixed response body
pub struct ScriptedUpstream {
    open_error: Option<RelayError>,
    chunks: Vec<Bytes>,
    trailing_error: Option<RelayError>,
    hang: bool,
    calls: Arc<Mutex<Vec<serde_json::Value>>>,
    pulled: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
}

impl ScriptedUpstream {
    /// Body delivered as the given chunks, in order
    pub fn chunks(chunks: Vec<Bytes>) -> Self {
        Self {
            open_error: None,
            chunks,
            trailing_error: None,
            hang: false,
            calls: Arc::new(Mutex::new(Vec::new())),
            pulled: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Body delivered one line per chunk
    pub fn lines(lines: Vec<String>) -> Self {
        Self::chunks(lines.into_iter().map(Bytes::from).collect())
    }

    /// Upstream that fails before any body arrives
    pub fn failing(error: RelayError) -> Self {
        let mut upstream = Self::chunks(Vec::new());
        upstream.open_error = Some(error);
        upstream
    }

    /// Fail the body read after the scripted chunks
    pub fn then_error(mut self, error: RelayError) -> Self {
        self.trailing_error = Some(error);
        self
    }

    /// Never end the body after the scripted chunks
    pub fn then_hang(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Upstream request bodies received so far
    pub fn calls(&self) -> Arc<Mutex<Vec<serde_json::Value>>> {
        Arc::clone(&self.calls)
    }

    /// Number of chunks the relay has read
    pub fn pulled(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.pulled)
    }

    /// Set once the relay has dropped the body stream
    pub fn released(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.released)
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    async fn open(&self, body: &UpstreamRequest) -> Result<UpstreamStream, RelayError> {
        let recorded = serde_json::to_value(body).unwrap_or(serde_json::Value::Null);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(recorded);
        }

        if let Some(error) = &self.open_error {
            return Err(error.clone());
        }

        let mut body: UpstreamStream =
            stream::iter(self.chunks.clone().into_iter().map(Ok)).boxed();
        if let Some(error) = &self.trailing_error {
            let failure = futures::future::ready(Err(error.clone()));
            body = body.chain(stream::once(failure)).boxed();
        }
        if self.hang {
            body = body.chain(stream::pending()).boxed();
        }

        Ok(TrackedStream {
            inner: body,
            pulled: Arc::clone(&self.pulled),
            released: Arc::clone(&self.released),
        }
        .boxed())
    }
}

struct TrackedStream {
    inner: UpstreamStream,
    pulled: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
}

impl Stream for TrackedStream {
    type Item = Result<Bytes, RelayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.inner.poll_next_unpin(cx);
        if let Poll::Ready(Some(_)) = &polled {
            self.pulled.fetch_add(1, Ordering::SeqCst);
        }
        polled
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Sink that keeps everything written to it
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub writes: Vec<Bytes>,
    pub headers: HeaderMap,
    started: bool,
    fail_after: Option<usize>,
    disconnected: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `writes` messages, then behave as a disconnected client
    pub fn failing_after(writes: usize) -> Self {
        Self {
            fail_after: Some(writes),
            ..Self::default()
        }
    }

    /// A client that is already gone
    pub fn disconnected() -> Self {
        Self {
            disconnected: true,
            ..Self::default()
        }
    }

    /// All writes concatenated
    pub fn body(&self) -> String {
        self.writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    /// Writes decoded as line-delimited messages
    pub fn messages(&self) -> Vec<OutputMessage> {
        self.body()
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

#[async_trait]
impl DownstreamSink for RecordingSink {
    fn has_started(&self) -> bool {
        self.started
    }

    fn set_header(&mut self, name: HeaderName, value: HeaderValue) -> bool {
        if self.started {
            return false;
        }
        self.headers.insert(name, value);
        true
    }

    async fn send(&mut self, chunk: Bytes) -> Result<(), RelayError> {
        if self.disconnected || self.fail_after.is_some_and(|n| self.writes.len() >= n) {
            self.disconnected = true;
            return Err(RelayError::DownstreamClosed);
        }
        self.started = true;
        self.writes.push(chunk);
        Ok(())
    }

    async fn closed(&self) {
        if self.disconnected {
            return;
        }
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{ParseOutcome, parse_line};

    #[test]
    fn sse_event_parses_back() {
        let line = sse_event(Some("s1"), Some("Hi"), Some("hmm"), Some("stop"));
        assert!(line.starts_with("data:"));
        assert!(line.ends_with('\n'));

        let ParseOutcome::Event(envelope) = parse_line(line.trim_end().as_bytes()) else {
            panic!("expected an event");
        };
        assert_eq!(envelope.session_id(), Some("s1"));
        assert_eq!(envelope.text(), Some("Hi"));
        assert_eq!(envelope.thought(), Some("hmm"));
        assert!(envelope.is_stop());
        assert_eq!(envelope.request_id.as_deref(), Some("req-test"));
    }

    #[tokio::test]
    async fn recording_sink_fails_after_limit() {
        let mut sink = RecordingSink::failing_after(1);
        assert!(sink.send(Bytes::from_static(b"a")).await.is_ok());
        assert_eq!(
            sink.send(Bytes::from_static(b"b")).await,
            Err(RelayError::DownstreamClosed)
        );
        assert_eq!(sink.body(), "a");
    }

    #[tokio::test]
    async fn scripted_upstream_tracks_reads_and_release() {
        let upstream = ScriptedUpstream::lines(vec![text_event("a"), text_event("ab")]);
        let pulled = upstream.pulled();
        let released = upstream.released();

        let body = crate::relay::UpstreamRequest::new(
            &crate::relay::StreamRequest::new("hi"),
            crate::relay::DecodingParameters::default(),
        );
        let mut stream = upstream.open(&body).await.unwrap();
        assert!(stream.next().await.is_some());
        assert_eq!(pulled.load(Ordering::SeqCst), 1);
        assert!(!released.load(Ordering::SeqCst));

        drop(stream);
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(upstream.calls().lock().unwrap().len(), 1);
    }
}
