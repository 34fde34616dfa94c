//! Downstream byte sink
//!
//! [`DownstreamSink`] is what the relay writes to. [`ChannelSink`] backs an
//! axum streaming response: each `send` becomes one body frame, and the
//! response head (status and headers) is committed lazily on the first write
//! so headers discovered before any output can still be attached.
//!
//! When the client disconnects, hyper drops the response body, which drops
//! the channel receiver. From then on `send` fails and `closed` resolves.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use super::error::RelayError;

type BodyChunk = std::result::Result<Bytes, std::io::Error>;

/// Incremental write-and-flush target for one relay operation
#[async_trait]
pub trait DownstreamSink: Send + Sync {
    /// Whether the response head has been committed
    fn has_started(&self) -> bool;

    /// Attach a header; returns false (and does nothing) once started
    fn set_header(&mut self, name: HeaderName, value: HeaderValue) -> bool;

    /// Write one encoded message and hand it to the transport immediately
    async fn send(&mut self, chunk: Bytes) -> std::result::Result<(), RelayError>;

    /// Resolves once the consumer is gone; never resolves while it is connected
    async fn closed(&self);
}

/// Sink feeding an axum response body through a bounded channel
pub struct ChannelSink {
    headers: HeaderMap,
    head_tx: Option<oneshot::Sender<HeaderMap>>,
    body_tx: mpsc::Sender<BodyChunk>,
}

/// The response side of a [`ChannelSink`]
pub struct PendingResponse {
    head_rx: oneshot::Receiver<HeaderMap>,
    body_rx: mpsc::Receiver<BodyChunk>,
}

/// Create a connected sink and pending response
///
/// `headers` are the initial response headers; more may be added through
/// [`DownstreamSink::set_header`] until the first write.
pub fn channel(capacity: usize, headers: HeaderMap) -> (ChannelSink, PendingResponse) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(capacity.max(1));

    (
        ChannelSink {
            headers,
            head_tx: Some(head_tx),
            body_tx,
        },
        PendingResponse { head_rx, body_rx },
    )
}

impl ChannelSink {
    fn commit(&mut self) {
        if let Some(head_tx) = self.head_tx.take() {
            // Receiver gone means the handler was dropped; the next send reports it
            let _ = head_tx.send(std::mem::take(&mut self.headers));
        }
    }
}

#[async_trait]
impl DownstreamSink for ChannelSink {
    fn has_started(&self) -> bool {
        self.head_tx.is_none()
    }

    fn set_header(&mut self, name: HeaderName, value: HeaderValue) -> bool {
        if self.has_started() {
            return false;
        }
        self.headers.insert(name, value);
        true
    }

    async fn send(&mut self, chunk: Bytes) -> std::result::Result<(), RelayError> {
        self.commit();
        self.body_tx
            .send(Ok(chunk))
            .await
            .map_err(|_| RelayError::DownstreamClosed)
    }

    async fn closed(&self) {
        self.body_tx.closed().await;
    }
}

impl Drop for ChannelSink {
    fn drop(&mut self) {
        // A relay that wrote nothing still owes the handler a response head
        self.commit();
    }
}

impl PendingResponse {
    /// Wait for the head, then return a response streaming the body
    pub async fn into_response(self) -> Response<Body> {
        let body = Body::from_stream(ReceiverStream::new(self.body_rx));

        match self.head_rx.await {
            Ok(headers) => {
                let mut response = Response::new(body);
                *response.headers_mut() = headers;
                response
            }
            Err(_) => {
                tracing::error!("Relay ended without committing a response head");
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }
}
