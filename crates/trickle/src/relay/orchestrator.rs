//! Relay orchestration
//!
//! One relay operation: build the upstream body, open the upstream stream,
//! then pump lines through frame parsing, delta tracking and encoding into
//! the downstream sink, one flushed write per message.
//!
//! Termination:
//! - `finish_reason == "stop"` ends the relay after that event's emissions,
//!   before any further upstream line is read.
//! - End of upstream input without a finish reason is a clean end.
//! - Upstream failures produce exactly one error message.
//! - A closed sink (failed write, or the `closed` signal raced against the
//!   upstream read) aborts immediately; the upstream stream is dropped on
//!   every exit path.

use futures::StreamExt;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::Config;

use super::encoder::{Encoder, OutputMessage, OutputMode};
use super::error::RelayError;
use super::frame::{
    DiscardReason, FINISH_STOP, LineDecoder, ParseOutcome, UpstreamEnvelope, parse_line,
};
use super::request::{DecodingParameters, StreamRequest, UpstreamRequest};
use super::session::SessionId;
use super::sink::DownstreamSink;
use super::tracker::{AnomalyPolicy, DeltaTracker, Emission};
use super::upstream::{UpstreamClient, UpstreamStream};

/// Done-message content when the upstream ends without a finish reason
const END_OF_INPUT: &str = "end_of_input";

/// Per-deployment relay behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayOptions {
    pub output_mode: OutputMode,
    pub emission: Emission,
    pub anomaly_policy: AnomalyPolicy,
    pub parameters: DecodingParameters,
}

impl RelayOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            output_mode: config.relay.output_mode,
            emission: config.relay.emission,
            anomaly_policy: config.relay.anomaly_policy,
            parameters: DecodingParameters {
                incremental_output: config.upstream.incremental_output,
                has_thoughts: config.upstream.has_thoughts,
            },
        }
    }
}

/// How a relay operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Upstream sent `finish_reason: "stop"`
    Stop,
    /// Upstream body ended without a finish reason
    EndOfInput,
    /// Upstream unreachable, error status, or body failure; one error was written
    UpstreamFailed,
    /// The downstream client went away
    DownstreamClosed,
}

/// Summary of a finished relay operation
#[derive(Debug, Clone, PartialEq)]
pub struct RelayOutcome {
    pub termination: Termination,
    /// Messages written downstream
    pub messages: usize,
    /// Data lines dropped as malformed
    pub discarded: usize,
    /// Session id discovered from the upstream, if any
    pub session_id: Option<SessionId>,
    pub upstream_request_id: Option<String>,
}

/// Run one relay operation to completion
pub async fn relay<U, S>(
    upstream: &U,
    request: &StreamRequest,
    options: &RelayOptions,
    sink: &mut S,
) -> RelayOutcome
where
    U: UpstreamClient + ?Sized,
    S: DownstreamSink + ?Sized,
{
    let span = tracing::info_span!(
        "relay",
        relay_id = %Uuid::new_v4(),
        mode = ?options.output_mode,
    );

    run(upstream, request, options, sink).instrument(span).await
}

async fn run<U, S>(
    upstream: &U,
    request: &StreamRequest,
    options: &RelayOptions,
    sink: &mut S,
) -> RelayOutcome
where
    U: UpstreamClient + ?Sized,
    S: DownstreamSink + ?Sized,
{
    tracing::info!(
        prompt_chars = request.message.chars().count(),
        has_session = request.session_id.is_some(),
        level = request.level(),
        "Relay started"
    );

    let body = UpstreamRequest::new(request, options.parameters);

    let opened = tokio::select! {
        biased;
        _ = sink.closed() => None,
        opened = upstream.open(&body) => Some(opened),
    };

    let mut pump = Pump::new(options, sink);

    let termination = match opened {
        None => {
            tracing::info!("Downstream disconnected before upstream responded");
            Termination::DownstreamClosed
        }
        Some(Err(e)) => pump.fail(e).await,
        Some(Ok(stream)) => pump.run(stream).await,
    };

    let termination = match termination {
        Termination::Stop => pump.done(FINISH_STOP, termination).await,
        Termination::EndOfInput => pump.done(END_OF_INPUT, termination).await,
        other => other,
    };

    let outcome = pump.into_outcome(termination);
    tracing::info!(
        termination = ?outcome.termination,
        messages = outcome.messages,
        discarded = outcome.discarded,
        session = outcome.session_id.as_ref().map(SessionId::as_str),
        "Relay finished"
    );
    outcome
}

struct Pump<'a, S: DownstreamSink + ?Sized> {
    encoder: Encoder,
    tracker: DeltaTracker,
    sink: &'a mut S,
    messages: usize,
    discarded: usize,
    session_id: Option<SessionId>,
    upstream_request_id: Option<String>,
}

impl<'a, S: DownstreamSink + ?Sized> Pump<'a, S> {
    fn new(options: &RelayOptions, sink: &'a mut S) -> Self {
        Self {
            encoder: Encoder::new(options.output_mode),
            tracker: DeltaTracker::new(options.emission, options.anomaly_policy),
            sink,
            messages: 0,
            discarded: 0,
            session_id: None,
            upstream_request_id: None,
        }
    }

    async fn run(&mut self, mut stream: UpstreamStream) -> Termination {
        let mut decoder = LineDecoder::new();

        loop {
            while let Some(line) = decoder.next_line() {
                match self.handle_line(&line).await {
                    Ok(false) => {}
                    Ok(true) => return Termination::Stop,
                    Err(e) => return self.aborted(e),
                }
            }

            let next = tokio::select! {
                biased;
                _ = self.sink.closed() => return self.aborted(RelayError::DownstreamClosed),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => decoder.push(&chunk),
                Some(Err(e)) => return self.fail(e).await,
                None => {
                    if let Some(line) = decoder.finish() {
                        match self.handle_line(&line).await {
                            Ok(true) => return Termination::Stop,
                            Ok(false) => {}
                            Err(e) => return self.aborted(e),
                        }
                    }
                    tracing::debug!("Upstream ended without finish reason");
                    return Termination::EndOfInput;
                }
            }
        }
    }

    /// Returns true when the line ends the relay
    async fn handle_line(&mut self, line: &[u8]) -> Result<bool, RelayError> {
        match parse_line(line) {
            ParseOutcome::Event(envelope) => self.handle_event(envelope).await,
            ParseOutcome::Discard(
                reason @ (DiscardReason::MalformedJson(_) | DiscardReason::InvalidUtf8),
            ) => {
                self.discarded += 1;
                tracing::debug!(?reason, "Dropped malformed upstream frame");
                Ok(false)
            }
            ParseOutcome::Discard(_) => Ok(false),
        }
    }

    async fn handle_event(&mut self, envelope: UpstreamEnvelope) -> Result<bool, RelayError> {
        if self.upstream_request_id.is_none() {
            if let Some(request_id) = envelope.request_id.as_deref() {
                tracing::debug!(request_id, "Upstream request id");
                self.upstream_request_id = Some(request_id.to_string());
            }
        }

        if let Some(session_id) = envelope.session_id() {
            self.propagate_session(session_id).await?;
        }

        let update = self.tracker.observe(&envelope);
        if let Some(thought) = update.thought {
            self.emit(OutputMessage::thought(thought)).await?;
        }
        if let Some(text) = update.text {
            self.emit(OutputMessage::text(text)).await?;
        }

        Ok(envelope.is_stop())
    }

    /// Surface the session id once: as a header while the response has not
    /// started, or as a session message in the tagged protocol
    async fn propagate_session(&mut self, raw: &str) -> Result<(), RelayError> {
        if self.tracker.state().session_sent {
            return Ok(());
        }

        let session_id = match SessionId::try_from(raw) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unusable upstream session id");
                return Ok(());
            }
        };

        self.tracker.claim_session();

        if self.encoder.session_in_header() {
            if self.sink.has_started() {
                tracing::warn!(
                    session = %session_id,
                    "Response already started, session header not sent"
                );
            } else {
                match axum::http::HeaderValue::from_str(session_id.as_str()) {
                    Ok(value) => {
                        self.sink.set_header(Encoder::session_header_name(), value);
                    }
                    Err(e) => tracing::warn!(error = %e, "Session id is not a valid header value"),
                }
            }
        } else {
            self.emit(OutputMessage::session(session_id.as_str())).await?;
        }

        tracing::debug!(session = %session_id, "Session id propagated");
        self.session_id = Some(session_id);
        Ok(())
    }

    async fn emit(&mut self, message: OutputMessage) -> Result<(), RelayError> {
        let Some(bytes) = self.encoder.encode(&message) else {
            return Ok(());
        };
        self.sink.send(bytes).await?;
        self.messages += 1;
        Ok(())
    }

    /// Report an upstream failure with a single error message
    async fn fail(&mut self, error: RelayError) -> Termination {
        tracing::error!(
            error_type = error.category(),
            error_message = %error,
            "Upstream failed"
        );

        match self.emit(OutputMessage::error(error.to_string())).await {
            Ok(()) => Termination::UpstreamFailed,
            Err(e) => self.aborted(e),
        }
    }

    fn aborted(&self, error: RelayError) -> Termination {
        tracing::info!(
            error_type = error.category(),
            "Downstream gone, abandoning upstream"
        );
        Termination::DownstreamClosed
    }

    async fn done(&mut self, reason: &str, termination: Termination) -> Termination {
        match self.emit(OutputMessage::done(reason)).await {
            Ok(()) => termination,
            Err(e) => self.aborted(e),
        }
    }

    fn into_outcome(self, termination: Termination) -> RelayOutcome {
        RelayOutcome {
            termination,
            messages: self.messages,
            discarded: self.discarded,
            session_id: self.session_id,
            upstream_request_id: self.upstream_request_id,
        }
    }
}
