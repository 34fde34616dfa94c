mod encoder;
mod error;
mod frame;
mod orchestrator;
mod request;
mod server;
mod session;
mod sink;
mod tracker;
mod upstream;

pub use encoder::{Encoder, MessageKind, OutputMessage, OutputMode, SESSION_HEADER};
pub use error::RelayError;
pub use frame::{
    DiscardReason, EnvelopeOutput, FINISH_STOP, LineDecoder, ParseOutcome, ThoughtEntry,
    UpstreamEnvelope, parse_line,
};
pub use orchestrator::{RelayOptions, RelayOutcome, Termination, relay};
pub use request::{DecodingParameters, RequestError, StreamRequest, UpstreamRequest};
pub use server::{AppState, RelayServer, create_router};
pub use session::{SessionId, SessionIdError};
pub use sink::{ChannelSink, DownstreamSink, PendingResponse, channel};
pub use tracker::{AnomalyPolicy, DeltaTracker, Emission, TrackedUpdate, TrackerState};
pub use upstream::{HttpUpstream, UpstreamClient, UpstreamStream};
