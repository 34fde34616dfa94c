//! Trickle - streaming relay for conversational AI backends
//!
//! The upstream re-sends the whole answer so far on every event; trickle
//! forwards only what is new, as soon as it arrives, in the shape the
//! downstream client asked for.

pub mod config;
pub mod error;
pub mod relay;
pub mod testing;

pub use error::TrickleError;
