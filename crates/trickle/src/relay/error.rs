//! Relay failure taxonomy
//!
//! Malformed frames and snapshot anomalies are not errors: the frame parser
//! discards the line and the tracker applies its policy. What remains here
//! ends a relay operation.

use axum::http::StatusCode;
use thiserror::Error;

/// Errors that end a relay operation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    /// Transport failure before any upstream bytes arrived
    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    /// Upstream answered with a non-success status
    #[error("{status}: {body}")]
    UpstreamStatus { status: StatusCode, body: String },

    /// Upstream body failed after streaming began
    #[error("upstream stream failed: {0}")]
    UpstreamRead(String),

    /// The downstream client went away
    #[error("downstream disconnected")]
    DownstreamClosed,
}

impl RelayError {
    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            RelayError::Unreachable(_) => "upstream_unreachable",
            RelayError::UpstreamStatus { .. } => "upstream_status",
            RelayError::UpstreamRead(_) => "upstream_read",
            RelayError::DownstreamClosed => "downstream_closed",
        }
    }

    /// Build from a reqwest transport error, keeping the kind of failure visible
    pub fn from_transport(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            RelayError::Unreachable(format!("request timed out: {error}"))
        } else if error.is_connect() {
            RelayError::Unreachable(format!("failed to connect: {error}"))
        } else {
            RelayError::Unreachable(format!("request failed: {error}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display_carries_code_and_body() {
        let err = RelayError::UpstreamStatus {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: "rate limited".to_string(),
        };
        assert_eq!(err.to_string(), "429 Too Many Requests: rate limited");
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            RelayError::Unreachable("connection refused".to_string()).to_string(),
            "upstream unreachable: connection refused"
        );
        assert_eq!(
            RelayError::UpstreamRead("reset".to_string()).to_string(),
            "upstream stream failed: reset"
        );
        assert_eq!(
            RelayError::DownstreamClosed.to_string(),
            "downstream disconnected"
        );
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            RelayError::Unreachable("x".to_string()).category(),
            "upstream_unreachable"
        );
        assert_eq!(
            RelayError::UpstreamStatus {
                status: StatusCode::BAD_GATEWAY,
                body: String::new()
            }
            .category(),
            "upstream_status"
        );
        assert_eq!(
            RelayError::UpstreamRead("x".to_string()).category(),
            "upstream_read"
        );
        assert_eq!(RelayError::DownstreamClosed.category(), "downstream_closed");
    }
}
