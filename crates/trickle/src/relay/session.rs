//! Session token validation
//!
//! Session tokens are opaque to the relay: the caller passes one in to continue
//! a conversation, and the upstream reveals one mid-stream for the caller to keep.
//! Because the discovered token may be surfaced as an HTTP response header, it
//! must be non-empty visible ASCII, max 256 bytes.

use thiserror::Error;

/// Maximum length for session tokens
const MAX_SESSION_ID_LEN: usize = 256;

/// Errors that can occur during session token validation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionIdError {
    /// Session token is empty
    #[error("Session ID cannot be empty")]
    Empty,

    /// Session token contains whitespace, control or non-ASCII characters
    #[error("Session ID contains invalid characters: only visible ASCII is allowed")]
    InvalidChars,

    /// Session token exceeds maximum length
    #[error("Session ID exceeds maximum length of {MAX_SESSION_ID_LEN} characters")]
    TooLong,
}

/// A validated, opaque session token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Get the session token as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), SessionIdError> {
        if s.is_empty() {
            return Err(SessionIdError::Empty);
        }

        if s.len() > MAX_SESSION_ID_LEN {
            return Err(SessionIdError::TooLong);
        }

        if !s.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(SessionIdError::InvalidChars);
        }

        Ok(())
    }
}

impl TryFrom<&str> for SessionId {
    type Error = SessionIdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::validate(value)?;
        Ok(SessionId(value.to_string()))
    }
}

impl TryFrom<String> for SessionId {
    type Error = SessionIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::validate(&value)?;
        Ok(SessionId(value))
    }
}

impl From<SessionId> for String {
    fn from(session_id: SessionId) -> Self {
        session_id.0
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
