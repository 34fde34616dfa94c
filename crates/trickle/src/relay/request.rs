//! Inbound client request and the upstream request body built from it

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::session::{SessionId, SessionIdError};

/// Level used when the client does not send one
pub const DEFAULT_LEVEL: i64 = 1;

/// A chat turn as sent by the downstream client
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub message: String,
    /// Opaque token continuing an earlier conversation
    #[serde(default, alias = "session_id")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub level: Option<i64>,
}

/// Reasons an inbound request is rejected before any upstream call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("message cannot be empty")]
    EmptyMessage,

    #[error("invalid sessionId: {0}")]
    InvalidSessionId(#[from] SessionIdError),
}

impl StreamRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            session_id: None,
            level: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_level(mut self, level: i64) -> Self {
        self.level = Some(level);
        self
    }

    pub fn level(&self) -> i64 {
        self.level.unwrap_or(DEFAULT_LEVEL)
    }

    /// Check the message and parse the session token
    ///
    /// An empty `sessionId` is treated as absent.
    pub fn validate(&self) -> Result<Option<SessionId>, RequestError> {
        if self.message.trim().is_empty() {
            return Err(RequestError::EmptyMessage);
        }

        match self.session_id.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => Ok(Some(SessionId::try_from(raw)?)),
        }
    }
}

/// Decoding switches sent with every upstream call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecodingParameters {
    pub incremental_output: bool,
    pub has_thoughts: bool,
}

impl Default for DecodingParameters {
    fn default() -> Self {
        Self {
            incremental_output: true,
            has_thoughts: true,
        }
    }
}

/// JSON body posted to the upstream app completion endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamRequest {
    pub input: UpstreamInput,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub biz_params: BizParams,
    pub parameters: DecodingParameters,
    pub debug: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BizParams {
    pub user_prompt_params: UserPromptParams,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserPromptParams {
    pub level: i64,
}

impl UpstreamRequest {
    pub fn new(request: &StreamRequest, parameters: DecodingParameters) -> Self {
        Self {
            input: UpstreamInput {
                prompt: request.message.clone(),
                session_id: request.session_id.clone().filter(|s| !s.is_empty()),
                biz_params: BizParams {
                    user_prompt_params: UserPromptParams {
                        level: request.level(),
                    },
                },
                parameters,
                debug: serde_json::Map::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_camel_case() {
        let request: StreamRequest =
            serde_json::from_str(r#"{"message":"hi","sessionId":"abc","level":3}"#).unwrap();
        assert_eq!(request.message, "hi");
        assert_eq!(request.session_id.as_deref(), Some("abc"));
        assert_eq!(request.level(), 3);
    }

    #[test]
    fn test_deserialize_defaults() {
        let request: StreamRequest = serde_json::from_str(r#"{"message":"hi"}"#).unwrap();
        assert!(request.session_id.is_none());
        assert_eq!(request.level(), DEFAULT_LEVEL);

        let request: StreamRequest =
            serde_json::from_str(r#"{"message":"hi","sessionId":null,"level":null}"#).unwrap();
        assert!(request.session_id.is_none());
        assert_eq!(request.level(), DEFAULT_LEVEL);
    }

    #[test]
    fn test_deserialize_snake_case_alias() {
        let request: StreamRequest =
            serde_json::from_str(r#"{"message":"hi","session_id":"abc"}"#).unwrap();
        assert_eq!(request.session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_validate() {
        assert_eq!(StreamRequest::new("hi").validate(), Ok(None));
        assert_eq!(
            StreamRequest::new("hi").with_session("").validate(),
            Ok(None)
        );
        assert_eq!(
            StreamRequest::new("  ").validate(),
            Err(RequestError::EmptyMessage)
        );
        assert!(matches!(
            StreamRequest::new("hi").with_session("bad token").validate(),
            Err(RequestError::InvalidSessionId(SessionIdError::InvalidChars))
        ));

        let session = StreamRequest::new("hi")
            .with_session("abc123")
            .validate()
            .unwrap()
            .unwrap();
        assert_eq!(session.as_str(), "abc123");
    }

    #[test]
    fn test_upstream_body_shape() {
        let request = StreamRequest::new("What is Rust?")
            .with_session("abc123")
            .with_level(2);
        let body = UpstreamRequest::new(&request, DecodingParameters::default());

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "input": {
                    "prompt": "What is Rust?",
                    "session_id": "abc123",
                    "biz_params": {"user_prompt_params": {"level": 2}},
                    "parameters": {"incremental_output": true, "has_thoughts": true},
                    "debug": {}
                }
            })
        );
    }

    #[test]
    fn test_upstream_body_omits_missing_session() {
        let body = UpstreamRequest::new(&StreamRequest::new("hi"), DecodingParameters::default());
        let value = serde_json::to_value(&body).unwrap();
        assert!(value["input"].get("session_id").is_none());
        assert_eq!(value["input"]["biz_params"]["user_prompt_params"]["level"], 1);
    }

    #[test]
    fn test_prompt_with_quotes_and_control_chars_is_escaped() {
        let prompt = "say \"hi\"\n\u{0007}\\ end";
        let body = UpstreamRequest::new(&StreamRequest::new(prompt), DecodingParameters::default());

        let encoded = serde_json::to_string(&body).unwrap();
        let decoded: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded["input"]["prompt"], prompt);
        assert!(!encoded.contains('\n'));
    }
}
