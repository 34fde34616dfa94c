//! Upstream transport
//!
//! The relay only needs "POST this JSON and hand me the body as a byte
//! stream, or tell me why not". [`UpstreamClient`] is that seam;
//! [`HttpUpstream`] implements it with reqwest.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use url::Url;

use crate::config::UpstreamConfig;
use crate::error::{Result, TrickleError};

use super::error::RelayError;
use super::request::UpstreamRequest;

/// Upstream response body, chunk by chunk
pub type UpstreamStream = BoxStream<'static, std::result::Result<Bytes, RelayError>>;

/// Issues the upstream call for one relay operation
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Send `body` and return the response body once the status line and
    /// headers have arrived, without waiting for the full body.
    ///
    /// Transport failures map to [`RelayError::Unreachable`] and non-success
    /// statuses to [`RelayError::UpstreamStatus`].
    async fn open(&self, body: &UpstreamRequest) -> std::result::Result<UpstreamStream, RelayError>;
}

/// reqwest-backed upstream client
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    url: Url,
    api_key: Option<String>,
    sse_header: HeaderName,
}

impl HttpUpstream {
    /// Build from config, resolving the credential once
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let url = config.parsed_url()?;

        let sse_header = HeaderName::from_bytes(config.sse_header.as_bytes()).map_err(|e| {
            TrickleError::Config(format!("Invalid SSE header '{}': {e}", config.sse_header))
        })?;

        let api_key = config.resolve_api_key();
        if api_key.is_none() {
            tracing::warn!(
                "No upstream API key configured (set upstream.api_key or ${})",
                config.api_key_env
            );
        }

        // No overall timeout: a streamed answer can legitimately take minutes
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| TrickleError::Upstream(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url,
            api_key,
            sse_header,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn open(
        &self,
        body: &UpstreamRequest,
    ) -> std::result::Result<UpstreamStream, RelayError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header(self.sse_header.clone(), HeaderValue::from_static("enable"))
            .json(body);

        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        // `send` resolves as soon as the response head is in
        let response = request
            .send()
            .await
            .map_err(|e| RelayError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read error body: {e}>"));
            return Err(RelayError::UpstreamStatus { status, body });
        }

        tracing::debug!(%status, "Upstream stream opened");

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| RelayError::UpstreamRead(e.to_string())))
            .boxed())
    }
}
