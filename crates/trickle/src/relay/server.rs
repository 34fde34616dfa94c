//! HTTP front end for the relay
//!
//! - `POST <route>`: JSON [`StreamRequest`] in, streaming relay response out
//! - `GET /health`: liveness probe
//!
//! Each request gets its own relay task and its own tracker state; the only
//! shared piece is the upstream client.

use axum::{
    Json, Router,
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::{Response, StatusCode},
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::{Result, TrickleError};

use super::encoder::Encoder;
use super::orchestrator::{RelayOptions, relay};
use super::request::StreamRequest;
use super::sink::channel;
use super::upstream::{HttpUpstream, UpstreamClient};

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Upstream transport shared by all relays
    pub upstream: Arc<dyn UpstreamClient>,
    /// Wire format and tracking policy
    pub options: RelayOptions,
    /// Path of the streaming endpoint
    pub route: String,
    /// Buffered messages per relay between the task and the response body
    pub channel_capacity: usize,
}

impl AppState {
    pub fn new(upstream: Arc<dyn UpstreamClient>, config: &Config) -> Self {
        Self {
            upstream,
            options: RelayOptions::from_config(config),
            route: config.server.route.clone(),
            channel_capacity: config.relay.channel_capacity,
        }
    }
}

/// The relay HTTP server
pub struct RelayServer {
    config: Config,
}

impl RelayServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Start the server and relay requests until shutdown
    pub async fn serve(&self) -> Result<()> {
        self.config.validate()?;

        let upstream = HttpUpstream::new(&self.config.upstream)?;
        tracing::info!("Upstream endpoint: {}", upstream.url());

        let state = Arc::new(AppState::new(Arc::new(upstream), &self.config));
        tracing::info!(
            output_mode = ?state.options.output_mode,
            emission = ?state.options.emission,
            anomaly_policy = ?state.options.anomaly_policy,
            "Relay configured"
        );

        let app = create_router(state);

        let addr: SocketAddr = self
            .config
            .server
            .listen_addr
            .parse()
            .map_err(|e| TrickleError::Config(format!("Invalid listen address: {e}")))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TrickleError::Server(format!("Failed to bind to {addr}: {e}")))?;

        tracing::info!(
            "Listening on {addr}, streaming endpoint POST {}",
            self.config.server.route
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| TrickleError::Server(format!("Server error: {e}")))?;

        tracing::info!("Relay server shut down gracefully");
        Ok(())
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(&state.route, post(stream_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint - returns JSON status
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Validate the request, start a relay task, and stream its output
async fn stream_handler(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<StreamRequest>, JsonRejection>,
) -> Response<Body> {
    let Json(request) = match payload {
        Ok(request) => request,
        Err(rejection) => {
            tracing::warn!("Rejected stream request: {}", rejection.body_text());
            return create_error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &rejection.body_text(),
            );
        }
    };

    if let Err(e) = request.validate() {
        tracing::warn!("Rejected stream request: {e}");
        return create_error_response(StatusCode::BAD_REQUEST, "invalid_request", &e.to_string());
    }

    let encoder = Encoder::new(state.options.output_mode);
    let (mut sink, pending) = channel(state.channel_capacity, encoder.response_headers());

    let upstream = Arc::clone(&state.upstream);
    let options = state.options;
    tokio::spawn(async move {
        relay(upstream.as_ref(), &request, &options, &mut sink).await;
    });

    pending.into_response().await
}

/// Create a JSON error response
fn create_error_response(status: StatusCode, error_type: &str, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
        }
    });

    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    response
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedUpstream, sse_event};
    use axum::http::Request;
    use tower::ServiceExt;

    fn create_test_state(upstream: ScriptedUpstream) -> Arc<AppState> {
        Arc::new(AppState::new(Arc::new(upstream), &Config::default()))
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn post_json(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/chat/stream")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_router(create_test_state(ScriptedUpstream::lines(Vec::new())));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("\"status\":\"ok\""));
    }

    #[tokio::test]
    async fn test_invalid_json_rejected() {
        let upstream = ScriptedUpstream::lines(Vec::new());
        let calls = upstream.calls();
        let app = create_router(create_test_state(upstream));

        let response = app.oneshot(post_json("{not json")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("invalid_request"));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let app = create_router(create_test_state(ScriptedUpstream::lines(Vec::new())));

        let response = app.oneshot(post_json(r#"{"message":"   "}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("message cannot be empty"));
    }

    #[tokio::test]
    async fn test_invalid_session_rejected() {
        let app = create_router(create_test_state(ScriptedUpstream::lines(Vec::new())));

        let response = app
            .oneshot(post_json(r#"{"message":"hi","sessionId":"has spaces"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("invalid sessionId"));
    }

    #[tokio::test]
    async fn test_stream_endpoint_relays_tagged_messages() {
        let upstream = ScriptedUpstream::lines(vec![
            sse_event(Some("s-1"), Some("Hello"), None, None),
            sse_event(Some("s-1"), Some("Hello world"), None, Some("stop")),
        ]);
        let calls = upstream.calls();
        let app = create_router(create_test_state(upstream));

        let response = app
            .oneshot(post_json(r#"{"message":"hi","sessionId":"prev-1","level":2}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "application/x-ndjson"
        );
        assert_eq!(response.headers()["cache-control"], "no-cache");

        let body = body_string(response).await;
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(
            lines,
            vec![
                r#"{"type":"session","content":"s-1"}"#,
                r#"{"type":"text","content":"Hello"}"#,
                r#"{"type":"text","content":" world"}"#,
                r#"{"type":"done","content":"stop"}"#,
            ]
        );

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["input"]["prompt"], "hi");
        assert_eq!(calls[0]["input"]["session_id"], "prev-1");
        assert_eq!(calls[0]["input"]["biz_params"]["user_prompt_params"]["level"], 2);
    }

    #[tokio::test]
    async fn test_unknown_path_not_found() {
        let app = create_router(create_test_state(ScriptedUpstream::lines(Vec::new())));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/elsewhere")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
