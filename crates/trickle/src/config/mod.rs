use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{Result, TrickleError};
use crate::relay::{AnomalyPolicy, Emission, OutputMode};

/// Main configuration structure for Trickle
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Downstream HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Upstream app API configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Relay wire format and tracking policy
    #[serde(default)]
    pub relay: RelayConfig,
}

impl Config {
    /// Parse a config from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| TrickleError::Config(format!("Failed to parse config: {e}")))
    }

    /// Read and parse a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrickleError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Check the settings that cannot be expressed through serde alone
    pub fn validate(&self) -> Result<()> {
        self.upstream.parsed_url()?;

        if !self.server.route.starts_with('/') {
            return Err(TrickleError::Config(format!(
                "Route '{}' must start with '/'",
                self.server.route
            )));
        }

        if self.relay.channel_capacity == 0 {
            return Err(TrickleError::Config(
                "relay.channel_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Load the config from an explicit path, or from the first default location that exists
///
/// Falls back to `Config::default()` when no file is found.
pub fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    if let Some(path) = config_path {
        tracing::info!("Loading config from: {}", path.display());
        return Config::from_file(&path);
    }

    for path in default_config_paths().iter().flatten() {
        if path.exists() {
            tracing::info!("Loading config from: {}", path.display());
            return Config::from_file(path);
        }
    }

    tracing::info!("No config file found, using defaults");
    Ok(Config::default())
}

fn default_config_paths() -> [Option<PathBuf>; 3] {
    [
        dirs::home_dir().map(|h| h.join(".trickle").join("config.toml")),
        dirs::config_dir().map(|c| c.join("trickle").join("config.toml")),
        Some(PathBuf::from("config.toml")),
    ]
}

/// Downstream HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Path of the streaming chat endpoint
    #[serde(default = "default_route")]
    pub route: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            route: default_route(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_route() -> String {
    "/api/chat/stream".to_string()
}

/// Upstream app API configuration
#[derive(Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Completion endpoint of the upstream app API
    #[serde(default)]
    pub url: Option<String>,
    /// Bearer credential; takes precedence over `api_key_env`
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable name for the bearer credential
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Header that switches the upstream into SSE mode
    #[serde(default = "default_sse_header")]
    pub sse_header: String,
    /// Value for `parameters.incremental_output`
    #[serde(default = "default_true")]
    pub incremental_output: bool,
    /// Value for `parameters.has_thoughts`
    #[serde(default = "default_true")]
    pub has_thoughts: bool,
}

impl UpstreamConfig {
    /// The configured URL, parsed and restricted to http and https
    pub fn parsed_url(&self) -> Result<Url> {
        let raw = self
            .url
            .as_deref()
            .ok_or_else(|| TrickleError::Config("upstream.url is not set".to_string()))?;

        let url = Url::parse(raw)
            .map_err(|e| TrickleError::Config(format!("Invalid upstream URL '{raw}': {e}")))?;

        match url.scheme() {
            "http" | "https" => Ok(url),
            scheme => Err(TrickleError::Config(format!(
                "Unsupported URL scheme '{scheme}': only http and https are allowed"
            ))),
        }
    }

    /// Resolve the bearer credential from the literal key or the environment
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            api_key_env: default_api_key_env(),
            connect_timeout_secs: default_connect_timeout_secs(),
            sse_header: default_sse_header(),
            incremental_output: true,
            has_thoughts: true,
        }
    }
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_key_env", &self.api_key_env)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("sse_header", &self.sse_header)
            .field("incremental_output", &self.incremental_output)
            .field("has_thoughts", &self.has_thoughts)
            .finish()
    }
}

fn default_api_key_env() -> String {
    "DASHSCOPE_API_KEY".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_sse_header() -> String {
    "X-DashScope-SSE".to_string()
}

fn default_true() -> bool {
    true
}

/// Relay wire format and tracking policy
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Downstream wire shape
    #[serde(default)]
    pub output_mode: OutputMode,
    /// Forward deltas or full snapshots
    #[serde(default)]
    pub emission: Emission,
    /// What to do when a cumulative value shrinks or repeats
    #[serde(default)]
    pub anomaly_policy: AnomalyPolicy,
    /// Buffered messages between the relay task and the response body
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            output_mode: OutputMode::default(),
            emission: Emission::default(),
            anomaly_policy: AnomalyPolicy::default(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_channel_capacity() -> usize {
    32
}
