use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{RelayError, Result};

/// Main configuration structure for signal-relay
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Upstream generation provider configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Streaming relay behaviour
    #[serde(default)]
    pub relay: RelayConfig,
}

impl Config {
    /// Read and parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string and validate it
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, or from the first default location that exists
    ///
    /// Falls back to built-in defaults when no file is found.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = config_path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::from_file(path);
        }

        for path in default_config_paths() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(&path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Config::default())
    }

    /// Reject values that would only fail later at runtime
    pub fn validate(&self) -> Result<()> {
        self.server.socket_addr()?;

        Url::parse(&self.upstream.api_url).map_err(|e| {
            RelayError::Config(format!(
                "Invalid upstream api_url '{}': {e}",
                self.upstream.api_url
            ))
        })?;

        if self.upstream.timeout_secs == 0
            || self.upstream.connect_timeout_secs == 0
            || self.upstream.stream_idle_timeout_secs == 0
        {
            return Err(RelayError::Config(
                "Upstream timeouts must be greater than zero".to_string(),
            ));
        }

        if self.upstream.max_idle_connections == 0 {
            return Err(RelayError::Config(
                "upstream.max_idle_connections must be at least 1".to_string(),
            ));
        }

        if self.relay.request_timeout_secs == 0 {
            return Err(RelayError::Config(
                "relay.request_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.relay.client_buffer_frames == 0 {
            return Err(RelayError::Config(
                "relay.client_buffer_frames must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn default_config_paths() -> Vec<PathBuf> {
    [
        dirs::home_dir().map(|h| h.join(".signal-relay").join("config.toml")),
        dirs::config_dir().map(|c| c.join("signal-relay").join("config.toml")),
        Some(PathBuf::from("config.toml")),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "0.0.0.0:8000")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr.parse().map_err(|e| {
            RelayError::Config(format!("Invalid listen address '{}': {e}", self.listen_addr))
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8000".to_string()
}

/// Upstream OpenAI-compatible provider configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base API URL; `/chat/completions` is appended
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Model identifier
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Timeout for a buffered call, and for the response head of a streaming call
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Longest silence tolerated between two chunks of a streaming response
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
    /// Keep-alive connections kept per upstream host
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: usize,
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
            max_idle_connections: default_max_idle_connections(),
        }
    }
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    900
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_stream_idle_timeout_secs() -> u64 {
    30
}

fn default_max_idle_connections() -> usize {
    20
}

/// Streaming relay behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Deadline for a whole client request, streaming included
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Retry a stream that failed before its first frame on the buffered path
    #[serde(default = "default_fallback_to_buffered")]
    pub fallback_to_buffered: bool,
    /// Frames queued per client before writes wait on the client
    #[serde(default = "default_client_buffer_frames")]
    pub client_buffer_frames: usize,
}

impl RelayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            fallback_to_buffered: default_fallback_to_buffered(),
            client_buffer_frames: default_client_buffer_frames(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_fallback_to_buffered() -> bool {
    true
}

fn default_client_buffer_frames() -> usize {
    8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "0.0.0.0:8000");
        assert_eq!(config.upstream.api_url, "https://api.openai.com/v1");
        assert_eq!(config.upstream.api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.upstream.model, "gpt-4o-mini");
        assert_eq!(config.upstream.max_tokens, 900);
        assert_eq!(config.upstream.timeout_secs, 60);
        assert_eq!(config.upstream.max_idle_connections, 20);
        assert_eq!(config.relay.request_timeout_secs, 120);
        assert!(config.relay.fallback_to_buffered);
        assert_eq!(config.relay.client_buffer_frames, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.upstream.model, "gpt-4o-mini");
        assert_eq!(config.relay.request_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_partial_toml_overrides() {
        let toml = r#"
[server]
listen_addr = "127.0.0.1:9000"

[upstream]
model = "gpt-4o"
stream_idle_timeout_secs = 5

[relay]
fallback_to_buffered = false
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.upstream.model, "gpt-4o");
        assert_eq!(config.upstream.temperature, 0.2);
        assert_eq!(config.upstream.stream_idle_timeout(), Duration::from_secs(5));
        assert!(!config.relay.fallback_to_buffered);
        assert_eq!(config.relay.client_buffer_frames, 8);
    }

    #[test]
    fn test_invalid_listen_addr_rejected() {
        let err = Config::from_toml("[server]\nlisten_addr = \"not-an-addr\"").unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
        assert!(err.to_string().contains("listen address"));
    }

    #[test]
    fn test_invalid_api_url_rejected() {
        let err = Config::from_toml("[upstream]\napi_url = \"::nope\"").unwrap_err();
        assert!(err.to_string().contains("api_url"));
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(Config::from_toml("[relay]\nclient_buffer_frames = 0").is_err());
        assert!(Config::from_toml("[relay]\nrequest_timeout_secs = 0").is_err());
        assert!(Config::from_toml("[upstream]\ntimeout_secs = 0").is_err());
    }

    #[test]
    fn test_zero_connect_timeout_rejected() {
        let err = Config::from_toml("[upstream]\nconnect_timeout_secs = 0").unwrap_err();
        assert!(err.to_string().contains("timeouts"));
    }

    #[test]
    fn test_zero_idle_connections_rejected() {
        let err = Config::from_toml("[upstream]\nmax_idle_connections = 0").unwrap_err();
        assert!(err.to_string().contains("max_idle_connections"));
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let err = Config::from_toml("[server\nlisten_addr = 1").unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[upstream]\nmax_tokens = 256").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.upstream.max_tokens, 256);
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let err = Config::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
