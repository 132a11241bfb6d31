//! Configuration management for livecook-viewer

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Signaling service (offer/answer exchange)
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// Stream catalog API
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Viewer connection behaviour
    #[serde(default)]
    pub viewer: ViewerConfig,

    /// HTTP control surface
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Base URL of the signaling service
    #[serde(default = "default_backend_url")]
    pub base_url: String,

    /// Path of the consumer (viewer) endpoint
    #[serde(default = "default_consumer_path")]
    pub consumer_path: String,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl SignalingConfig {
    pub fn consumer_url(&self) -> String {
        let path = self.consumer_path.trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
            consumer_path: default_consumer_path(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Base URL of the streams API
    #[serde(default = "default_backend_url")]
    pub base_url: String,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerConfig {
    /// ICE servers handed to every peer connection
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    /// Connection attempts per join cycle, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before a failed attempt is retried
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Request an audio transceiver next to the video one
    #[serde(default = "default_true")]
    pub receive_audio: bool,

    /// Wait for ICE gathering before sending the offer
    #[serde(default = "default_true")]
    pub wait_for_ice_gathering: bool,

    /// Upper bound on the ICE gathering wait
    #[serde(default = "default_ice_gathering_timeout_ms")]
    pub ice_gathering_timeout_ms: u64,

    /// Fail an attempt that has not connected within this time (0 disables)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl ViewerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            receive_audio: true,
            wait_for_ice_gathering: true,
            ice_gathering_timeout_ms: default_ice_gathering_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// HTTP bind address
    #[serde(default = "default_http_host")]
    pub host: String,

    /// HTTP port for the control surface
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or env_logger filter string
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file; a missing file yields defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_http_url("signaling.base_url", &self.signaling.base_url)?;
        validate_http_url("catalog.base_url", &self.catalog.base_url)?;

        if self.signaling.consumer_path.trim().is_empty() {
            bail!("signaling.consumer_path must not be empty");
        }
        if self.signaling.request_timeout_ms == 0 || self.catalog.request_timeout_ms == 0 {
            bail!("Request timeouts must be non-zero");
        }

        if self.viewer.max_attempts == 0 {
            bail!("viewer.max_attempts must be at least 1");
        }

        let has_stun = self
            .viewer
            .ice_servers
            .iter()
            .flat_map(|server| server.urls.iter())
            .any(|url| url.starts_with("stun:") || url.starts_with("stuns:"));
        if !has_stun {
            bail!("viewer.ice_servers must contain at least one stun: URL");
        }

        for server in &self.viewer.ice_servers {
            if server.urls.is_empty() {
                bail!("ICE server entries need at least one URL");
            }
            let is_turn = server.urls.iter().any(|url| url.starts_with("turn"));
            if is_turn && (server.username.is_none() || server.credential.is_none()) {
                bail!("TURN servers need both username and credential");
            }
        }

        if self.viewer.wait_for_ice_gathering && self.viewer.ice_gathering_timeout_ms == 0 {
            bail!("viewer.ice_gathering_timeout_ms must be non-zero when waiting for gathering");
        }

        if self.http.port == 0 {
            bail!("http.port must be non-zero");
        }

        Ok(())
    }
}

fn validate_http_url(field: &str, value: &str) -> anyhow::Result<()> {
    let url = reqwest::Url::parse(value).with_context(|| format!("{} is not a valid URL", field))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        bail!("{} must use http or https", field);
    }
    Ok(())
}

fn default_backend_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_consumer_path() -> String {
    "/consumer".to_string()
}

fn default_request_timeout_ms() -> u64 { 10_000 }
fn default_max_attempts() -> u32 { 3 }
fn default_retry_delay_ms() -> u64 { 1_000 }
fn default_ice_gathering_timeout_ms() -> u64 { 2_000 }
fn default_connect_timeout_ms() -> u64 { 15_000 }

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec!["stun:stun.stunprotocol.org".to_string()],
        username: None,
        credential: None,
    }]
}

fn default_true() -> bool {
    true
}

fn default_http_host() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 { 8090 }

fn default_log_level() -> String {
    "info".to_string()
}
