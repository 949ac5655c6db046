use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use url::Url;
use utoipa::ToSchema;

use crate::errors::FeedError;
use crate::models::credentials::mask;
use crate::models::UpstreamCredentials;
use crate::protocol::DEFAULT_MODE;

/// Top-level relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RelayConfig {
    /// Listen address for the HTTP/WebSocket server
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Heartbeat interval for downstream WebSocket sessions (seconds)
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Updates queued per session before new ones are dropped
    #[serde(default = "default_session_buffer")]
    pub session_buffer: usize,

    #[serde(default)]
    pub feed: FeedConfig,
}

/// Upstream broker feed configuration
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FeedConfig {
    /// URL scheme (wss in production)
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Broker WebSocket host
    #[serde(default = "default_host")]
    pub host: String,

    /// Path of the streaming endpoint
    #[serde(default = "default_path")]
    pub path: String,

    /// Subscription mode sent with every control message
    #[serde(default = "default_mode")]
    pub mode: u8,

    /// Connection attempt timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Reconnection strategy
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Reconnection configuration
///
/// Fixed delays by default. With `backoff` enabled the delay grows by
/// `multiplier` per consecutive failure, capped at `max_delay_ms`, with
/// `jitter` as a +/- fraction.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReconnectConfig {
    /// Delay after the upstream closed an established connection
    #[serde(default = "default_close_delay")]
    pub close_delay_ms: u64,

    /// Delay after a connect, setup or credential-fetch error
    #[serde(default = "default_error_delay")]
    pub error_delay_ms: u64,

    /// Enable capped exponential backoff
    #[serde(default)]
    pub backoff: bool,

    /// Maximum retry delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,

    /// Jitter fraction (0.2 = +/-20%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            heartbeat_secs: default_heartbeat_secs(),
            session_buffer: default_session_buffer(),
            feed: FeedConfig::default(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            host: default_host(),
            path: default_path(),
            mode: default_mode(),
            connect_timeout_secs: default_connect_timeout(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            close_delay_ms: default_close_delay(),
            error_delay_ms: default_error_delay(),
            backoff: false,
            max_delay_ms: default_max_delay(),
            multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RelayConfig {
    /// Build configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind_addr = match std::env::var("RELAY_BIND_ADDR") {
            Ok(addr) => addr,
            Err(_) => match std::env::var("PORT") {
                Ok(port) => format!("0.0.0.0:{}", port.trim()),
                Err(_) => defaults.bind_addr,
            },
        };

        Self {
            bind_addr,
            heartbeat_secs: env_or("WS_HEARTBEAT_SECS", defaults.heartbeat_secs),
            session_buffer: env_or("WS_SESSION_BUFFER", defaults.session_buffer),
            feed: FeedConfig::from_env(),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

impl FeedConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let reconnect = ReconnectConfig::default();

        Self {
            scheme: env_or("FEED_SCHEME", defaults.scheme),
            host: env_or("FEED_HOST", defaults.host),
            path: env_or("FEED_PATH", defaults.path),
            mode: env_or("FEED_SUBSCRIPTION_MODE", defaults.mode),
            connect_timeout_secs: env_or("FEED_CONNECT_TIMEOUT_SECS", defaults.connect_timeout_secs),
            reconnect: ReconnectConfig {
                close_delay_ms: env_or("FEED_RECONNECT_CLOSE_DELAY_MS", reconnect.close_delay_ms),
                error_delay_ms: env_or("FEED_RECONNECT_ERROR_DELAY_MS", reconnect.error_delay_ms),
                backoff: env_or("FEED_RECONNECT_BACKOFF", reconnect.backoff),
                max_delay_ms: env_or("FEED_RECONNECT_MAX_DELAY_MS", reconnect.max_delay_ms),
                multiplier: env_or("FEED_RECONNECT_MULTIPLIER", reconnect.multiplier),
                jitter: env_or("FEED_RECONNECT_JITTER", reconnect.jitter),
            },
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// `<scheme>://<host>/<path>?clientCode=..&feedToken=..&apiKey=..`
    pub fn upstream_url(&self, credentials: &UpstreamCredentials) -> Result<Url, FeedError> {
        if !credentials.is_complete() {
            return Err(FeedError::MissingCredentials);
        }

        let base = format!(
            "{}://{}/{}",
            self.scheme,
            self.host.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        );
        let mut url = Url::parse(&base).map_err(|e| FeedError::InvalidUrl(e.to_string()))?;

        url.query_pairs_mut()
            .append_pair("clientCode", credentials.client_code.trim())
            .append_pair("feedToken", credentials.feed_token.trim())
            .append_pair("apiKey", credentials.api_key.trim());

        Ok(url)
    }
}

/// Upstream URL with the secret query values masked, for logging
pub fn redact_url(url: &Url) -> String {
    let mut redacted = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let value = if k == "clientCode" { v.to_string() } else { mask(&v) };
            (k.to_string(), value)
        })
        .collect();

    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

// Default value functions for serde
fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_session_buffer() -> usize {
    1024
}

fn default_scheme() -> String {
    "wss".to_string()
}

fn default_host() -> String {
    "smartapisocket.angelone.in".to_string()
}

fn default_path() -> String {
    "smart-stream".to_string()
}

fn default_mode() -> u8 {
    DEFAULT_MODE
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_close_delay() -> u64 {
    2000
}

fn default_error_delay() -> u64 {
    5000
}

fn default_max_delay() -> u64 {
    30000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}
