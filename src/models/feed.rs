use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Upstream connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    /// No credentials yet, no connection attempted
    CredentialsMissing,
    /// Waiting for the reconnect timer or a credential update
    Disconnected,
    Connecting,
    Connected,
    /// Tearing down the live connection
    Closing,
}

impl FeedState {
    pub fn is_connected(&self) -> bool {
        matches!(self, FeedState::Connected)
    }
}

/// Detailed upstream feed status
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FeedStatus {
    pub state: FeedState,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    /// Connections opened since startup
    pub connections: u64,
    /// Consecutive failed attempts since the last successful connect
    pub reconnect_attempts: u32,
    pub frames_received: u64,
    pub ticks_forwarded: u64,
    pub decode_failures: u64,
    pub invalid_prices: u64,
    /// Instruments currently subscribed on the live connection
    pub active_instruments: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Health status of the relay
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthStatus {
    pub status: HealthState,
    pub feed_state: FeedState,
    pub sessions: usize,
    pub instruments: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}
