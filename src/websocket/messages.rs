use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{InstrumentKey, MarketUpdate, Rejection, SessionId, SubscribeReport, SubscribeRequest};

/// Event name carried by every tick message
pub const MARKET_UPDATE_EVENT: &str = "market-update";

/// WebSocket message types
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Sent once after the upgrade
    Welcome {
        session_id: SessionId,
    },
    /// Tick for an instrument the session subscribed to
    MarketUpdate {
        event: String,
        room: String,
        data: MarketUpdate,
    },
    /// Subscription confirmation
    Subscribed {
        accepted: Vec<InstrumentKey>,
        rejected: Vec<Rejection>,
    },
    /// Unsubscription confirmation
    Unsubscribed {
        accepted: Vec<InstrumentKey>,
        rejected: Vec<Rejection>,
    },
    /// Error message
    Error {
        message: String,
    },
    /// Heartbeat/Ping
    Ping {
        timestamp: DateTime<Utc>,
    },
    /// Pong response
    Pong {
        timestamp: DateTime<Utc>,
    },
}

impl WsMessage {
    pub fn market_update(update: MarketUpdate) -> Self {
        WsMessage::MarketUpdate {
            event: MARKET_UPDATE_EVENT.to_string(),
            room: update.room(),
            data: update,
        }
    }

    pub fn subscribed(report: SubscribeReport) -> Self {
        WsMessage::Subscribed {
            accepted: report.accepted,
            rejected: report.rejected,
        }
    }

    pub fn unsubscribed(report: SubscribeReport) -> Self {
        WsMessage::Unsubscribed {
            accepted: report.accepted,
            rejected: report.rejected,
        }
    }
}

/// Client subscription request
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        tokens: Vec<SubscribeRequest>,
    },
    Unsubscribe {
        tokens: Vec<SubscribeRequest>,
    },
    Ping,
}
