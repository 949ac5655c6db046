use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

use super::instrument::InstrumentKey;

/// Opaque identifier of one downstream subscriber session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Instrument requested by a session, exactly as the client sent it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SubscribeRequest {
    #[schema(example = "99926000")]
    pub token: String,
    #[schema(example = "NSE")]
    pub exchange: String,
}

impl SubscribeRequest {
    pub fn new(token: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            exchange: exchange.into(),
        }
    }
}

/// One request item that was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Rejection {
    pub token: String,
    pub exchange: String,
    pub reason: String,
}

/// Result of a subscribe or unsubscribe call for one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct SubscribeReport {
    pub accepted: Vec<InstrumentKey>,
    pub rejected: Vec<Rejection>,
}

impl SubscribeReport {
    pub fn is_fully_accepted(&self) -> bool {
        self.rejected.is_empty()
    }
}
