use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::fanout::FanoutStats;
use crate::models::{ExchangeCode, InstrumentKey, SessionId};
use crate::subscription::RegistryStats;

/// Response after accepting new upstream credentials
#[derive(Debug, Serialize, ToSchema)]
pub struct CredentialsAccepted {
    #[schema(example = "accepted")]
    pub status: String,
    pub client_code: String,
    pub message: String,
}

/// One instrument with the sessions interested in it
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SubscriptionEntry {
    pub exchange: ExchangeCode,
    #[schema(example = "99926000")]
    pub token: String,
    #[schema(example = "TOKEN:99926000")]
    pub room: String,
    pub sessions: Vec<Uuid>,
}

impl SubscriptionEntry {
    pub fn new(key: &InstrumentKey, sessions: &[SessionId]) -> Self {
        Self {
            exchange: key.exchange(),
            token: key.token().to_string(),
            room: crate::models::token_room(key.token()),
            sessions: sessions.iter().map(SessionId::as_uuid).collect(),
        }
    }
}

/// Current interest table
#[derive(Debug, Serialize, ToSchema)]
pub struct SubscriptionsResponse {
    pub registry: RegistryStats,
    pub fanout: FanoutStats,
    pub instruments: Vec<SubscriptionEntry>,
}

/// Error response
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
