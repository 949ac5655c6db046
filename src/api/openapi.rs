use utoipa::OpenApi;

use crate::api::handlers;
use crate::api::responses::*;
use crate::fanout::FanoutStats;
use crate::models::{
    ExchangeCode, FeedState, FeedStatus, HealthState, HealthStatus, InstrumentKey, MarketUpdate,
    Rejection, SubscribeReport, SubscribeRequest, UpstreamCredentials,
};
use crate::subscription::RegistryStats;

/// OpenAPI v1 document
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Tick Relay API",
        version = "1.0.0",
        description = "Market tick relay: one upstream broker feed fanned out to WebSocket subscribers",
        license(
            name = "MIT"
        )
    ),
    paths(
        handlers::update_credentials,
        handlers::get_feed_status,
        handlers::get_subscriptions,
        handlers::get_health,
    ),
    components(
        schemas(
            UpstreamCredentials,
            CredentialsAccepted,
            FeedState,
            FeedStatus,
            HealthState,
            HealthStatus,
            ExchangeCode,
            InstrumentKey,
            SubscribeRequest,
            SubscribeReport,
            Rejection,
            MarketUpdate,
            RegistryStats,
            FanoutStats,
            SubscriptionEntry,
            SubscriptionsResponse,
            ErrorResponse,
        )
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Feed", description = "Upstream feed lifecycle"),
        (name = "Subscriptions", description = "Instrument interest table"),
    )
)]
pub struct ApiDoc;
