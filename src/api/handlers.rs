use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::FeedError;
use crate::fanout::FanoutBroadcaster;
use crate::feed::FeedHandle;
use crate::models::{FeedState, FeedStatus, HealthState, HealthStatus, UpstreamCredentials};
use crate::session::SessionSubscriptionHandler;
use crate::subscription::SubscriptionRegistry;

use super::responses::*;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SubscriptionRegistry>,
    pub broadcaster: FanoutBroadcaster,
    pub feed: FeedHandle,
    pub sessions: Arc<SessionSubscriptionHandler>,
    /// Downstream WebSocket heartbeat interval
    pub heartbeat: Duration,
}

impl AppState {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        broadcaster: FanoutBroadcaster,
        feed: FeedHandle,
        heartbeat: Duration,
    ) -> Self {
        let sessions = Arc::new(SessionSubscriptionHandler::new(
            Arc::clone(&registry),
            broadcaster.clone(),
            Arc::new(feed.clone()),
        ));

        Self {
            registry,
            broadcaster,
            feed,
            sessions,
            heartbeat,
        }
    }
}

/// HTTP-facing errors
#[derive(Debug)]
pub enum ApiError {
    InvalidCredentials(String),
    FeedUnavailable(String),
}

impl From<FeedError> for ApiError {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::MissingCredentials => ApiError::InvalidCredentials(err.to_string()),
            other => ApiError::FeedUnavailable(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::InvalidCredentials(msg) => (StatusCode::BAD_REQUEST, "invalid_credentials", msg),
            ApiError::FeedUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "feed_unavailable", msg),
        };

        let error_response = ErrorResponse {
            error: error_type.to_string(),
            message,
        };

        (status, Json(error_response)).into_response()
    }
}

/// Replace the upstream credentials
///
/// Acts as the credential collaborator: the feed reconnects with the new
/// credentials, abandoning any live connection or pending retry.
#[utoipa::path(
    post,
    path = "/api/v1/credentials",
    request_body = UpstreamCredentials,
    responses(
        (status = 202, description = "Credentials accepted, feed reconnecting", body = CredentialsAccepted),
        (status = 400, description = "Incomplete credentials", body = ErrorResponse),
        (status = 503, description = "Feed task not running", body = ErrorResponse),
    ),
    tag = "Feed"
)]
pub async fn update_credentials(
    State(state): State<AppState>,
    Json(credentials): Json<UpstreamCredentials>,
) -> Result<(StatusCode, Json<CredentialsAccepted>), ApiError> {
    let client_code = credentials.client_code.clone();
    state.feed.credentials_updated(credentials)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CredentialsAccepted {
            status: "accepted".to_string(),
            client_code,
            message: "Credentials updated, upstream feed reconnecting".to_string(),
        }),
    ))
}

/// Get upstream feed status
#[utoipa::path(
    get,
    path = "/api/v1/feed/status",
    responses(
        (status = 200, description = "Current upstream feed status", body = FeedStatus),
    ),
    tag = "Feed"
)]
pub async fn get_feed_status(State(state): State<AppState>) -> Json<FeedStatus> {
    Json(state.feed.status())
}

/// List instruments subscribed upstream and the sessions behind them
#[utoipa::path(
    get,
    path = "/api/v1/subscriptions",
    responses(
        (status = 200, description = "Current interest table", body = SubscriptionsResponse),
    ),
    tag = "Subscriptions"
)]
pub async fn get_subscriptions(State(state): State<AppState>) -> Json<SubscriptionsResponse> {
    let instruments = state
        .registry
        .snapshot()
        .iter()
        .map(|(key, sessions)| SubscriptionEntry::new(key, sessions))
        .collect();

    Json(SubscriptionsResponse {
        registry: state.registry.stats(),
        fanout: state.broadcaster.stats(),
        instruments,
    })
}

/// Get relay health
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Relay health status", body = HealthStatus),
    ),
    tag = "Health"
)]
pub async fn get_health(State(state): State<AppState>) -> Json<HealthStatus> {
    let feed_state = state.feed.state();

    let (status, warning) = match feed_state {
        FeedState::Connected => (HealthState::Healthy, None),
        FeedState::CredentialsMissing => (
            HealthState::Unhealthy,
            Some("Upstream credentials missing".to_string()),
        ),
        FeedState::Disconnected | FeedState::Connecting | FeedState::Closing => (
            HealthState::Degraded,
            Some("Upstream feed not connected".to_string()),
        ),
    };

    Json(HealthStatus {
        status,
        feed_state,
        sessions: state.broadcaster.stats().session_count,
        instruments: state.registry.stats().instrument_count,
        warning,
        timestamp: Utc::now().to_rfc3339(),
    })
}
