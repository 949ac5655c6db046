use axum::{
    routing::{get, post},
    Router,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::websocket::websocket_handler;

use super::handlers::*;
use super::openapi::ApiDoc;

/// Create the API router with Swagger UI and WebSocket support
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/v1/openapi.json", ApiDoc::openapi()))
        // Downstream session transport
        .route("/ws", get(websocket_handler))
        .route("/api/v1/health", get(get_health))
        // Credential collaborator
        .route("/api/v1/credentials", post(update_credentials))
        .route("/api/v1/feed/status", get(get_feed_status))
        .route("/api/v1/subscriptions", get(get_subscriptions))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeedConfig;
    use crate::fanout::FanoutBroadcaster;
    use crate::feed::{MemoryConnector, UpstreamFeedConnection};
    use crate::models::{ExchangeCode, InstrumentKey, SessionId};
    use crate::subscription::SubscriptionRegistry;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    /// State over a feed task that is never spawned, so commands just queue
    fn test_state() -> (AppState, UpstreamFeedConnection) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let broadcaster = FanoutBroadcaster::new(Arc::clone(&registry));
        let (connector, _broker) = MemoryConnector::new();
        let (tick_tx, _tick_rx) = mpsc::unbounded_channel();
        let (feed, handle) = UpstreamFeedConnection::new(
            FeedConfig::default(),
            Arc::clone(&registry),
            Arc::new(connector),
            tick_tx,
        );

        let state = AppState::new(registry, broadcaster, handle, Duration::from_secs(30));
        (state, feed)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_without_credentials() {
        let (state, _feed) = test_state();
        let app = create_router(state);

        let response = app
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["feed_state"], "credentials_missing");
    }

    #[tokio::test]
    async fn test_post_credentials() {
        let (state, _feed) = test_state();
        let app = create_router(state);

        let request = Request::post("/api/v1/credentials")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"feed_token":"tok","clientCode":"A123","api_key":"key"}"#,
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = body_json(response).await;
        assert_eq!(json["client_code"], "A123");
    }

    #[tokio::test]
    async fn test_post_incomplete_credentials() {
        let (state, _feed) = test_state();
        let app = create_router(state);

        let request = Request::post("/api/v1/credentials")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"feed_token":"","client_code":"A123","api_key":"key"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "invalid_credentials");
    }

    #[tokio::test]
    async fn test_post_credentials_feed_stopped() {
        let (state, feed) = test_state();
        drop(feed);
        let app = create_router(state);

        let request = Request::post("/api/v1/credentials")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"feed_token":"tok","client_code":"A123","api_key":"key"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_subscriptions_listing() {
        let (state, _feed) = test_state();
        let session = SessionId::new();
        let _updates = state.sessions.on_connect(session);
        state.registry.add_interest(
            InstrumentKey::new(ExchangeCode::Nse, "99926000").unwrap(),
            session,
        );
        let app = create_router(state);

        let response = app
            .oneshot(Request::get("/api/v1/subscriptions").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let json = body_json(response).await;
        assert_eq!(json["registry"]["instrument_count"], 1);
        assert_eq!(json["fanout"]["session_count"], 1);
        assert_eq!(json["instruments"][0]["room"], "TOKEN:99926000");
        assert_eq!(json["instruments"][0]["sessions"][0], session.to_string());
    }

    #[tokio::test]
    async fn test_feed_status() {
        let (state, _feed) = test_state();
        let app = create_router(state);

        let response = app
            .oneshot(Request::get("/api/v1/feed/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["connected"], false);
        assert_eq!(json["connections"], 0);
    }
}
