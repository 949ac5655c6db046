use std::sync::Arc;
use tick_relay::{
    create_router, AppState, FanoutBroadcaster, RelayConfig, SubscriptionRegistry,
    UpstreamCredentials, UpstreamFeedConnection, WsConnector,
};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tick_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::from_env();

    // Interest table shared by the handler, feed and broadcaster
    let registry = Arc::new(SubscriptionRegistry::new());

    // Fan-out loop drains decoded ticks from the feed
    let (tick_tx, tick_rx) = mpsc::unbounded_channel();
    let broadcaster = FanoutBroadcaster::with_capacity(Arc::clone(&registry), config.session_buffer);
    let fanout_task = broadcaster.spawn(tick_rx);

    // Single upstream connection owner
    let (feed, feed_handle) = UpstreamFeedConnection::new(
        config.feed.clone(),
        Arc::clone(&registry),
        Arc::new(WsConnector::new()),
        tick_tx,
    );
    let feed_task = feed.spawn();

    match UpstreamCredentials::from_env() {
        Some(credentials) => {
            tracing::info!("🔑 Using upstream credentials from environment");
            feed_handle.credentials_updated(credentials)?;
        }
        None => {
            tracing::warn!("⚠️  FEED_TOKEN/FEED_CLIENT_CODE/FEED_API_KEY not set, waiting for POST /api/v1/credentials");
            feed_handle.credential_fetch_failed("credentials not present in environment")?;
        }
    }

    let state = AppState::new(
        registry,
        broadcaster,
        feed_handle.clone(),
        config.heartbeat_interval(),
    );
    let app = create_router(state);

    let addr = config.bind_addr.as_str();
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("🚀 Tick relay running on http://{}", addr);
    tracing::info!("📊 Health check: http://{}/api/v1/health", addr);
    tracing::info!("📚 Swagger UI: http://{}/swagger-ui", addr);
    tracing::info!("🔌 WebSocket: ws://{}/ws", addr);
    tracing::info!("");
    tracing::info!("📡 WebSocket Subscription Example:");
    tracing::info!(r#"   {{"action":"subscribe","tokens":[{{"token":"99926000","exchange":"NSE"}}]}}"#);
    tracing::info!("");

    // Start the server
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("🛑 Server stopped, closing upstream feed");
    if let Err(e) = feed_handle.shutdown() {
        tracing::warn!("Feed already stopped: {}", e);
    }
    feed_task.await?;
    fanout_task.await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("🛑 Ctrl-C received, shutting down");
}
