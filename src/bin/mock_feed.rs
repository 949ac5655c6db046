use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tick_relay::feed::{MemoryBroker, MemoryConnection, MemoryConnector};
use tick_relay::protocol::encode_frame;
use tick_relay::{
    create_router, AppState, FanoutBroadcaster, FeedConfig, RelayConfig, SubscriptionRegistry,
    UpstreamCredentials, UpstreamFeedConnection,
};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Apply one control message to the set of streamed tokens
fn apply_control(text: &str, prices: &mut HashMap<String, i32>) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        println!("⚠️  Ignoring malformed control message: {}", text);
        return;
    };

    let subscribe = value["action"].as_u64() == Some(1);
    let groups = value["params"]["tokenList"].as_array().cloned().unwrap_or_default();

    for group in groups {
        for token in group["tokens"].as_array().cloned().unwrap_or_default() {
            let Some(token) = token.as_str() else { continue };
            if subscribe {
                prices.entry(token.to_string()).or_insert(100_000);
                println!("➕ Streaming {}", token);
            } else {
                prices.remove(token);
                println!("➖ Stopped {}", token);
            }
        }
    }
}

/// Play the broker side of one connection until the relay closes it
async fn serve_connection(mut conn: MemoryConnection) {
    println!("🔗 Relay connected to mock feed");

    let mut prices: HashMap<String, i32> = HashMap::new();
    let mut ticker = interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            sent = conn.next_sent() => match sent {
                Some(text) => apply_control(&text, &mut prices),
                None => break,
            },
            _ = ticker.tick() => {
                for (token, price) in prices.iter_mut() {
                    // Random walk in paise, never below 1.00
                    let step: i32 = rand::rng().random_range(-50..=50);
                    *price = (*price + step).max(100);
                    let open = 100_000;
                    let frame = encode_frame(token, *price, Some([open, open.max(*price), open.min(*price), open]));
                    if !conn.send_binary(frame) {
                        return;
                    }
                }
            }
        }
    }

    println!("🔴 Relay closed the mock feed connection");
}

async fn run_broker(mut broker: MemoryBroker) {
    while let Some(conn) = broker.accept().await {
        tokio::spawn(serve_connection(conn));
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tick_relay=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("🚀 Starting Tick Relay with mock upstream feed (for Testing)\n");

    let config = RelayConfig {
        feed: FeedConfig {
            scheme: "ws".to_string(),
            host: "mock-feed".to_string(),
            ..FeedConfig::default()
        },
        ..RelayConfig::from_env()
    };

    let registry = Arc::new(SubscriptionRegistry::new());
    let (tick_tx, tick_rx) = mpsc::unbounded_channel();
    let broadcaster = FanoutBroadcaster::with_capacity(Arc::clone(&registry), config.session_buffer);
    broadcaster.spawn(tick_rx);

    let (connector, broker) = MemoryConnector::new();
    let (feed, feed_handle) = UpstreamFeedConnection::new(
        config.feed.clone(),
        Arc::clone(&registry),
        Arc::new(connector),
        tick_tx,
    );
    feed.spawn();

    println!("🎭 Starting mock broker...");
    let broker_handle = tokio::spawn(run_broker(broker));

    feed_handle.credentials_updated(UpstreamCredentials::new("mock-token", "MOCK01", "mock-key"))?;

    let app = create_router(AppState::new(
        registry,
        broadcaster,
        feed_handle,
        config.heartbeat_interval(),
    ));

    let addr = config.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("\n✅ Mock Relay Ready!");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("🌐 HTTP Server:    http://{}", addr);
    println!("📚 Swagger UI:     http://{}/swagger-ui", addr);
    println!("🔌 WebSocket:      ws://{}/ws", addr);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");

    println!("💡 Send subscribe message:\n");
    println!("    {{");
    println!("      \"action\": \"subscribe\",");
    println!("      \"tokens\": [{{\"token\": \"99926000\", \"exchange\": \"NSE\"}}]");
    println!("    }}\n");
    println!("📊 Every subscribed token ticks once per second starting at 1000.00");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");

    // Start the server
    let server_handle = tokio::spawn(async move { axum::serve(listener, app).await });

    // Wait for all tasks
    tokio::select! {
        _ = broker_handle => println!("Mock broker stopped"),
        result = server_handle => match result {
            Ok(Err(e)) => println!("Server stopped: {}", e),
            _ => println!("Server stopped"),
        },
    }

    Ok(())
}
