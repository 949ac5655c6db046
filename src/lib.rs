// Library Crate Root
// lib.rs

// main.rs and the integration tests import through lib.rs like an external crate
pub mod api;
pub mod config;
pub mod errors;
pub mod fanout;
pub mod feed;
pub mod models;
pub mod protocol;
pub mod session;
pub mod subscription;
pub mod websocket;

// pub use = re-export at crate root
pub use api::{create_router, AppState};
pub use config::{FeedConfig, ReconnectConfig, RelayConfig};
pub use errors::{DecodeError, DeliveryError, FeedError, SubscriptionError};
pub use fanout::FanoutBroadcaster;
pub use feed::{FeedHandle, UpstreamControl, UpstreamFeedConnection, WsConnector};
pub use models::{InstrumentKey, MarketUpdate, SessionId, Tick, UpstreamCredentials};
pub use session::SessionSubscriptionHandler;
pub use subscription::SubscriptionRegistry;
