pub mod connection;
pub mod memory;
pub mod reconnect;
pub mod transport;

pub use connection::{FeedCommand, FeedHandle, UpstreamControl, UpstreamFeedConnection};
pub use memory::{MemoryBroker, MemoryConnection, MemoryConnector};
pub use reconnect::{ReconnectPolicy, RetryReason};
pub use transport::{FeedConnector, FeedFrame, FeedTransport, WsConnector};
