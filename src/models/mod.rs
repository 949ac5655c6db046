pub mod credentials;
pub mod feed;
pub mod instrument;
pub mod session;
pub mod tick;

pub use credentials::UpstreamCredentials;
pub use feed::{FeedState, FeedStatus, HealthState, HealthStatus};
pub use instrument::{ExchangeCode, InstrumentKey};
pub use session::{Rejection, SessionId, SubscribeReport, SubscribeRequest};
pub use tick::{token_room, MarketUpdate, Tick};
