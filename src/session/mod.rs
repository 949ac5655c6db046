pub mod handler;

pub use handler::{parse_request, SessionSubscriptionHandler};
