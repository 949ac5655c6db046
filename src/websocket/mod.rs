pub mod handler;
pub mod messages;

pub use handler::websocket_handler;
pub use messages::{ClientMessage, WsMessage, MARKET_UPDATE_EVENT};
