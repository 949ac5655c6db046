//! Upstream wire protocol
//!
//! `binary` decodes inbound tick frames, `control` builds the JSON
//! subscribe/unsubscribe instructions sent back to the broker.

pub mod binary;
pub mod control;

pub use binary::{decode, decode_at, encode_frame, MIN_FRAME_LEN, OHLC_FRAME_LEN};
pub use control::{ControlRequest, SubscriptionAction, DEFAULT_MODE};
