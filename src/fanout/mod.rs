pub mod broadcaster;

pub use broadcaster::{FanoutBroadcaster, FanoutStats};
