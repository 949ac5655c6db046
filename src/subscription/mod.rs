//! Subscription bookkeeping
//!
//! The registry maps instruments to interested sessions and defines which
//! instruments the upstream connection must keep subscribed.

pub mod registry;

pub use registry::{AddOutcome, RegistryStats, RemoveOutcome, SubscriptionRegistry};
