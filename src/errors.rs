//! Error types for the relay
//!
//! One enum per failure class. None of them is fatal: each path degrades to
//! "retry later" or "drop and continue".
//!
//! # Error Categories
//!
//! - **DecodeError**: malformed or short upstream frame, dropped and counted
//! - **FeedError**: upstream connect/transport failure (retried on the reconnect
//!   policy) or an instruction the feed cannot express
//! - **SubscriptionError**: bad request item from a session, rejected alone
//! - **DeliveryError**: one session could not receive a tick, isolated

use thiserror::Error;

use crate::models::{ExchangeCode, SessionId};

/// Errors raised while decoding a binary tick frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Frame does not reach the end of the last-traded-price field
    #[error("Frame too short: {len} bytes, need at least {required}")]
    FrameTooShort { len: usize, required: usize },

    /// Token bytes are empty, non-ASCII or contain control characters
    #[error("Invalid token bytes: {0}")]
    InvalidToken(String),

    /// A field read fell outside the frame
    #[error("Field at offset {offset} out of range for {len}-byte frame")]
    OutOfRange { offset: usize, len: usize },
}

/// Errors raised by the upstream feed connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// No credentials have been supplied yet
    #[error("Upstream credentials missing")]
    MissingCredentials,

    /// The upstream URL could not be built from config and credentials
    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(String),

    /// Network or handshake failure while opening the connection
    #[error("Upstream connect failed: {0}")]
    Connect(String),

    /// Connection attempt exceeded the configured timeout
    #[error("Upstream connect timed out after {0}s")]
    ConnectTimeout(u64),

    /// Read or write failure on an open connection
    #[error("Upstream transport error: {0}")]
    Transport(String),

    /// The exchange has no `exchangeType` code on the upstream protocol
    #[error("Exchange {0} has no upstream exchange type mapping")]
    UnmappedExchange(ExchangeCode),

    /// Control message could not be serialized
    #[error("Control message encoding failed: {0}")]
    Encode(String),

    /// The feed task has stopped and no longer accepts commands
    #[error("Feed task is not running")]
    ChannelClosed,
}

impl FeedError {
    /// Returns true when the reconnect policy should simply try again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FeedError::Connect(_) | FeedError::ConnectTimeout(_) | FeedError::Transport(_)
        )
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Encode(err.to_string())
    }
}

/// A session's subscription request item was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// Exchange string is not one of the enumerated codes
    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),

    /// Exchange is known but the upstream feed cannot subscribe to it
    #[error("Exchange {0} is not supported by the upstream feed")]
    UnmappedExchange(ExchangeCode),

    /// Token is empty or malformed
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// The session is not attached to the fan-out transport
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),
}

impl SubscriptionError {
    /// Returns true if the client sent something we cannot accept
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SubscriptionError::UnknownExchange(_)
                | SubscriptionError::UnmappedExchange(_)
                | SubscriptionError::InvalidToken(_)
        )
    }
}

/// Fan-out to a single session failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Registry still lists the session but it has no attached sink
    #[error("No sink attached for session {0}")]
    SessionNotFound(SessionId),

    /// The session's receiver was dropped
    #[error("Session {0} is closed")]
    SessionClosed(SessionId),

    /// The session's queue is full; the update is dropped for that session
    #[error("Session {0} is lagging, queue full")]
    SessionLagging(SessionId),
}
