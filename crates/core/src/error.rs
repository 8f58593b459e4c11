//! Error model.

use thiserror::Error;

/// Result type used across the workspace.
pub type ChangewatchResult<T> = Result<T, ChangewatchError>;

/// Error taxonomy for subscriptions, writes and configuration.
///
/// - `Connection` covers both the initial connect and a mid-stream drop.
/// - `Write` is scoped to a single write; it never aborts a batch.
/// - `SubscriptionClosed` is returned by any operation on a closed subscription.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChangewatchError {
    /// The store is unreachable or the connection dropped.
    #[error("connection error: {0}")]
    Connection(String),

    /// An individual write was rejected by the store.
    #[error("write rejected: {0}")]
    Write(String),

    /// The subscription was already closed.
    #[error("subscription closed")]
    SubscriptionClosed,

    /// A pipeline stage could not be compiled or evaluated.
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// A database/collection name failed validation.
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    /// A configuration value was missing or malformed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A document or event could not be converted.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Every scheduled write finished before enough matching events arrived.
    #[error("saw {seen} of {threshold} expected events before the writes ran out")]
    ThresholdNotReached { seen: u64, threshold: u64 },
}

impl ChangewatchError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn write(msg: impl Into<String>) -> Self {
        Self::Write(msg.into())
    }

    pub fn invalid_pipeline(msg: impl Into<String>) -> Self {
        Self::InvalidPipeline(msg.into())
    }

    pub fn invalid_namespace(msg: impl Into<String>) -> Self {
        Self::InvalidNamespace(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True for errors that end a subscription (no further events follow).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::SubscriptionClosed)
    }
}

impl From<serde_json::Error> for ChangewatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
