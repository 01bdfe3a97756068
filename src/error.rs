//! Caller-facing error taxonomy.
//!
//! Validation errors are reported synchronously by the call that introduced
//! them. A bounded receive that finds no message returns `Ok(None)`; the
//! timeout outcome is not an error.

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, BrokerError>;

/// One subscription's failure during topic fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutFailure {
    /// Name of the subscription whose append failed.
    pub subscription: String,
    /// Why the append failed.
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrokerError {
    #[error("entity '{0}' already exists")]
    EntityAlreadyExists(String),

    #[error("entity '{0}' does not exist")]
    EntityNotFound(String),

    #[error("invalid filter syntax: {0}")]
    InvalidFilterSyntax(String),

    #[error("lock token {0} is invalid or has expired")]
    LockLost(Uuid),

    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("invalid entity name '{0}'")]
    InvalidName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("entity '{0}' is at capacity")]
    QuotaExceeded(String),

    /// Topic dispatch appended to some subscriptions and failed on others.
    /// Appends are independent; nothing is rolled back.
    #[error(
        "topic fan-out partially failed: {} delivered, {} failed",
        .delivered.len(),
        .failed.len()
    )]
    PartialFanout {
        /// Subscriptions that received a copy.
        delivered: Vec<String>,
        /// Subscriptions whose append failed, with reasons.
        failed: Vec<FanoutFailure>,
    },
}
