//! Error types for the event bus.

use crate::broker::BrokerError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Timed out after {waited:?} waiting for lock {name}")]
    LockTimeout { name: String, waited: Duration },

    #[error("Lock {0} is no longer held by this holder")]
    LockNotHeld(String),

    #[error("Invalid topic rule {pattern:?}: {reason}")]
    InvalidTopicRule { pattern: String, reason: String },

    #[error("Keyword argument {0:?} is reserved for routing metadata")]
    ReservedKwarg(String),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Background task failed: {0}")]
    TaskJoin(String),
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BusError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BusError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BusError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BusError::Deserialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for BusError {
    fn from(e: tokio::task::JoinError) -> Self {
        BusError::TaskJoin(e.to_string())
    }
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
