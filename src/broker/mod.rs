//! Outbound delivery to the real-time broker.
//!
//! The bus hands every envelope to a [`Broker`], which fans it out to
//! connected clients. Delivery is best effort: a failed publish leaves the
//! envelope pending in history and it is redelivered by a later flush.

mod channel;
mod http;

pub use channel::{ChannelBroker, Delivery};
pub use http::HttpBroker;

use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Why a broker publish failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("broker answered with status {0}")]
    Status(u16),

    #[error("broker is disconnected")]
    Disconnected,
}

/// Publishes one message to subscribers of a topic.
pub trait Broker: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<(), BrokerError>;
}

impl<B: Broker + ?Sized> Broker for Arc<B> {
    fn publish(
        &self,
        topic: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<(), BrokerError> {
        (**self).publish(topic, args, kwargs)
    }
}
