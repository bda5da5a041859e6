//! In-process broker over a channel.

use super::{Broker, BrokerError};
use crossbeam_channel::{Receiver, Sender};
use serde_json::{Map, Value};

/// One message handed to a [`ChannelBroker`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

/// Broker delivering to an in-process receiver.
///
/// Publishing fails with `Disconnected` once the receiver is dropped.
#[derive(Debug, Clone)]
pub struct ChannelBroker {
    sender: Sender<Delivery>,
}

impl ChannelBroker {
    pub fn unbounded() -> (Self, Receiver<Delivery>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { sender }, receiver)
    }

    /// A broker whose publish blocks while `capacity` deliveries are unread.
    pub fn bounded(capacity: usize) -> (Self, Receiver<Delivery>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        (Self { sender }, receiver)
    }
}

impl Broker for ChannelBroker {
    fn publish(
        &self,
        topic: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<(), BrokerError> {
        self.sender
            .send(Delivery {
                topic: topic.to_string(),
                args: args.to_vec(),
                kwargs: kwargs.clone(),
            })
            .map_err(|_| BrokerError::Disconnected)
    }
}
