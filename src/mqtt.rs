//! The MQTT transport boundary. The wire client itself is out of scope
//! (spec §1); the core only ever talks to this trait.

use crossbeam_channel::{Receiver, Sender};

use crate::error::CoreError;

/// A single received MQTT publish, handed to the [`crate::dispatcher::Dispatcher`].
#[derive(Debug, Clone)]
pub struct InboundPublish {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// What the core needs from an MQTT client: publish a payload to a topic,
/// nothing more. Connection lifecycle, QoS, and reconnect policy live
/// outside this boundary.
pub trait MqttTransport: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), CoreError>;
}

/// An in-process test double that records publishes and can also act as
/// the inbound side of a loopback channel.
pub struct ChannelMqttTransport {
    outbound: Sender<InboundPublish>,
}

impl ChannelMqttTransport {
    pub fn new() -> (Self, Receiver<InboundPublish>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (ChannelMqttTransport { outbound: tx }, rx)
    }
}

impl MqttTransport for ChannelMqttTransport {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), CoreError> {
        self.outbound
            .send(InboundPublish { topic: topic.to_string(), payload: payload.to_vec() })
            .map_err(|e| CoreError::PublishFailure(e.to_string()))
    }
}
