//! Publishes the device's capability set and consumes the server's
//! acknowledgement (spec §3 `capabilities_publish`/`capabilities_acknowledge`
//! topics, SPEC_FULL §4). The capability negotiation *schema* itself is a
//! non-goal (spec §1); only the publish/ack exchange is in scope, so the
//! payload here is the minimal shape needed to exercise it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::message::{JsonMessage, Message};
use crate::mqtt::MqttTransport;
use crate::services::Services;
use crate::topic::Topic;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitiesPublishPayload {
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CapabilitiesAcknowledgePayload {
    #[serde(default)]
    pub accepted: bool,
}

/// `CapabilitiesPublish` and `CapabilitiesAcknowledge` are both published/
/// received directly by this manager rather than through the Regulator:
/// `CapabilitiesPublish` is unencrypted (spec §3), so it bypasses the
/// Emitter's AEAD step the same way `ConnectionFromClient` does.
pub struct CapabilitiesManager {
    transport: Arc<dyn MqttTransport>,
    services: Arc<Services>,
    topic_root: String,
    acknowledged: AtomicBool,
}

impl CapabilitiesManager {
    pub fn new(transport: Arc<dyn MqttTransport>, services: Arc<Services>, topic_root: impl Into<String>) -> Self {
        CapabilitiesManager { transport, services, topic_root: topic_root.into(), acknowledged: AtomicBool::new(false) }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::Acquire)
    }

    /// Publishes the device's capability set. Called once at startup after
    /// the connection handshake completes.
    pub fn publish(&self, capabilities: Vec<String>) -> Result<(), crate::error::CoreError> {
        let payload = CapabilitiesPublishPayload { capabilities };
        let json_payload = serde_json::to_value(&payload).expect("CapabilitiesPublishPayload always serializes");
        let message = JsonMessage::new("CapabilitiesPublish", self.services.ids.next_id(), Some(json_payload));
        let full_topic = format!("{}/{}", self.topic_root, Topic::CapabilitiesPublish.suffix());
        self.transport.publish(&full_topic, &Message::Json(message).serialize())
    }

    /// Consumes a decoded `CapabilitiesAcknowledge` message (spec §4.6: the
    /// dispatcher routes it to the handler registered under this name,
    /// exactly like a directive).
    pub fn handle_acknowledge(&self, payload: Option<serde_json::Value>) {
        let accepted = payload
            .and_then(|v| serde_json::from_value::<CapabilitiesAcknowledgePayload>(v).ok())
            .map(|p| p.accepted)
            .unwrap_or(false);
        self.acknowledged.store(accepted, Ordering::Release);
    }
}
