//! Encrypts Regulator frames and publishes them (spec §4.2, §6 wire frame).
//!
//! Only the two encrypted outbound topics (`Event`, `Microphone`) pass
//! through here; `ConnectionFromClient` and `CapabilitiesPublish` are
//! unencrypted and published directly by their owning manager.

use std::sync::Arc;

use crate::crypto::CryptoProvider;
use crate::error::CoreError;
use crate::message::Chunk;
use crate::mqtt::MqttTransport;
use crate::secret_manager::{KeyDirection, SecretManager};
use crate::topic::Topic;

/// Builds the encrypted wire frame and publishes it on behalf of the
/// Regulator's `on_emit` callback.
pub struct Emitter {
    crypto: Arc<dyn CryptoProvider>,
    secrets: Arc<SecretManager>,
    transport: Arc<dyn MqttTransport>,
    topic_root: String,
}

impl Emitter {
    pub fn new(
        crypto: Arc<dyn CryptoProvider>,
        secrets: Arc<SecretManager>,
        transport: Arc<dyn MqttTransport>,
        topic_root: impl Into<String>,
    ) -> Self {
        Emitter { crypto, secrets, transport, topic_root: topic_root.into() }
    }

    /// Packs `chunks` into the array-wrapped plaintext body for JSON topics,
    /// or concatenates raw records for binary topics, then encrypts and
    /// publishes under `sequence`.
    pub fn emit(&self, topic: Topic, sequence: u32, chunks: Vec<Chunk>) -> Result<(), CoreError> {
        if !topic.encrypted() {
            return Err(CoreError::Other(format!("{topic:?} is not an encrypted topic")));
        }

        let plaintext = self.pack_plaintext(topic, &chunks);
        let key = self.secrets.key_for(KeyDirection::Out, topic, sequence);
        let aad = sequence.to_le_bytes();
        let (iv, ciphertext_with_tag) = self
            .crypto
            .encrypt(&key, &aad, &plaintext)
            .map_err(|e| CoreError::CryptoFailure { topic, sequence, detail: e.to_string() })?;

        let mut frame = Vec::with_capacity(4 + iv.len() + ciphertext_with_tag.len());
        frame.extend_from_slice(&sequence.to_le_bytes());
        frame.extend_from_slice(&iv);
        frame.extend_from_slice(&ciphertext_with_tag);

        let full_topic = format!("{}/{}", self.topic_root, topic.suffix());
        self.transport.publish(&full_topic, &frame)
    }

    fn pack_plaintext(&self, topic: Topic, chunks: &[Chunk]) -> Vec<u8> {
        match topic.array_name() {
            Some(array_name) => {
                let mut out = format!(r#"{{"{array_name}":["#).into_bytes();
                for (i, chunk) in chunks.iter().enumerate() {
                    if i > 0 {
                        out.push(b',');
                    }
                    out.extend_from_slice(&chunk.message.serialize());
                }
                out.extend_from_slice(b"]}");
                out
            }
            None => {
                let mut out = Vec::new();
                for chunk in chunks {
                    out.extend_from_slice(&chunk.message.serialize());
                }
                out
            }
        }
    }
}
