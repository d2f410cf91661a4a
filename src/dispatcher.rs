//! Demuxes inbound topic traffic to directive handlers and manager events
//! (spec §4.6). Each encrypted inbound topic gets its own [`Sequencer`] so a
//! stalled Directive stream can't hold up Speaker audio or vice versa.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde_json::Value;

use crate::config::SequencerConfig;
use crate::crypto::CryptoProvider;
use crate::error::CoreError;
use crate::message::{BinaryMessage, MessageId};
use crate::secret_manager::{KeyDirection, SecretManager};
use crate::sequencer::Sequencer;
use crate::topic::Topic;

/// One decoded inbound JSON message: a directive or a capabilities ack.
/// `sequence`/`index` identify its position in the frame so a handler that
/// rejects a malformed payload body can build the exact
/// `ExceptionEncountered` context the server expects (spec §7, §8 scenario
/// 5) without threading that context through by hand.
#[derive(Debug, Clone)]
pub struct IncomingJson {
    pub name: String,
    pub message_id: MessageId,
    pub payload: Option<Value>,
    pub sequence: u32,
    pub index: u32,
}

pub type JsonHandler = dyn Fn(IncomingJson) -> Result<(), CoreError> + Send + Sync;
pub type BinaryHandler = dyn Fn(BinaryMessage, u32, u32) + Send + Sync;
pub type ExceptionHandler = dyn Fn(CoreError, Topic, u32) + Send + Sync;

/// Demultiplexes decrypted, reordered inbound frames to registered
/// per-directive-name and per-topic handlers.
pub struct Dispatcher {
    topic_root: String,
    crypto: Arc<dyn CryptoProvider>,
    secrets: Arc<SecretManager>,
    sequencer_config: SequencerConfig,
    sequencers: DashMap<Topic, Arc<Sequencer<Vec<u8>>>>,
    directive_handlers: DashMap<String, Arc<JsonHandler>>,
    binary_handlers: DashMap<Topic, Arc<BinaryHandler>>,
    on_exception: Arc<ExceptionHandler>,
    self_ref: Weak<Dispatcher>,
}

impl Dispatcher {
    pub fn new(
        topic_root: impl Into<String>,
        crypto: Arc<dyn CryptoProvider>,
        secrets: Arc<SecretManager>,
        sequencer_config: SequencerConfig,
        on_exception: Arc<ExceptionHandler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Dispatcher {
            topic_root: topic_root.into(),
            crypto,
            secrets,
            sequencer_config,
            sequencers: DashMap::new(),
            directive_handlers: DashMap::new(),
            binary_handlers: DashMap::new(),
            on_exception,
            self_ref: weak.clone(),
        })
    }

    /// Registers the handler invoked when a JSON directive named `name`
    /// arrives on the `Directive` topic, or when `CapabilitiesAcknowledge`
    /// (whose single payload is treated as a directive named
    /// `"CapabilitiesAcknowledge"`) arrives.
    pub fn register_directive(&self, name: impl Into<String>, handler: Arc<JsonHandler>) {
        self.directive_handlers.insert(name.into(), handler);
    }

    /// Registers the handler invoked for each decoded binary record on
    /// `Speaker`.
    pub fn register_binary(&self, topic: Topic, handler: Arc<BinaryHandler>) {
        self.binary_handlers.insert(topic, handler);
    }

    /// `true` if a handler is registered under `name`. Used at startup to
    /// confirm every closed-enumeration directive name (spec §4.6) got a
    /// handler.
    pub fn has_directive(&self, name: &str) -> bool {
        self.directive_handlers.contains_key(name)
    }

    /// Invokes the handler registered for `already-decoded` message `msg`
    /// directly, bypassing decryption and sequencing. Useful for feeding a
    /// locally synthesized directive (or in tests) without round-tripping
    /// through an encrypted frame.
    pub fn invoke_directive(&self, name: &str, msg: IncomingJson) -> Result<(), CoreError> {
        let handler = self
            .directive_handlers
            .get(name)
            .ok_or_else(|| CoreError::UnsupportedApi { name: name.to_string(), sequence: msg.sequence, index: msg.index })?;
        handler(msg)
    }

    /// Entry point from the MQTT transport's subscribe callback: `full_topic`
    /// is the raw wire topic string, `payload` the raw bytes as published.
    pub fn handle_inbound(&self, full_topic: &str, payload: &[u8]) -> Result<(), CoreError> {
        let topic = Topic::from_full_topic(&self.topic_root, full_topic).ok_or_else(|| {
            CoreError::MalformedMessage { topic: Topic::Directive, sequence: 0, index: 0, detail: format!("unrecognized topic {full_topic}") }
        })?;

        if !topic.encrypted() {
            return self.deliver(topic, 0, payload.to_vec());
        }

        if payload.len() < 4 + 12 {
            return Err(CoreError::MalformedMessage { topic, sequence: 0, index: 0, detail: "frame shorter than header".to_string() });
        }
        let sequence = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        let sequencer = self.sequencer_for(topic);
        sequencer.accept(sequence, payload[4..].to_vec())
    }

    fn sequencer_for(&self, topic: Topic) -> Arc<Sequencer<Vec<u8>>> {
        self.sequencers
            .entry(topic)
            .or_insert_with(|| {
                let dispatcher = self.self_ref.upgrade().expect("dispatcher outlives its own sequencers");
                let deliver_dispatcher = dispatcher.clone();
                let on_deliver: Arc<dyn Fn(u32, Vec<u8>) + Send + Sync> = Arc::new(move |seq, body| {
                    if let Err(err) = deliver_dispatcher.deliver(topic, seq, body) {
                        (deliver_dispatcher.on_exception)(err, topic, seq);
                    }
                });
                let timeout_dispatcher = dispatcher.clone();
                let on_timeout: Arc<dyn Fn(u32) + Send + Sync> = Arc::new(move |next_expected| {
                    tracing::warn!(?topic, next_expected, "inbound sequencer gap timed out, skipping ahead");
                    if let Some(sequencer) = timeout_dispatcher.sequencers.get(&topic) {
                        sequencer.skip_to(next_expected.wrapping_add(1));
                    }
                });
                Sequencer::start(self.sequencer_config.clone(), 0, on_deliver, on_timeout)
            })
            .clone()
    }

    /// Decrypts (if needed) a reassembled in-order frame body and dispatches
    /// its contents.
    fn deliver(&self, topic: Topic, sequence: u32, body: Vec<u8>) -> Result<(), CoreError> {
        let plaintext = if topic.encrypted() {
            if body.len() < 12 {
                return Err(CoreError::MalformedMessage { topic, sequence, index: 0, detail: "frame missing IV".to_string() });
            }
            let iv: [u8; 12] = body[0..12].try_into().unwrap();
            let ciphertext = &body[12..];
            let key = self.secrets.key_for(KeyDirection::In, topic, sequence);
            let aad = sequence.to_le_bytes();
            self.crypto
                .decrypt(&key, &iv, &aad, ciphertext)
                .map_err(|e| CoreError::CryptoFailure { topic, sequence, detail: e.to_string() })?
        } else {
            body
        };

        match topic.attrs().kind {
            crate::topic::Kind::Binary => self.deliver_binary(topic, sequence, &plaintext),
            crate::topic::Kind::Json => self.deliver_json(topic, sequence, &plaintext),
        }
    }

    fn deliver_binary(&self, topic: Topic, sequence: u32, plaintext: &[u8]) -> Result<(), CoreError> {
        let handler = self.binary_handlers.get(&topic);
        let mut offset = 0usize;
        let mut index = 0u32;
        while offset < plaintext.len() {
            let (msg, consumed) = BinaryMessage::parse(&plaintext[offset..]).ok_or_else(|| CoreError::MalformedMessage {
                topic,
                sequence,
                index,
                detail: "truncated binary record".to_string(),
            })?;
            if let Some(handler) = handler.as_deref() {
                handler(msg, sequence, index);
            }
            offset += consumed;
            index += 1;
        }
        Ok(())
    }

    fn deliver_json(&self, topic: Topic, sequence: u32, plaintext: &[u8]) -> Result<(), CoreError> {
        let root: Value = serde_json::from_slice(plaintext)
            .map_err(|e| CoreError::MalformedMessage { topic, sequence, index: 0, detail: format!("invalid JSON: {e}") })?;

        let items: Vec<&Value> = match topic.array_name() {
            Some(array_name) => root
                .get(array_name)
                .and_then(Value::as_array)
                .ok_or_else(|| CoreError::MalformedMessage {
                    topic,
                    sequence,
                    index: 0,
                    detail: format!("missing \"{array_name}\" array"),
                })?
                .iter()
                .collect(),
            None => vec![&root],
        };

        // Spec §4.6 step 4: each element is independent. A malformed or
        // unsupported element reports its own exception and does not
        // prevent the remaining elements in the frame from dispatching.
        for (index, item) in items.iter().enumerate() {
            if let Err(err) = self.dispatch_one_json(topic, sequence, index as u32, item) {
                (self.on_exception)(err, topic, sequence);
            }
        }
        Ok(())
    }

    fn dispatch_one_json(&self, topic: Topic, sequence: u32, index: u32, item: &Value) -> Result<(), CoreError> {
        let name = item
            .get("header")
            .and_then(|h| h.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::MalformedMessage { topic, sequence, index, detail: "missing header.name".to_string() })?
            .to_string();
        let raw_id = item
            .get("header")
            .and_then(|h| h.get("messageId"))
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::MalformedMessage { topic, sequence, index, detail: "missing header.messageId".to_string() })?;
        let message_id = MessageId::parse(raw_id)
            .ok_or_else(|| CoreError::MalformedMessage { topic, sequence, index, detail: "malformed messageId".to_string() })?;
        let payload = item.get("payload").cloned();

        let handler = self
            .directive_handlers
            .get(&name)
            .ok_or_else(|| CoreError::UnsupportedApi { name: name.clone(), sequence, index })?;
        handler(IncomingJson { name, message_id, payload, sequence, index })
    }
}
