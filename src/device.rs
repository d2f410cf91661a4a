//! Wires the five core subsystems and the capability managers into one
//! concrete device instance (spec §2 data-flow diagrams, SPEC_FULL §2
//! "Device assembly type"). This is assembly, not new protocol surface:
//! every handler registered here just forwards a decoded directive to the
//! manager that already implements its behavior.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use serde::de::DeserializeOwned;

use crate::config::DeviceConfig;
use crate::directives::{
    CloseMicrophonePayload, CloseSpeakerPayload, ConnectionAckPayload, ConnectionDisconnectPayload, DeleteAlertPayload,
    OpenMicrophonePayload, OpenSpeakerPayload, RotateSecretPayload, SetAlertPayload, SetAlertVolumePayload,
    SetAttentionStatePayload, SetClockPayload, SetVolumePayload, DIRECTIVE_NAMES,
};
use crate::dispatcher::{Dispatcher, IncomingJson};
use crate::emitter::Emitter;
use crate::error::CoreError;
use crate::events::SecretRotatedPayload;
use crate::managers::alert::AlertManager;
use crate::managers::capabilities::CapabilitiesManager;
use crate::managers::clock::ClockManager;
use crate::managers::exception::ExceptionManager;
use crate::managers::microphone::MicrophoneManager;
use crate::managers::speaker::{PlayPcmCallback, SpeakerManager};
use crate::managers::ux::UxManager;
use crate::message::{Chunk, JsonMessage, Message};
use crate::mqtt::MqttTransport;
use crate::regulator::Regulator;
use crate::ring::DataStreamRing;
use crate::secret_manager::SecretManager;
use crate::services::Services;
use crate::topic::Topic;

/// One assembled device: every outbound topic's Regulator/Emitter pair, the
/// inbound Dispatcher, the SecretManager they share, and the capability
/// managers that produce and consume the directives/events named in §6.
pub struct Device {
    config: DeviceConfig,
    services: Arc<Services>,
    transport: Arc<dyn MqttTransport>,
    secrets: Arc<SecretManager>,
    regulator: Arc<Regulator>,
    dispatcher: Arc<Dispatcher>,
    mic_ring: Arc<DataStreamRing>,
    pub speaker: Arc<SpeakerManager>,
    pub microphone: Arc<MicrophoneManager>,
    pub clock: Arc<ClockManager>,
    pub alert: Arc<AlertManager>,
    pub ux: Arc<UxManager>,
    pub exception: Arc<ExceptionManager>,
    pub capabilities: Arc<CapabilitiesManager>,
}

impl Device {
    /// Builds a device over `transport`, with `play_pcm` as the injected
    /// speaker sink (platform audio output is out of scope, spec §1 — only
    /// the callback boundary is).
    pub fn new(config: DeviceConfig, transport: Arc<dyn MqttTransport>, services: Arc<Services>, play_pcm: Arc<PlayPcmCallback>) -> Arc<Self> {
        let initial_key = load_initial_key(&services);
        let secrets = Arc::new(SecretManager::new(initial_key));

        let emitter = Emitter::new(services.crypto.clone(), secrets.clone(), transport.clone(), config.topic_root.clone());
        let on_emit: Arc<crate::regulator::EmitCallback> = Arc::new(move |topic, seq, chunks| emitter.emit(topic, seq, chunks));
        let regulator = Regulator::start(config.regulator.clone(), on_emit);

        let exception = Arc::new(ExceptionManager::new(regulator.clone(), services.clone()));
        let exception_for_dispatcher = exception.clone();
        let on_exception: Arc<crate::dispatcher::ExceptionHandler> = Arc::new(move |err, topic, _seq| {
            exception_for_dispatcher.report_dispatch_error(err, topic);
        });
        let dispatcher = Dispatcher::new(config.topic_root.clone(), services.crypto.clone(), secrets.clone(), config.sequencer.clone(), on_exception);

        let mic_ring = DataStreamRing::new(config.ring.capacity_bytes);
        let speaker = SpeakerManager::start(config.ring.capacity_bytes, regulator.clone(), services.clone(), play_pcm);
        let microphone = MicrophoneManager::start(mic_ring.clone(), regulator.clone(), services.clone(), config.ring.sample_rate_hz);
        let clock = Arc::new(ClockManager::new(regulator.clone(), services.clone()));
        let alert = Arc::new(AlertManager::new(regulator.clone(), services.clone()));
        let ux = Arc::new(UxManager::new());
        let capabilities = Arc::new(CapabilitiesManager::new(transport.clone(), services.clone(), config.topic_root.clone()));

        dispatcher.register_binary(Topic::Speaker, {
            let speaker = speaker.clone();
            Arc::new(move |msg, seq, index| speaker.on_frame(msg, seq, index))
        });

        let device = Arc::new(Device {
            config,
            services,
            transport,
            secrets,
            regulator,
            dispatcher,
            mic_ring,
            speaker,
            microphone,
            clock,
            alert,
            ux,
            exception,
            capabilities,
        });
        device.register_directives();
        device
    }

    fn register_directives(self: &Arc<Self>) {
        let d = self.clone();
        self.dispatcher.register_directive("SetVolume", Arc::new(move |msg| {
            let payload: SetVolumePayload = parse_payload(&msg, Topic::Directive)?;
            d.speaker.set_volume(payload.volume);
            Ok(())
        }));

        let d = self.clone();
        self.dispatcher.register_directive("OpenSpeaker", Arc::new(move |msg| {
            let payload: OpenSpeakerPayload = parse_payload(&msg, Topic::Directive)?;
            tracing::debug!(offset = payload.offset, "OpenSpeaker");
            d.speaker.on_speaker_ready();
            Ok(())
        }));

        let d = self.clone();
        self.dispatcher.register_directive("CloseSpeaker", Arc::new(move |msg| {
            let _: CloseSpeakerPayload = parse_payload_or_default(&msg);
            d.speaker.stop_playback();
            Ok(())
        }));

        let d = self.clone();
        self.dispatcher.register_directive("OpenMicrophone", Arc::new(move |msg| {
            let payload: OpenMicrophonePayload = parse_payload(&msg, Topic::Directive)?;
            d.microphone.hold_to_talk(payload.offset.unwrap_or(0));
            d.ux.observe_microphone_state(d.microphone.state());
            Ok(())
        }));

        let d = self.clone();
        self.dispatcher.register_directive("CloseMicrophone", Arc::new(move |msg| {
            let _: CloseMicrophonePayload = parse_payload_or_default(&msg);
            d.microphone.close();
            d.ux.observe_microphone_state(d.microphone.state());
            Ok(())
        }));

        let d = self.clone();
        self.dispatcher.register_directive("SetAlert", Arc::new(move |msg| {
            let payload: SetAlertPayload = parse_payload(&msg, Topic::Directive)?;
            d.alert.handle_set_alert(payload);
            Ok(())
        }));

        let d = self.clone();
        self.dispatcher.register_directive("DeleteAlert", Arc::new(move |msg| {
            let payload: DeleteAlertPayload = parse_payload(&msg, Topic::Directive)?;
            d.alert.handle_delete_alert(payload);
            Ok(())
        }));

        let d = self.clone();
        self.dispatcher.register_directive("SetAlertVolume", Arc::new(move |msg| {
            let payload: SetAlertVolumePayload = parse_payload(&msg, Topic::Directive)?;
            d.alert.handle_set_alert_volume(payload);
            Ok(())
        }));

        let d = self.clone();
        self.dispatcher.register_directive("SetAttentionState", Arc::new(move |msg| {
            let payload: SetAttentionStatePayload = parse_payload(&msg, Topic::Directive)?;
            d.ux.handle_set_attention_state(payload);
            Ok(())
        }));

        let d = self.clone();
        self.dispatcher.register_directive("SetClock", Arc::new(move |msg| {
            let payload: SetClockPayload = parse_payload(&msg, Topic::Directive)?;
            d.clock.handle_set_clock(payload);
            Ok(())
        }));

        let d = self.clone();
        self.dispatcher.register_directive("RotateSecret", Arc::new(move |msg| handle_rotate_secret(&d, msg)));

        self.dispatcher.register_directive("Exception", Arc::new(move |msg| {
            tracing::warn!(payload = ?msg.payload, "server reported an exception");
            Ok(())
        }));

        let d = self.clone();
        self.dispatcher.register_directive("CapabilitiesAcknowledge", Arc::new(move |msg| {
            d.capabilities.handle_acknowledge(msg.payload);
            Ok(())
        }));

        self.dispatcher.register_directive("Connected", Arc::new(move |msg| {
            let payload: ConnectionAckPayload = parse_payload(&msg, Topic::ConnectionFromService)?;
            tracing::info!(reason = ?payload.reason, "connection established");
            Ok(())
        }));

        self.dispatcher.register_directive("Disconnected", Arc::new(move |msg| {
            let payload: ConnectionDisconnectPayload = parse_payload(&msg, Topic::ConnectionFromService)?;
            tracing::warn!(reason = ?payload.reason, "service disconnected device");
            Ok(())
        }));

        debug_assert!(DIRECTIVE_NAMES.iter().all(|name| self.dispatcher.has_directive(name)));
    }

    /// Entry point from the MQTT transport's subscribe callback.
    pub fn handle_inbound(&self, full_topic: &str, payload: &[u8]) -> Result<(), CoreError> {
        self.dispatcher.handle_inbound(full_topic, payload)
    }

    /// Publishes the unencrypted registration handshake message on
    /// `connection_from_client` (spec §3: `ConnectionFromClient` is
    /// unencrypted, outbound). The HTTPS exchange that obtains the topic
    /// root and shared secret is out of scope, per §1 — only this
    /// handshake message is.
    pub fn connect(&self) -> Result<(), CoreError> {
        let message = Message::Json(JsonMessage::new("Connect", self.services.ids.next_id(), None));
        let full_topic = format!("{}/{}", self.config.topic_root, Topic::ConnectionFromClient.suffix());
        self.transport.publish(&full_topic, &message.serialize())
    }

    /// The ring an external audio-capture source writes 16 kHz PCM into
    /// (spec §2 "Microphone audio" data flow; the capture callback itself
    /// is out of scope, per §1).
    pub fn microphone_ring(&self) -> Arc<DataStreamRing> {
        self.mic_ring.clone()
    }

    pub fn shutdown(&self) {
        self.microphone.shutdown();
        self.speaker.shutdown();
        self.regulator.shutdown();
    }
}

fn load_initial_key(services: &Services) -> [u8; 32] {
    match services.secrets.load() {
        Ok(Some(bytes)) if bytes.len() == 32 => {
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            key
        }
        Ok(Some(bytes)) => {
            tracing::warn!(len = bytes.len(), "persisted secret has unexpected length, starting from a zero key");
            [0u8; 32]
        }
        Ok(None) => [0u8; 32],
        Err(e) => {
            tracing::warn!(error = %e, "failed to load persisted secret, starting from a zero key");
            [0u8; 32]
        }
    }
}

fn parse_payload<T: DeserializeOwned>(msg: &IncomingJson, topic: Topic) -> Result<T, CoreError> {
    let value = msg.payload.clone().unwrap_or(serde_json::Value::Null);
    serde_json::from_value(value).map_err(|e| CoreError::MalformedMessage {
        topic,
        sequence: msg.sequence,
        index: msg.index,
        detail: e.to_string(),
    })
}

/// For directives whose payload is optional and carries no required
/// fields: an absent or malformed payload is treated as the default rather
/// than a protocol error.
fn parse_payload_or_default<T: DeserializeOwned + Default>(msg: &IncomingJson) -> T {
    msg.payload
        .clone()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

fn handle_rotate_secret(device: &Arc<Device>, msg: IncomingJson) -> Result<(), CoreError> {
    let payload: RotateSecretPayload = parse_payload(&msg, Topic::Directive)?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&payload.new_secret)
        .map_err(|e| CoreError::RotationFailure(format!("invalid base64 newSecret: {e}")))?;
    if decoded.len() != 32 {
        return Err(CoreError::RotationFailure(format!("newSecret is {} bytes, expected 32", decoded.len())));
    }
    let mut new_key = [0u8; 32];
    new_key.copy_from_slice(&decoded);

    device
        .services
        .secrets
        .save(&new_key)
        .map_err(|e| CoreError::RotationFailure(format!("persisting rotated secret failed: {e}")))?;

    let mut boundaries = HashMap::new();
    boundaries.insert(Topic::Directive, payload.directive_sequence_number);
    boundaries.insert(Topic::Speaker, payload.speaker_sequence_number);
    boundaries.insert(Topic::Event, payload.event_sequence_number);
    boundaries.insert(Topic::Microphone, payload.microphone_sequence_number);
    device.secrets.rotate_all(new_key, boundaries).map_err(|e| CoreError::RotationFailure(e.to_string()))?;

    let event_payload = SecretRotatedPayload {
        event_sequence_number: payload.event_sequence_number,
        microphone_sequence_number: Some(payload.microphone_sequence_number),
    };
    let json_payload = serde_json::to_value(&event_payload).expect("SecretRotatedPayload always serializes");
    let message = Message::Json(JsonMessage::new("SecretRotated", device.services.ids.next_id(), Some(json_payload)));
    if let Err(e) = device.regulator.push(Topic::Event, Chunk::new(message)) {
        tracing::error!(error = %e, "failed to enqueue SecretRotated event");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::ChannelMqttTransport;

    fn device() -> (Arc<Device>, crossbeam_channel::Receiver<crate::mqtt::InboundPublish>) {
        let (transport, rx) = ChannelMqttTransport::new();
        let transport: Arc<dyn MqttTransport> = Arc::new(transport);
        let mut config = DeviceConfig::default();
        config.topic_root = "devices/abc123".to_string();
        config.regulator.min_emit_interval_ms = 1;
        let services = Arc::new(Services::production());
        let device = Device::new(config, transport, services, Arc::new(|_| {}));
        (device, rx)
    }

    #[test]
    fn connect_publishes_on_connection_from_client() {
        let (device, rx) = device();
        device.connect().unwrap();
        let published = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(published.topic, "devices/abc123/connection/fromclient");
        device.shutdown();
    }

    #[test]
    fn set_volume_directive_reaches_speaker_manager() {
        let (device, _rx) = device();
        let msg = IncomingJson {
            name: "SetVolume".to_string(),
            message_id: crate::message::MessageId::parse("aaaaaaaa").unwrap(),
            payload: Some(serde_json::json!({"volume": 7})),
            sequence: 0,
            index: 0,
        };
        device.dispatcher.invoke_directive("SetVolume", msg).unwrap();
        assert_eq!(device.speaker.volume(), 7);
        device.shutdown();
    }

    #[test]
    fn rotate_secret_stages_rotation_and_emits_secret_rotated() {
        let (device, rx) = device();
        let new_key = [0x42u8; 32];
        let encoded = base64::engine::general_purpose::STANDARD.encode(new_key);
        let msg = IncomingJson {
            name: "RotateSecret".to_string(),
            message_id: crate::message::MessageId::parse("aaaaaaaa").unwrap(),
            payload: Some(serde_json::json!({
                "newSecret": encoded,
                "directiveSequenceNumber": 5,
                "speakerSequenceNumber": 5,
                "eventSequenceNumber": 2,
                "microphoneSequenceNumber": 2,
            })),
            sequence: 4,
            index: 0,
        };
        device.dispatcher.invoke_directive("RotateSecret", msg).unwrap();

        let published = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(published.topic, "devices/abc123/event");
        device.shutdown();
    }
}
