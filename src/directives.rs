//! Typed payloads for the closed set of directive names the Dispatcher
//! routes (spec §4.6, §6). One struct per directive; field names match the
//! wire JSON exactly since the server's schema is fixed, not negotiated.

use serde::{Deserialize, Serialize};

/// `OpenSpeaker` — `{"offset": u64}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSpeakerPayload {
    pub offset: u64,
}

/// `CloseSpeaker` — no payload fields beyond the envelope.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CloseSpeakerPayload {}

/// `OpenMicrophone` — server-initiated microphone open; carries the same
/// shape as the device-initiated `MicrophoneOpened` event request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenMicrophonePayload {
    #[serde(default)]
    pub offset: Option<u64>,
}

/// `CloseMicrophone` — no payload fields beyond the envelope.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CloseMicrophonePayload {}

/// `SetVolume` — `{"volume": u8, "offset": u64?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetVolumePayload {
    pub volume: u8,
    #[serde(default)]
    pub offset: Option<u64>,
}

/// `SetAlert` — `{"token","scheduledTime","durationInMilliseconds","type"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetAlertPayload {
    pub token: String,
    #[serde(rename = "scheduledTime")]
    pub scheduled_time: u64,
    #[serde(rename = "durationInMilliseconds")]
    pub duration_in_milliseconds: u32,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertType {
    #[serde(rename = "TIMER")]
    Timer,
    #[serde(rename = "ALARM")]
    Alarm,
    #[serde(rename = "REMINDER")]
    Reminder,
}

/// `DeleteAlert` — `{"token"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteAlertPayload {
    pub token: String,
}

/// `SetAlertVolume` — `{"volume"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetAlertVolumePayload {
    pub volume: u8,
}

/// `SetAttentionState` — `{"state","offset": u64?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetAttentionStatePayload {
    pub state: AttentionState,
    #[serde(default)]
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttentionState {
    #[serde(rename = "IDLE")]
    Idle,
    #[serde(rename = "THINKING")]
    Thinking,
    #[serde(rename = "SPEAKING")]
    Speaking,
    #[serde(rename = "ALERTING")]
    Alerting,
    #[serde(rename = "NOTIFICATION_AVAILABLE")]
    NotificationAvailable,
    #[serde(rename = "DO_NOT_DISTURB")]
    DoNotDisturb,
}

/// `RotateSecret` — stages a new shared secret plus the four outbound/
/// inbound boundary sequence numbers (spec §4.3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateSecretPayload {
    #[serde(rename = "newSecret")]
    pub new_secret: String,
    #[serde(rename = "directiveSequenceNumber")]
    pub directive_sequence_number: u32,
    #[serde(rename = "speakerSequenceNumber")]
    pub speaker_sequence_number: u32,
    #[serde(rename = "eventSequenceNumber")]
    pub event_sequence_number: u32,
    #[serde(rename = "microphoneSequenceNumber")]
    pub microphone_sequence_number: u32,
}

/// `SetClock` — `{"currentTime": u64}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetClockPayload {
    #[serde(rename = "currentTime")]
    pub current_time: u64,
}

/// `Exception` — the server notifying the device of a protocol-level
/// problem it observed (distinct from the device's own `Exception` kind).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionPayload {
    pub code: ExceptionCode,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionCode {
    #[serde(rename = "INVALID_REQUEST")]
    InvalidRequest,
    #[serde(rename = "UNSUPPORTED_API")]
    UnsupportedApi,
    #[serde(rename = "THROTTLING")]
    Throttling,
    #[serde(rename = "INTERNAL_SERVICE")]
    InternalService,
    #[serde(rename = "AIS_UNAVAILABLE")]
    AisUnavailable,
}

/// `connection_from_service` acknowledge state codes (spec §6). Carried in
/// a `"Connected"`-named message's payload after registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionAckCode {
    #[serde(rename = "CONNECTION_ESTABLISHED")]
    ConnectionEstablished,
    #[serde(rename = "INVALID_ACCOUNT_ID")]
    InvalidAccountId,
    #[serde(rename = "INVALID_CLIENT_ID")]
    InvalidClientId,
    #[serde(rename = "API_VERSION_DEPRECATED")]
    ApiVersionDeprecated,
    #[serde(rename = "UNKNOWN_FAILURE")]
    UnknownFailure,
}

/// `connection_from_service` disconnect state codes (spec §6). Carried in
/// a `"Disconnected"`-named message's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionDisconnectCode {
    #[serde(rename = "UNEXPECTED_SEQUENCE_NUMBER")]
    UnexpectedSequenceNumber,
    #[serde(rename = "MESSAGE_TAMPERED")]
    MessageTampered,
    #[serde(rename = "API_VERSION_DEPRECATED")]
    ApiVersionDeprecated,
    #[serde(rename = "ENCRYPTION_ERROR")]
    EncryptionError,
    #[serde(rename = "GOING_OFFLINE")]
    GoingOffline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionAckPayload {
    pub reason: ConnectionAckCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDisconnectPayload {
    pub reason: ConnectionDisconnectCode,
}

/// The closed set of directive names the Dispatcher registers a handler
/// for at startup (spec §4.6).
pub const DIRECTIVE_NAMES: [&str; 12] = [
    "SetVolume",
    "OpenSpeaker",
    "CloseSpeaker",
    "OpenMicrophone",
    "CloseMicrophone",
    "SetAlert",
    "DeleteAlert",
    "SetAlertVolume",
    "SetAttentionState",
    "RotateSecret",
    "SetClock",
    "Exception",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotate_secret_matches_wire_field_names() {
        let json = serde_json::json!({
            "newSecret": "AQIDBA==",
            "directiveSequenceNumber": 44,
            "speakerSequenceNumber": 88,
            "eventSequenceNumber": 10,
            "microphoneSequenceNumber": 20,
        });
        let payload: RotateSecretPayload = serde_json::from_value(json).unwrap();
        assert_eq!(payload.directive_sequence_number, 44);
        assert_eq!(payload.speaker_sequence_number, 88);
    }

    #[test]
    fn set_alert_requires_token() {
        let json = serde_json::json!({
            "scheduledTime": 100,
            "durationInMilliseconds": 100,
            "type": "TIMER",
        });
        assert!(serde_json::from_value::<SetAlertPayload>(json).is_err());
    }

    #[test]
    fn attention_state_round_trips() {
        let json = serde_json::json!({"state": "THINKING", "offset": 5});
        let payload: SetAttentionStatePayload = serde_json::from_value(json).unwrap();
        assert_eq!(payload.state, AttentionState::Thinking);
        assert_eq!(payload.offset, Some(5));
    }
}
