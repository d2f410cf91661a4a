//! Typed payloads for events the device publishes on the `Event` topic
//! (spec §6). Mirrors [`crate::directives`]: concrete shapes for the events
//! this crate's managers actually emit.

use serde::{Deserialize, Serialize};

/// `ExceptionEncountered` — `{"error":{"code":...},"message":{"topic","sequenceNumber","index"}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionEncounteredPayload {
    pub error: ExceptionEncounteredError,
    pub message: ExceptionEncounteredMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionEncounteredError {
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionEncounteredMessage {
    pub topic: String,
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u32,
    pub index: u32,
}

/// `SecretRotated` — advertises the outbound boundary sequence numbers the
/// device chose in response to a `RotateSecret` directive (spec §4.3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRotatedPayload {
    #[serde(rename = "eventSequenceNumber")]
    pub event_sequence_number: u32,
    #[serde(rename = "microphoneSequenceNumber", skip_serializing_if = "Option::is_none", default)]
    pub microphone_sequence_number: Option<u32>,
}

/// `MicrophoneOpened` — emitted by each of the three microphone initiation
/// variants (spec §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicrophoneOpenedPayload {
    pub initiator: MicrophoneInitiator,
    #[serde(rename = "startSample")]
    pub start_sample: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MicrophoneInitiator {
    #[serde(rename = "HOLD_TO_TALK")]
    HoldToTalk,
    #[serde(rename = "TAP_TO_TALK")]
    TapToTalk,
    #[serde(rename = "WAKE_WORD")]
    WakeWord,
}

/// `MicrophoneClosed` — emitted on `CloseMicrophone` (spec §4.8).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MicrophoneClosedPayload {}

/// `BufferStateChanged` — SpeakerManager fill-level transitions (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferStateChangedPayload {
    pub state: BufferState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferState {
    #[serde(rename = "UNDERRUN")]
    Underrun,
    #[serde(rename = "UNDERRUN_WARNING")]
    UnderrunWarning,
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "OVERRUN_WARNING")]
    OverrunWarning,
    #[serde(rename = "OVERRUN")]
    Overrun,
}

/// `ClockSynced` — supplemented event reporting the device's offset from
/// server time after a `SetClock` directive (SPEC_FULL §4 ClockManager).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockSyncedPayload {
    #[serde(rename = "offsetMillis")]
    pub offset_millis: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_encountered_matches_wire_shape() {
        let payload = ExceptionEncounteredPayload {
            error: ExceptionEncounteredError { code: "MALFORMED_MESSAGE".to_string() },
            message: ExceptionEncounteredMessage { topic: "directive".to_string(), sequence_number: 4, index: 44 },
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["error"]["code"], "MALFORMED_MESSAGE");
        assert_eq!(json["message"]["sequenceNumber"], 4);
        assert_eq!(json["message"]["index"], 44);
    }

    #[test]
    fn secret_rotated_omits_microphone_when_absent() {
        let payload = SecretRotatedPayload { event_sequence_number: 10, microphone_sequence_number: None };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("microphoneSequenceNumber"));
    }
}
