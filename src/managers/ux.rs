//! Tracks the device's attention state and the microphone open/closed
//! state it observes (spec §4.8, SPEC_FULL §4 "Additional managers").
//!
//! Persistent UX rendering (what the state actually looks like on the
//! device) is out of scope; this manager is the state machine a real UX
//! layer would subscribe to.

use parking_lot::Mutex;

use crate::directives::SetAttentionStatePayload;
use crate::managers::microphone::MicrophoneState;

pub use crate::directives::AttentionState;

pub struct UxManager {
    attention: Mutex<AttentionState>,
    microphone: Mutex<MicrophoneState>,
}

impl UxManager {
    pub fn new() -> Self {
        UxManager { attention: Mutex::new(AttentionState::Idle), microphone: Mutex::new(MicrophoneState::Closed) }
    }

    pub fn attention_state(&self) -> AttentionState {
        *self.attention.lock()
    }

    /// Applies a `SetAttentionState` directive (spec §6). The `offset`
    /// field times the transition against the audio stream; rendering it
    /// is out of scope, the state itself is what's tracked here.
    pub fn handle_set_attention_state(&self, payload: SetAttentionStatePayload) {
        *self.attention.lock() = payload.state;
    }

    pub fn microphone_state(&self) -> MicrophoneState {
        *self.microphone.lock()
    }

    /// Called by the [`crate::managers::microphone::MicrophoneManager`]
    /// whenever its open/closed state changes (spec §4.8: "toggles the
    /// microphone state to OPEN, which the UX manager observes").
    pub fn observe_microphone_state(&self, state: MicrophoneState) {
        *self.microphone.lock() = state;
    }
}

impl Default for UxManager {
    fn default() -> Self {
        Self::new()
    }
}
