//! Centralizes `CoreError` -> `ExceptionEncountered` conversion (spec §7).
//! Every component that fails in a way the server needs to know about
//! routes through here instead of constructing the event itself.

use std::sync::Arc;

use crate::error::CoreError;
use crate::events::{ExceptionEncounteredError, ExceptionEncounteredMessage, ExceptionEncounteredPayload};
use crate::message::{Chunk, JsonMessage, Message};
use crate::regulator::Regulator;
use crate::services::Services;
use crate::topic::Topic;

pub struct ExceptionManager {
    regulator: Arc<Regulator>,
    services: Arc<Services>,
}

impl ExceptionManager {
    pub fn new(regulator: Arc<Regulator>, services: Arc<Services>) -> Self {
        ExceptionManager { regulator, services }
    }

    /// Reports `err` as an `ExceptionEncountered` event (spec §6, §7).
    /// `context_topic`/`context_sequence` become the payload's
    /// `message.topic`/`message.sequenceNumber`; `index` is the
    /// sub-message index within that topic's frame, or 0 if not
    /// applicable.
    pub fn report(&self, err: CoreError, context_topic: Topic, context_sequence: u32, index: u32) {
        tracing::warn!(?context_topic, context_sequence, index, error = %err, "exception encountered");

        let payload = ExceptionEncounteredPayload {
            error: ExceptionEncounteredError { code: err.exception_code().to_string() },
            message: ExceptionEncounteredMessage {
                topic: context_topic.suffix().to_string(),
                sequence_number: context_sequence,
                index,
            },
        };
        let json_payload = match serde_json::to_value(&payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize ExceptionEncountered payload");
                return;
            }
        };
        let message = Message::Json(JsonMessage::new("ExceptionEncountered", self.services.ids.next_id(), Some(json_payload)));
        if let Err(e) = self.regulator.push(Topic::Event, Chunk::new(message)) {
            tracing::error!(error = %e, "failed to enqueue ExceptionEncountered event");
        }
    }

    /// Convenience for dispatcher-originated errors, which always carry a
    /// `(sequence, index)` pair already (spec §4.6, §8 scenarios 5 and 6).
    pub fn report_dispatch_error(&self, err: CoreError, topic: Topic) {
        let (sequence, index) = match &err {
            CoreError::MalformedMessage { sequence, index, .. } => (*sequence, *index),
            CoreError::UnsupportedApi { sequence, index, .. } => (*sequence, *index),
            _ => (0, 0),
        };
        self.report(err, topic, sequence, index);
    }
}
