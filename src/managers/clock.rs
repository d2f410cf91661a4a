//! Handles `SetClock` directives and tracks the device's offset from
//! server time (spec §6, SPEC_FULL §4 "Additional managers").

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::directives::SetClockPayload;
use crate::events::ClockSyncedPayload;
use crate::message::{Chunk, JsonMessage, Message};
use crate::regulator::Regulator;
use crate::services::Services;
use crate::topic::Topic;

pub struct ClockManager {
    regulator: Arc<Regulator>,
    services: Arc<Services>,
    offset_millis: AtomicI64,
}

impl ClockManager {
    pub fn new(regulator: Arc<Regulator>, services: Arc<Services>) -> Self {
        ClockManager { regulator, services, offset_millis: AtomicI64::new(0) }
    }

    /// Current best estimate of `server_time - device_time`, in
    /// milliseconds.
    pub fn offset_millis(&self) -> i64 {
        self.offset_millis.load(Ordering::Acquire)
    }

    /// Applies a `SetClock` directive and emits `ClockSynced`.
    pub fn handle_set_clock(&self, payload: SetClockPayload) {
        let device_now = self.services.clock.now_millis();
        let offset = payload.current_time as i64 - device_now as i64;
        self.offset_millis.store(offset, Ordering::Release);

        let event_payload = ClockSyncedPayload { offset_millis: offset };
        let json_payload = serde_json::to_value(&event_payload).expect("ClockSyncedPayload always serializes");
        let message = Message::Json(JsonMessage::new("ClockSynced", self.services.ids.next_id(), Some(json_payload)));
        if let Err(e) = self.regulator.push(Topic::Event, Chunk::new(message)) {
            tracing::error!(error = %e, "failed to enqueue ClockSynced event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegulatorConfig;

    #[test]
    fn computes_offset_from_directive() {
        let regulator = Regulator::start(
            RegulatorConfig { max_message_size: 1024, min_emit_interval_ms: 1000, max_queue_depth: 16 },
            Arc::new(|_, _, _| Ok(())),
        );
        let services = Arc::new(Services::production());
        let manager = ClockManager::new(regulator.clone(), services.clone());

        let device_now = services.clock.now_millis();
        manager.handle_set_clock(SetClockPayload { current_time: device_now + 5_000 });

        let offset = manager.offset_millis();
        assert!((offset - 5_000).abs() < 50, "offset {offset} should be close to 5000");
        regulator.shutdown();
    }
}
