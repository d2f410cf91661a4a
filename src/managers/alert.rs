//! Handles `SetAlert`/`DeleteAlert`/`SetAlertVolume` directives (spec §4.6,
//! §6). Persistent alert storage is out of scope (spec §1); active alerts
//! live only in memory for the life of the process.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::directives::{AlertType, DeleteAlertPayload, SetAlertPayload, SetAlertVolumePayload};
use crate::message::{Chunk, JsonMessage, Message};
use crate::regulator::Regulator;
use crate::services::Services;
use crate::topic::Topic;

const DEFAULT_VOLUME: u8 = 50;
const MAX_VOLUME: u8 = 100;

#[derive(Debug, Clone)]
pub struct ScheduledAlert {
    pub scheduled_time: u64,
    pub duration_in_milliseconds: u32,
    pub alert_type: AlertType,
}

/// In-memory table of tokens staged by `SetAlert`, keyed by the server's
/// 8-character alert token (spec §6 `SetAlert.token`).
pub struct AlertManager {
    regulator: Arc<Regulator>,
    services: Arc<Services>,
    alerts: DashMap<String, ScheduledAlert>,
    volume: AtomicU8,
}

impl AlertManager {
    pub fn new(regulator: Arc<Regulator>, services: Arc<Services>) -> Self {
        AlertManager { regulator, services, alerts: DashMap::new(), volume: AtomicU8::new(DEFAULT_VOLUME) }
    }

    pub fn is_scheduled(&self, token: &str) -> bool {
        self.alerts.contains_key(token)
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Acquire)
    }

    /// Stages an alert per `SetAlert` (spec §6). Overwrites any prior entry
    /// at the same token.
    pub fn handle_set_alert(&self, payload: SetAlertPayload) {
        self.alerts.insert(
            payload.token.clone(),
            ScheduledAlert {
                scheduled_time: payload.scheduled_time,
                duration_in_milliseconds: payload.duration_in_milliseconds,
                alert_type: payload.alert_type,
            },
        );
        tracing::debug!(token = %payload.token, "alert scheduled");
    }

    /// Removes a previously staged alert per `DeleteAlert` (spec §6).
    pub fn handle_delete_alert(&self, payload: DeleteAlertPayload) {
        self.alerts.remove(&payload.token);
        tracing::debug!(token = %payload.token, "alert deleted");
    }

    /// Sets the alert playback volume per `SetAlertVolume`, clamped to
    /// `[0, MAX_VOLUME]` the same way `SpeakerManager::set_volume` clamps
    /// (spec §4.7).
    pub fn handle_set_alert_volume(&self, payload: SetAlertVolumePayload) {
        self.volume.store(payload.volume.min(MAX_VOLUME), Ordering::Release);
    }

    /// Emits an `AlertEntered` device event the way a real device would on
    /// local firing of a scheduled alert (supplemented, SPEC_FULL §4: the
    /// alert *scheduler* itself is out of scope, but the in-memory state
    /// machine firing an already-staged alert is in scope).
    pub fn fire(&self, token: &str) {
        if self.alerts.remove(token).is_none() {
            return;
        }
        let payload = serde_json::json!({ "token": token });
        let message = Message::Json(JsonMessage::new("AlertEntered", self.services.ids.next_id(), Some(payload)));
        if let Err(e) = self.regulator.push(Topic::Event, Chunk::new(message)) {
            tracing::error!(error = %e, token, "failed to enqueue AlertEntered event");
        }
    }
}
