//! Microphone initiation, gating, and the uplink pump (spec §4.8, §2
//! "Microphone audio" data flow: `AudioSource.Write -> DataStreamRing ->
//! Reader(microphone) -> binary Regulator(microphone topic) -> Emitter`).
//!
//! The three initiation variants each unblock the shared
//! [`crate::ring::RingReader`] at a caller-chosen sample offset and emit a
//! `MicrophoneOpened` event; `CloseMicrophone` (server directive or local
//! call) reverses both. A dedicated thread continuously drains the ring
//! while open and hands binary records to the microphone [`Regulator`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::events::{MicrophoneInitiator, MicrophoneOpenedPayload};
use crate::message::{BinaryMessage, Chunk, JsonMessage, Message};
use crate::regulator::Regulator;
use crate::ring::{DataStreamRing, RingReader};
use crate::services::Services;
use crate::topic::Topic;

/// Wake-word preroll: the 500 ms of audio preceding the wake word that is
/// streamed for server-side verification (spec §4.8, GLOSSARY "Preroll").
const PREROLL_MILLIS: u64 = 500;

/// Bytes per PCM sample carried on the microphone ring (16-bit mono, §1).
const BYTES_PER_SAMPLE: u64 = 2;

/// Binary message type code for microphone PCM records on the wire.
const MIC_FRAME_TYPE: u8 = 1;

/// How often the uplink pump drains the ring while the microphone is open.
const PUMP_PERIOD: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrophoneState {
    Open,
    Closed,
}

/// Gates the shared mic [`RingReader`], pumps PCM to the microphone
/// Regulator while open, and emits the open/close events the UX manager
/// and the server both observe.
pub struct MicrophoneManager {
    ring: Arc<DataStreamRing>,
    reader: RingReader,
    regulator: Arc<Regulator>,
    services: Arc<Services>,
    sample_rate_hz: u32,
    open: AtomicBool,
    stop: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MicrophoneManager {
    pub fn start(ring: Arc<DataStreamRing>, regulator: Arc<Regulator>, services: Arc<Services>, sample_rate_hz: u32) -> Arc<Self> {
        let reader = ring.register_reader();
        reader.set_enabled(false);
        let manager = Arc::new(MicrophoneManager {
            ring,
            reader,
            regulator,
            services,
            sample_rate_hz,
            open: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            handle: Mutex::new(None),
        });

        let worker = manager.clone();
        let handle = std::thread::spawn(move || worker.pump());
        *manager.handle.lock() = Some(handle);
        manager
    }

    pub fn state(&self) -> MicrophoneState {
        if self.open.load(Ordering::Acquire) { MicrophoneState::Open } else { MicrophoneState::Closed }
    }

    fn samples_to_bytes(&self, samples: u64) -> u64 {
        samples * BYTES_PER_SAMPLE
    }

    fn open_at(&self, start_sample: u64, initiator: MicrophoneInitiator, preroll_samples: u64) {
        let start_byte = self.samples_to_bytes(start_sample.saturating_sub(preroll_samples));
        self.reader.seek(start_byte as usize);
        self.reader.set_enabled(true);
        self.open.store(true, Ordering::Release);
        self.emit_opened(initiator, start_sample);
    }

    /// Push-to-talk: the user held a button starting at `start_sample`.
    pub fn hold_to_talk(&self, start_sample: u64) {
        self.open_at(start_sample, MicrophoneInitiator::HoldToTalk, 0);
    }

    /// Tap-to-talk: a single tap starts capture at `start_sample` under the
    /// given wake/VAD `profile` (profile selection is capability-negotiated
    /// and out of scope per spec §1; only the sample offset is in scope).
    pub fn tap_to_talk(&self, start_sample: u64, _profile: &str) {
        self.open_at(start_sample, MicrophoneInitiator::TapToTalk, 0);
    }

    /// Wake-word: capture starts `PREROLL_MILLIS` before `begin_sample` so
    /// the server can verify the wake word itself; `end_sample` marks where
    /// local wake-word detection completed (informational only — the
    /// stream keeps flowing past it until `CloseMicrophone`).
    pub fn wake_word_start(&self, begin_sample: u64, _end_sample: u64, _profile: &str, _word: &str) {
        let preroll_samples = (PREROLL_MILLIS * self.sample_rate_hz as u64) / 1000;
        self.open_at(begin_sample, MicrophoneInitiator::WakeWord, preroll_samples);
    }

    /// `CloseMicrophone` directive or local call (spec §4.8).
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.reader.set_enabled(false);
        let message = Message::Json(JsonMessage::new("MicrophoneClosed", self.services.ids.next_id(), None));
        if let Err(e) = self.regulator.push(Topic::Event, Chunk::new(message)) {
            tracing::error!(error = %e, "failed to enqueue MicrophoneClosed event");
        }
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn emit_opened(&self, initiator: MicrophoneInitiator, start_sample: u64) {
        let payload = MicrophoneOpenedPayload { initiator, start_sample };
        let json_payload = serde_json::to_value(&payload).expect("MicrophoneOpenedPayload always serializes");
        let message = Message::Json(JsonMessage::new("MicrophoneOpened", self.services.ids.next_id(), Some(json_payload)));
        if let Err(e) = self.regulator.push(Topic::Event, Chunk::new(message)) {
            tracing::error!(error = %e, "failed to enqueue MicrophoneOpened event");
        }
    }

    /// Drains the ring into microphone-topic binary chunks while open
    /// (spec §2 "Microphone audio" data flow). Idle (closed) periods just
    /// sleep, matching the Regulator/Sequencer's own thread-per-timer idiom
    /// used elsewhere in this crate.
    fn pump(&self) {
        let frame_bytes = (self.sample_rate_hz as usize / 50).max(1) * BYTES_PER_SAMPLE as usize; // 20ms frame
        let mut scratch = vec![0u8; frame_bytes];
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            if self.open.load(Ordering::Acquire) {
                match self.reader.try_read(&mut scratch) {
                    Ok(0) => {}
                    Ok(n) => {
                        let record = BinaryMessage::new(MIC_FRAME_TYPE, 1, scratch[..n].to_vec());
                        let chunk = Chunk::new(Message::Binary(record));
                        if let Err(e) = self.regulator.push(Topic::Microphone, chunk) {
                            tracing::warn!(error = %e, "dropping microphone frame");
                        }
                    }
                    Err(crate::error::CoreError::RingOverrun) => {
                        tracing::warn!("microphone reader overrun, resynced to oldest byte held");
                    }
                    Err(e) => tracing::warn!(error = %e, "microphone ring read error"),
                }
            }
            std::thread::sleep(PUMP_PERIOD);
        }
    }
}

impl Drop for MicrophoneManager {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}
