//! Inbound speaker audio buffering, fill-level reporting, and volume
//! control (spec §4.7).
//!
//! `OnFrame` is called by the Dispatcher with each decoded binary record
//! off the `Speaker` topic's sequencer; a dedicated consumer thread drains
//! the ring at the Opus frame cadence (~20 ms) and hands PCM to an injected
//! `play_pcm` sink. Fill-level transitions are reported as
//! `BufferStateChanged` events.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::events::{BufferState, BufferStateChangedPayload};
use crate::message::{BinaryMessage, Chunk, JsonMessage, Message};
use crate::regulator::Regulator;
use crate::ring::DataStreamRing;
use crate::services::Services;
use crate::topic::Topic;

pub const MIN_VOLUME: u8 = 0;
pub const MAX_VOLUME: u8 = 100;
const DEFAULT_VOLUME: u8 = 50;

/// Cadence at which the consumer thread drains the ring, matching a single
/// Opus frame's worth of audio (spec §4.7).
const FRAME_PERIOD: Duration = Duration::from_millis(20);

/// Fill-level thresholds, as a fraction of ring capacity (spec §4.7
/// "threshold comparison on fill level").
const UNDERRUN_FRACTION: f64 = 0.05;
const UNDERRUN_WARNING_FRACTION: f64 = 0.20;
const OVERRUN_WARNING_FRACTION: f64 = 0.80;
const OVERRUN_FRACTION: f64 = 0.95;

pub type PlayPcmCallback = dyn Fn(&[u8]) + Send + Sync;

/// Buffers decoded speaker audio and drives playback.
pub struct SpeakerManager {
    ring: Arc<DataStreamRing>,
    reader: crate::ring::RingReader,
    regulator: Arc<Regulator>,
    services: Arc<Services>,
    play_pcm: Arc<PlayPcmCallback>,
    volume: AtomicU8,
    playing: AtomicBool,
    stop: AtomicBool,
    last_state: Mutex<BufferState>,
    read_scratch_len: AtomicUsize,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SpeakerManager {
    pub fn start(capacity_bytes: usize, regulator: Arc<Regulator>, services: Arc<Services>, play_pcm: Arc<PlayPcmCallback>) -> Arc<Self> {
        let ring = DataStreamRing::new(capacity_bytes);
        let reader = ring.register_reader();
        let frame_bytes = ((16_000f64 * 0.02) as usize) * 2; // 20ms @ 16kHz, 16-bit mono
        let manager = Arc::new(SpeakerManager {
            ring,
            reader,
            regulator,
            services,
            play_pcm,
            volume: AtomicU8::new(DEFAULT_VOLUME),
            playing: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            last_state: Mutex::new(BufferState::None),
            read_scratch_len: AtomicUsize::new(frame_bytes),
            handle: Mutex::new(None),
        });

        let worker = manager.clone();
        let handle = std::thread::spawn(move || worker.run());
        *manager.handle.lock() = Some(handle);
        manager
    }

    /// Enqueues one decoded binary record's audio data (spec §4.6 step 5,
    /// §4.7). `seq`/`index` are for logging only: ordering is already
    /// guaranteed by the Speaker sequencer upstream.
    pub fn on_frame(&self, frame: BinaryMessage, seq: u32, index: u32) {
        if let Err(e) = self.ring.write(&frame.data) {
            tracing::warn!(seq, index, error = %e, "dropping speaker frame larger than ring capacity");
        }
    }

    pub fn set_volume(&self, volume: u8) {
        self.volume.store(volume.clamp(MIN_VOLUME, MAX_VOLUME), Ordering::Release);
    }

    pub fn adjust_volume(&self, delta: i16) {
        let current = self.volume.load(Ordering::Acquire) as i16;
        let next = (current + delta).clamp(MIN_VOLUME as i16, MAX_VOLUME as i16) as u8;
        self.volume.store(next, Ordering::Release);
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Acquire)
    }

    /// Pauses the consumer thread's handoff to `play_pcm`; the ring keeps
    /// accepting frames underneath.
    pub fn stop_playback(&self) {
        self.playing.store(false, Ordering::Release);
    }

    /// Unblocks the consumer thread (spec §4.7 "OnSpeakerReady").
    pub fn on_speaker_ready(&self) {
        self.playing.store(true, Ordering::Release);
    }

    /// Repositions the reader after the server supplies a recovery sequence
    /// number following an `Overrun` (spec §4.7 "resync").
    pub fn resync(&self, _recovery_seq: u32) {
        self.reader.seek(self.ring.write_end());
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn fill_state(&self) -> BufferState {
        let capacity = self.ring.capacity() as f64;
        let filled = (self.ring.write_end().saturating_sub(self.reader.position())) as f64;
        let fraction = if capacity > 0.0 { filled / capacity } else { 0.0 };
        if fraction <= UNDERRUN_FRACTION {
            BufferState::Underrun
        } else if fraction <= UNDERRUN_WARNING_FRACTION {
            BufferState::UnderrunWarning
        } else if fraction >= OVERRUN_FRACTION {
            BufferState::Overrun
        } else if fraction >= OVERRUN_WARNING_FRACTION {
            BufferState::OverrunWarning
        } else {
            BufferState::None
        }
    }

    fn report_state_if_changed(&self, state: BufferState) {
        let mut last = self.last_state.lock();
        if *last == state {
            return;
        }
        *last = state;
        drop(last);

        let payload = BufferStateChangedPayload { state };
        let json_payload = serde_json::to_value(&payload).expect("BufferStateChangedPayload always serializes");
        let message = Message::Json(JsonMessage::new("BufferStateChanged", self.services.ids.next_id(), Some(json_payload)));
        if let Err(e) = self.regulator.push(Topic::Event, Chunk::new(message)) {
            tracing::error!(error = %e, "failed to enqueue BufferStateChanged event");
        }
    }

    fn run(&self) {
        let frame_bytes = self.read_scratch_len.load(Ordering::Relaxed);
        let mut scratch = vec![0u8; frame_bytes];
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }

            self.report_state_if_changed(self.fill_state());

            if self.playing.load(Ordering::Acquire) {
                match self.reader.try_read(&mut scratch) {
                    Ok(0) => {}
                    Ok(n) => (self.play_pcm)(&scratch[..n]),
                    Err(crate::error::CoreError::RingOverrun) => {
                        self.report_state_if_changed(BufferState::Overrun);
                    }
                    Err(e) => tracing::warn!(error = %e, "speaker ring read error"),
                }
            }

            std::thread::sleep(FRAME_PERIOD);
        }
    }
}

impl Drop for SpeakerManager {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn regulator() -> Arc<Regulator> {
        Regulator::start(
            crate::config::RegulatorConfig { max_message_size: 4096, min_emit_interval_ms: 1, max_queue_depth: 64 },
            Arc::new(|_, _, _| Ok(())),
        )
    }

    #[test]
    fn volume_clamps_to_bounds() {
        let regulator = regulator();
        let services = Arc::new(Services::production());
        let manager = SpeakerManager::start(4096, regulator.clone(), services, Arc::new(|_| {}));

        manager.set_volume(255);
        assert_eq!(manager.volume(), MAX_VOLUME);
        manager.adjust_volume(-1000);
        assert_eq!(manager.volume(), MIN_VOLUME);

        manager.shutdown();
        regulator.shutdown();
    }

    #[test]
    fn on_frame_feeds_play_pcm_once_ready() {
        let regulator = regulator();
        let services = Arc::new(Services::production());
        let received: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = received.clone();
        let manager = SpeakerManager::start(
            4096,
            regulator.clone(),
            services,
            Arc::new(move |pcm: &[u8]| {
                received_clone.lock().unwrap().extend_from_slice(pcm);
            }),
        );

        manager.on_speaker_ready();
        manager.on_frame(BinaryMessage::new(1, 1, vec![1, 2, 3, 4]), 0, 0);

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while received.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*received.lock().unwrap(), vec![1, 2, 3, 4]);

        manager.shutdown();
        regulator.shutdown();
    }
}
