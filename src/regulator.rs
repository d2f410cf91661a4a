//! Outbound aggregation and rate limiting (spec §4.1).
//!
//! The Regulator collects [`Chunk`]s pushed by producers (managers emitting
//! events, the microphone stream) and, on its own dedicated thread, packs
//! them into size-bounded frames no more often than `min_wait_ms` apart.
//! Each topic gets its own monotonic sequence counter, buffer, and emit
//! mode, so (for instance) the microphone topic can stay in `Trickle` for
//! low latency while `event` runs `Burst` to amortize framing overhead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::RegulatorConfig;
use crate::error::CoreError;
use crate::message::Chunk;
use crate::topic::Topic;

/// Callback invoked on the Regulator's own thread once a frame is ready to
/// publish. Implementations encrypt and hand off to [`crate::mqtt::MqttTransport`].
pub type EmitCallback = dyn Fn(Topic, u32, Vec<Chunk>) -> Result<(), CoreError> + Send + Sync;

/// Emission scheduling mode (spec §4.1 "Configuration").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitMode {
    /// Emit as soon as `min_wait_ms` has elapsed since the last emission.
    Trickle,
    /// Additionally delay emission up to `min_wait_ms` after the first
    /// write to an empty buffer, in hope of filling a frame.
    Burst,
}

impl Default for EmitMode {
    fn default() -> Self {
        EmitMode::Trickle
    }
}

struct TopicQueue {
    pending: Mutex<VecDeque<Chunk>>,
    next_sequence: AtomicU32,
    mode: AtomicU8,
    last_emit: Mutex<Option<Instant>>,
    /// Set when a write lands in an empty buffer; cleared once the buffer
    /// drains back to empty (spec §4.1 "Scheduling").
    first_write_since_empty: Mutex<Option<Instant>>,
}

impl TopicQueue {
    fn new() -> Self {
        TopicQueue {
            pending: Mutex::new(VecDeque::new()),
            next_sequence: AtomicU32::new(0),
            mode: AtomicU8::new(EmitMode::Trickle as u8),
            last_emit: Mutex::new(None),
            first_write_since_empty: Mutex::new(None),
        }
    }

    fn mode(&self) -> EmitMode {
        match self.mode.load(Ordering::Acquire) {
            x if x == EmitMode::Burst as u8 => EmitMode::Burst,
            _ => EmitMode::Trickle,
        }
    }

    fn set_mode(&self, mode: EmitMode) {
        self.mode.store(mode as u8, Ordering::Release);
    }

    /// "Can fill a frame" per spec §4.1: payload bytes alone reach
    /// `max_message_size`. Intentionally pessimistic about framing
    /// overhead.
    fn can_fill_frame(pending: &VecDeque<Chunk>, max_message_size: usize) -> bool {
        pending.iter().map(|c| c.size).sum::<usize>() >= max_message_size
    }

    /// Delay before this queue's next emission is eligible, per spec
    /// §4.1's "Scheduling" formula. A queue that has never emitted treats
    /// `since_emit` as unbounded, matching the formula's behaviour for a
    /// freshly started regulator.
    fn delay_until_eligible(&self, now: Instant, min_wait: Duration, max_message_size: usize) -> Duration {
        let since_emit = self.last_emit.lock().map(|t| now.saturating_duration_since(t));
        let mut delay = match since_emit {
            Some(since_emit) if since_emit < min_wait => min_wait - since_emit,
            _ => Duration::ZERO,
        };

        if self.mode() == EmitMode::Burst {
            if let Some(since_write) = self.first_write_since_empty.lock().map(|t| now.saturating_duration_since(t)) {
                let since_emit_unbounded = since_emit.unwrap_or(Duration::MAX);
                let can_fill = Self::can_fill_frame(&self.pending.lock(), max_message_size);
                if !can_fill && since_write < min_wait && min_wait < since_emit_unbounded {
                    delay = min_wait - since_write;
                }
            }
        }
        delay
    }
}

/// Aggregates and rate-limits outbound chunks, one independent pipeline per
/// [`Topic`].
pub struct Regulator {
    config: RegulatorConfig,
    queues: DashMap<Topic, Arc<TopicQueue>>,
    wake: crossbeam_channel::Sender<()>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Regulator {
    /// Starts the dedicated emission thread. `on_emit` is called with the
    /// topic, the sequence number assigned to the frame, and its chunks,
    /// in program order, never concurrently with itself.
    pub fn start(config: RegulatorConfig, on_emit: Arc<EmitCallback>) -> Arc<Self> {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        let stop = Arc::new(AtomicBool::new(false));
        let regulator = Arc::new(Regulator {
            config,
            queues: DashMap::new(),
            wake: wake_tx,
            stop: stop.clone(),
            handle: Mutex::new(None),
        });

        let worker_regulator = regulator.clone();
        let handle = std::thread::spawn(move || {
            worker_regulator.run(wake_rx, on_emit, stop);
        });
        *regulator.handle.lock() = Some(handle);
        regulator
    }

    fn queue_for(&self, topic: Topic) -> Arc<TopicQueue> {
        self.queues.entry(topic).or_insert_with(|| Arc::new(TopicQueue::new())).clone()
    }

    /// Enqueues a chunk for `topic`. Rejects chunks larger than
    /// `max_message_size` outright (spec §4.1 edge case); the caller should
    /// surface [`CoreError::ChunkTooLarge`] as an `ExceptionEncountered`.
    pub fn push(&self, topic: Topic, chunk: Chunk) -> Result<(), CoreError> {
        if chunk.size > self.config.max_message_size {
            return Err(CoreError::ChunkTooLarge { size: chunk.size, max: self.config.max_message_size });
        }
        let queue = self.queue_for(topic);
        {
            let mut pending = queue.pending.lock();
            if pending.is_empty() {
                *queue.first_write_since_empty.lock() = Some(Instant::now());
            }
            pending.push_back(chunk);
        }
        let _ = self.wake.try_send(());
        Ok(())
    }

    /// Switches `topic`'s emission mode between `Trickle` and `Burst`
    /// (spec §4.1 "SetEmitMode").
    pub fn set_emit_mode(&self, topic: Topic, mode: EmitMode) {
        self.queue_for(topic).set_mode(mode);
    }

    /// Resets the sequence counter for `topic` back to zero. Documented as
    /// safe to call reentrantly from within `on_emit` on the Regulator's own
    /// thread (e.g. in response to a connection reset directive).
    pub fn reset_sequence(&self, topic: Topic) {
        self.queue_for(topic).next_sequence.store(0, Ordering::SeqCst);
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.wake.try_send(());
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Stops the emission thread and hands every still-queued chunk to
    /// `destroy_chunk`, in queue order (spec §4.1 "Destroy").
    pub fn shutdown_draining(&self, destroy_chunk: impl Fn(Topic, Chunk)) {
        self.shutdown();
        for entry in self.queues.iter() {
            let topic = *entry.key();
            let mut pending = entry.value().pending.lock();
            while let Some(chunk) = pending.pop_front() {
                destroy_chunk(topic, chunk);
            }
        }
    }

    fn run(&self, wake_rx: crossbeam_channel::Receiver<()>, on_emit: Arc<EmitCallback>, stop: Arc<AtomicBool>) {
        let min_wait = self.config.min_emit_interval();

        loop {
            if stop.load(Ordering::SeqCst) {
                return;
            }

            let now = Instant::now();
            let mut next_wake = Duration::from_secs(1);

            for entry in self.queues.iter() {
                let topic = *entry.key();
                let queue = entry.value().clone();
                if queue.pending.lock().is_empty() {
                    continue;
                }

                let delay = queue.delay_until_eligible(now, min_wait, self.config.max_message_size);
                if delay > Duration::ZERO {
                    next_wake = next_wake.min(delay);
                    continue;
                }

                if let Some(frame) = self.drain_one_frame(&queue) {
                    *queue.last_emit.lock() = Some(Instant::now());
                    let sequence = queue.next_sequence.fetch_add(1, Ordering::SeqCst);
                    if let Err(err) = on_emit(topic, sequence, frame) {
                        tracing::warn!(?topic, %sequence, error = %err, "regulator emit failed");
                    }
                    if !queue.pending.lock().is_empty() {
                        next_wake = next_wake.min(min_wait);
                    }
                }
            }

            let _ = wake_rx.recv_timeout(next_wake);
        }
    }

    /// Pulls as many queued chunks as fit under `max_message_size` into one
    /// frame, or `None` if the queue is empty. Clears `first_write_since_empty`
    /// once the queue drains back to empty (spec §4.1 "Scheduling").
    fn drain_one_frame(&self, queue: &TopicQueue) -> Option<Vec<Chunk>> {
        let mut pending = queue.pending.lock();
        if pending.is_empty() {
            return None;
        }
        let mut frame = Vec::new();
        let mut budget = self.config.max_message_size;
        while let Some(front) = pending.front() {
            if front.size > budget && !frame.is_empty() {
                break;
            }
            let chunk = pending.pop_front().unwrap();
            budget = budget.saturating_sub(chunk.size);
            frame.push(chunk);
            if budget == 0 {
                break;
            }
        }
        if pending.is_empty() {
            drop(pending);
            *queue.first_write_since_empty.lock() = None;
        }
        Some(frame)
    }
}

impl Drop for Regulator {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.wake.try_send(());
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use proptest::prelude::*;

    fn test_config() -> RegulatorConfig {
        RegulatorConfig { max_message_size: 64, min_emit_interval_ms: 5, max_queue_depth: 16 }
    }

    #[test]
    fn emits_pushed_chunks_in_order() {
        let (tx, rx) = mpsc::channel();
        let config = test_config();
        let on_emit: Arc<EmitCallback> = Arc::new(move |topic, seq, chunks| {
            tx.send((topic, seq, chunks.len())).unwrap();
            Ok(())
        });
        let regulator = Regulator::start(config, on_emit);

        let msg = crate::message::Message::Json(crate::message::JsonMessage::new(
            "Test",
            crate::message::MessageId::parse("aaaaaaaa").unwrap(),
            None,
        ));
        regulator.push(Topic::Event, Chunk::new(msg)).unwrap();

        let (topic, seq, count) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(topic, Topic::Event);
        assert_eq!(seq, 0);
        assert_eq!(count, 1);
        regulator.shutdown();
    }

    #[test]
    fn rejects_oversized_chunk() {
        let config = test_config();
        let on_emit: Arc<EmitCallback> = Arc::new(|_, _, _| Ok(()));
        let regulator = Regulator::start(config, on_emit);
        let big_payload = vec![0u8; 100];
        let msg = crate::message::Message::Binary(crate::message::BinaryMessage::new(1, 1, big_payload));
        let err = regulator.push(Topic::Microphone, Chunk::new(msg)).unwrap_err();
        assert!(matches!(err, CoreError::ChunkTooLarge { .. }));
        regulator.shutdown();
    }

    #[test]
    fn reset_sequence_restarts_counter() {
        let (tx, rx) = mpsc::channel();
        let config = test_config();
        let on_emit: Arc<EmitCallback> = Arc::new(move |_, seq, _| {
            tx.send(seq).unwrap();
            Ok(())
        });
        let regulator = Regulator::start(config, on_emit);
        let mk = || {
            crate::message::Message::Json(crate::message::JsonMessage::new(
                "Test",
                crate::message::MessageId::parse("aaaaaaaa").unwrap(),
                None,
            ))
        };
        regulator.push(Topic::Event, Chunk::new(mk())).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0);
        regulator.reset_sequence(Topic::Event);
        regulator.push(Topic::Event, Chunk::new(mk())).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0);
        regulator.shutdown();
    }

    /// Spec §8 scenario 4: two small writes under Burst mode produce one
    /// emission containing both, delayed roughly `min_wait_ms`.
    #[test]
    fn burst_mode_coalesces_two_small_writes_into_one_emission() {
        let (tx, rx) = mpsc::channel();
        let config = RegulatorConfig { max_message_size: 200, min_emit_interval_ms: 150, max_queue_depth: 16 };
        let on_emit: Arc<EmitCallback> = Arc::new(move |_, _, chunks| {
            tx.send(chunks.len()).unwrap();
            Ok(())
        });
        let regulator = Regulator::start(config, on_emit);
        regulator.set_emit_mode(Topic::Event, EmitMode::Burst);

        let mk = |n: usize| {
            crate::message::Message::Binary(crate::message::BinaryMessage::new(1, 1, vec![0u8; n]))
        };
        let started = Instant::now();
        regulator.push(Topic::Event, Chunk::new(mk(50))).unwrap();
        regulator.push(Topic::Event, Chunk::new(mk(50))).unwrap();

        let count = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let elapsed = started.elapsed();
        assert_eq!(count, 2);
        assert!(elapsed >= Duration::from_millis(150), "emission fired too early: {elapsed:?}");
        regulator.shutdown();
    }

    /// Spec §8 universal property: Trickle emissions are spaced at least
    /// `min_wait_ms` apart.
    #[test]
    fn trickle_mode_enforces_minimum_spacing() {
        let (tx, rx) = mpsc::channel();
        let config = RegulatorConfig { max_message_size: 4096, min_emit_interval_ms: 40, max_queue_depth: 64 };
        let on_emit: Arc<EmitCallback> = Arc::new(move |_, _, _| {
            tx.send(Instant::now()).unwrap();
            Ok(())
        });
        let regulator = Regulator::start(config, on_emit);
        let mk = || crate::message::Message::Binary(crate::message::BinaryMessage::new(1, 1, vec![0u8; 4]));

        regulator.push(Topic::Microphone, Chunk::new(mk())).unwrap();
        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        regulator.push(Topic::Microphone, Chunk::new(mk())).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();

        assert!(second.saturating_duration_since(first) >= Duration::from_millis(40));
        regulator.shutdown();
    }

    #[test]
    fn shutdown_draining_hands_back_unsent_chunks() {
        let config = RegulatorConfig { max_message_size: 64, min_emit_interval_ms: 10_000, max_queue_depth: 16 };
        let on_emit: Arc<EmitCallback> = Arc::new(|_, _, _| Ok(()));
        let regulator = Regulator::start(config, on_emit);
        let msg = crate::message::Message::Json(crate::message::JsonMessage::new(
            "Test",
            crate::message::MessageId::parse("aaaaaaaa").unwrap(),
            None,
        ));
        regulator.push(Topic::Event, Chunk::new(msg)).unwrap();

        let destroyed: Arc<Mutex<Vec<Topic>>> = Arc::new(Mutex::new(Vec::new()));
        let destroyed_clone = destroyed.clone();
        regulator.shutdown_draining(move |topic, _chunk| destroyed_clone.lock().push(topic));
        assert_eq!(*destroyed.lock(), vec![Topic::Event]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(5))]

        // Spec §8 universal property: Trickle emissions are spaced at
        // least `min_wait_ms` apart, for arbitrary `min_wait_ms` in a
        // range small enough to keep the test fast.
        #[test]
        fn trickle_spacing_holds_for_arbitrary_min_wait(min_wait_ms in 10u64..60) {
            let (tx, rx) = mpsc::channel();
            let config = RegulatorConfig { max_message_size: 4096, min_emit_interval_ms: min_wait_ms, max_queue_depth: 64 };
            let on_emit: Arc<EmitCallback> = Arc::new(move |_, _, _| {
                tx.send(Instant::now()).unwrap();
                Ok(())
            });
            let regulator = Regulator::start(config, on_emit);
            let mk = || crate::message::Message::Binary(crate::message::BinaryMessage::new(1, 1, vec![0u8; 4]));

            regulator.push(Topic::Microphone, Chunk::new(mk())).unwrap();
            let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            regulator.push(Topic::Microphone, Chunk::new(mk())).unwrap();
            let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();

            let spacing = second.saturating_duration_since(first);
            regulator.shutdown();
            prop_assert!(spacing >= Duration::from_millis(min_wait_ms));
        }
    }
}
