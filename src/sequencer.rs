//! Inbound per-topic reordering (spec §4.4). Buffers out-of-order arrivals
//! up to `max_buffered` slots ahead of `next_expected` and times out a gap
//! after `gap_timeout` so a missing message cannot stall delivery forever.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::ReentrantMutex;

use crate::config::SequencerConfig;
use crate::error::CoreError;
use crate::modseq::{mod_ge, mod_lt};

type SequencerGuard<'a, T> =
    parking_lot::lock_api::ReentrantMutexGuard<'a, parking_lot::RawMutex, parking_lot::RawThreadId, RefCell<State<T>>>;

struct State<T> {
    next_expected: u32,
    buffered: HashMap<u32, T>,
    oldest_gap_started: Option<std::time::Instant>,
}

impl<T> State<T> {
    fn new(next_expected: u32) -> Self {
        State { next_expected, buffered: HashMap::new(), oldest_gap_started: None }
    }
}

/// Reorders inbound messages of type `T` for a single topic. `on_deliver`
/// may call [`Sequencer::reset`] reentrantly from the same thread (the
/// delivery callback handling a connection-reset directive, for instance);
/// that is why the state lives behind a [`ReentrantMutex`].
pub struct Sequencer<T: Send + 'static> {
    config: SequencerConfig,
    state: ReentrantMutex<RefCell<State<T>>>,
    wake: crossbeam_channel::Sender<()>,
    stop: Arc<AtomicBool>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    on_deliver: Arc<dyn Fn(u32, T) + Send + Sync>,
    on_gap_timeout: Arc<dyn Fn(u32) + Send + Sync>,
}

impl<T: Send + 'static> Sequencer<T> {
    /// Starts the dedicated gap-timeout thread. `on_deliver(seq, item)` is
    /// called once per item in strictly increasing sequence order.
    /// `on_gap_timeout(next_expected)` fires when a gap has stood open
    /// longer than `gap_timeout`; the caller typically skips ahead by
    /// calling [`Sequencer::skip_to`].
    pub fn start(
        config: SequencerConfig,
        initial_next_expected: u32,
        on_deliver: Arc<dyn Fn(u32, T) + Send + Sync>,
        on_gap_timeout: Arc<dyn Fn(u32) + Send + Sync>,
    ) -> Arc<Self> {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        let stop = Arc::new(AtomicBool::new(false));
        let sequencer = Arc::new(Sequencer {
            config,
            state: ReentrantMutex::new(RefCell::new(State::new(initial_next_expected))),
            wake: wake_tx,
            stop: stop.clone(),
            handle: parking_lot::Mutex::new(None),
            on_deliver,
            on_gap_timeout,
        });

        let worker = sequencer.clone();
        let handle = std::thread::spawn(move || worker.run_gap_timer(wake_rx, stop));
        *sequencer.handle.lock() = Some(handle);
        sequencer
    }

    /// Accepts `item` arriving at `sequence`. Delivers it immediately (and
    /// any now-contiguous buffered successors) if `sequence == next_expected`;
    /// buffers it otherwise. Sequence numbers strictly behind `next_expected`
    /// are discarded as stale duplicates (spec §9 open question).
    pub fn accept(&self, sequence: u32, item: T) -> Result<(), CoreError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();

        if mod_lt(sequence, state.next_expected) {
            return Ok(());
        }

        if sequence == state.next_expected {
            state.next_expected = state.next_expected.wrapping_add(1);
            state.oldest_gap_started = None;
            let to_deliver_seq = sequence;
            drop(state);
            (self.on_deliver)(to_deliver_seq, item);
            self.drain_contiguous(&guard);
            return Ok(());
        }

        let delta = sequence.wrapping_sub(state.next_expected) as usize;
        if delta >= self.config.max_buffered {
            return Err(CoreError::SequencerFull { delta: delta as u32 });
        }
        if state.oldest_gap_started.is_none() {
            state.oldest_gap_started = Some(std::time::Instant::now());
        }
        state.buffered.insert(sequence, item);
        let _ = self.wake.try_send(());
        Ok(())
    }

    fn drain_contiguous(&self, guard: &SequencerGuard<'_, T>) {
        loop {
            let next_item = {
                let mut state = guard.borrow_mut();
                let expected = state.next_expected;
                match state.buffered.remove(&expected) {
                    Some(item) => {
                        state.next_expected = expected.wrapping_add(1);
                        if state.buffered.is_empty() {
                            state.oldest_gap_started = None;
                        }
                        Some((expected, item))
                    }
                    None => None,
                }
            };
            match next_item {
                Some((seq, item)) => (self.on_deliver)(seq, item),
                None => break,
            }
        }
    }

    /// Forces `next_expected` forward to `new_next_expected`, dropping any
    /// buffered items now behind it. Used after a gap timeout or an
    /// explicit resync directive.
    pub fn skip_to(&self, new_next_expected: u32) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if mod_ge(new_next_expected, state.next_expected) {
            state.next_expected = new_next_expected;
            state.buffered.retain(|&seq, _| mod_ge(seq, new_next_expected));
            state.oldest_gap_started = None;
        }
        drop(state);
        self.drain_contiguous(&guard);
    }

    /// Resets the sequencer back to expecting `next_expected`, discarding
    /// all buffered state. Safe to call reentrantly from `on_deliver`.
    pub fn reset(&self, next_expected: u32) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        *state = State::new(next_expected);
    }

    pub fn next_expected(&self) -> u32 {
        self.state.lock().borrow().next_expected
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.wake.try_send(());
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn run_gap_timer(&self, wake_rx: crossbeam_channel::Receiver<()>, stop: Arc<AtomicBool>) {
        loop {
            if stop.load(Ordering::SeqCst) {
                return;
            }

            let wait = {
                let guard = self.state.lock();
                let state = guard.borrow();
                match state.oldest_gap_started {
                    Some(started) => {
                        let elapsed = started.elapsed();
                        if elapsed >= self.config.gap_timeout() {
                            None
                        } else {
                            Some(self.config.gap_timeout() - elapsed)
                        }
                    }
                    None => Some(Duration::from_secs(3600)),
                }
            };

            match wait {
                None => {
                    let next_expected = self.next_expected();
                    (self.on_gap_timeout)(next_expected);

                    // Re-arm from now if the callback left the gap open
                    // (didn't call `skip_to`/`reset`). Without this, a
                    // collaborator that doesn't clear the gap would spin
                    // this loop at 100% CPU calling `on_gap_timeout`
                    // forever instead of firing once per `gap_timeout`.
                    let guard = self.state.lock();
                    let mut state = guard.borrow_mut();
                    if state.oldest_gap_started.is_some() {
                        state.oldest_gap_started = Some(std::time::Instant::now());
                    }
                }
                Some(duration) => {
                    let _ = wake_rx.recv_timeout(duration);
                }
            }
        }
    }
}

impl<T: Send + 'static> Drop for Sequencer<T> {
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

    fn test_config() -> SequencerConfig {
        SequencerConfig { max_buffered: 8, gap_timeout_ms: 50 }
    }

    #[test]
    fn delivers_in_order_arrivals_immediately() {
        let (tx, rx) = mpsc::channel();
        let on_deliver: Arc<dyn Fn(u32, &'static str) + Send + Sync> = Arc::new(move |seq, item| {
            tx.send((seq, item)).unwrap();
        });
        let on_timeout: Arc<dyn Fn(u32) + Send + Sync> = Arc::new(|_| {});
        let sequencer = Sequencer::start(test_config(), 0, on_deliver, on_timeout);

        sequencer.accept(0, "a").unwrap();
        sequencer.accept(1, "b").unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), (0, "a"));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), (1, "b"));
        sequencer.shutdown();
    }

    #[test]
    fn buffers_and_reorders_out_of_order_arrival() {
        let (tx, rx) = mpsc::channel();
        let on_deliver: Arc<dyn Fn(u32, &'static str) + Send + Sync> = Arc::new(move |seq, item| {
            tx.send((seq, item)).unwrap();
        });
        let on_timeout: Arc<dyn Fn(u32) + Send + Sync> = Arc::new(|_| {});
        let sequencer = Sequencer::start(test_config(), 0, on_deliver, on_timeout);

        sequencer.accept(1, "b").unwrap();
        assert!(rx.try_recv().is_err());
        sequencer.accept(0, "a").unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), (0, "a"));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), (1, "b"));
        sequencer.shutdown();
    }

    #[test]
    fn discards_stale_duplicate() {
        let (tx, rx) = mpsc::channel();
        let on_deliver: Arc<dyn Fn(u32, &'static str) + Send + Sync> = Arc::new(move |seq, item| {
            tx.send((seq, item)).unwrap();
        });
        let on_timeout: Arc<dyn Fn(u32) + Send + Sync> = Arc::new(|_| {});
        let sequencer = Sequencer::start(test_config(), 0, on_deliver, on_timeout);

        sequencer.accept(0, "a").unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        sequencer.accept(0, "a-dup").unwrap();
        assert!(rx.try_recv().is_err());
        sequencer.shutdown();
    }

    #[test]
    fn gap_timeout_fires_when_message_never_arrives() {
        let on_deliver: Arc<dyn Fn(u32, &'static str) + Send + Sync> = Arc::new(|_, _| {});
        let (tx, rx) = mpsc::channel();
        let on_timeout: Arc<dyn Fn(u32) + Send + Sync> = Arc::new(move |next_expected| {
            let _ = tx.send(next_expected);
        });
        let sequencer = Sequencer::start(test_config(), 0, on_deliver, on_timeout);

        sequencer.accept(1, "b").unwrap();
        let next_expected = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(next_expected, 0);
        sequencer.shutdown();
    }

    /// A collaborator that never calls `skip_to`/`reset` from
    /// `on_gap_timeout` must still see the gap timer re-arm at
    /// `gap_timeout` intervals rather than spin the worker thread.
    #[test]
    fn gap_timeout_rearms_instead_of_spinning_when_callback_does_not_clear_gap() {
        let on_deliver: Arc<dyn Fn(u32, &'static str) + Send + Sync> = Arc::new(|_, _| {});
        let fires = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fires_clone = fires.clone();
        let on_timeout: Arc<dyn Fn(u32) + Send + Sync> = Arc::new(move |_| {
            fires_clone.fetch_add(1, Ordering::SeqCst);
        });
        let config = SequencerConfig { max_buffered: 8, gap_timeout_ms: 20 };
        let sequencer = Sequencer::start(config, 0, on_deliver, on_timeout);

        sequencer.accept(1, "b").unwrap();
        std::thread::sleep(Duration::from_millis(220));
        sequencer.shutdown();

        // Over ~220ms with a 20ms gap timeout and a callback that never
        // clears the gap, a correctly re-arming timer fires on the order
        // of 220/20 ≈ 11 times; a spinning loop would fire many thousands
        // of times in the same window.
        assert!(fires.load(Ordering::SeqCst) < 100, "fired {} times, looks like a spin", fires.load(Ordering::SeqCst));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        // Spec §8 universal property: for any permutation of messages with
        // monotone sequence numbers 0..N-1 injected into a sequencer of
        // capacity C >= N, the emit order is 0,1,...,N-1 and each is
        // emitted exactly once.
        #[test]
        fn permutation_of_monotone_sequence_emits_in_order(seed in any::<u64>(), n in 1usize..16) {
            use rand::seq::SliceRandom;
            use rand::SeedableRng;

            let mut order: Vec<u32> = (0..n as u32).collect();
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            order.shuffle(&mut rng);

            let delivered = Arc::new(parking_lot::Mutex::new(Vec::new()));
            let delivered_clone = delivered.clone();
            let on_deliver: Arc<dyn Fn(u32, u32) + Send + Sync> = Arc::new(move |seq, item| {
                delivered_clone.lock().push((seq, item));
            });
            let on_timeout: Arc<dyn Fn(u32) + Send + Sync> = Arc::new(|_| {});
            let config = SequencerConfig { max_buffered: n.max(1), gap_timeout_ms: 5_000 };
            let sequencer = Sequencer::start(config, 0, on_deliver, on_timeout);

            for seq in &order {
                sequencer.accept(*seq, *seq).unwrap();
            }
            sequencer.shutdown();

            let got = delivered.lock().clone();
            let expected: Vec<(u32, u32)> = (0..n as u32).map(|i| (i, i)).collect();
            prop_assert_eq!(got, expected);
        }
    }
}
