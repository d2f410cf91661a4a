//! Lock-free 16 kHz PCM mic transport: one writer, many readers
//! (spec §4.5).
//!
//! The writer (the microphone capture callback) must never block. Readers
//! each track their own cursor into the monotonic word stream; a reader
//! that falls more than `data_size` words behind the writer has suffered
//! an overrun and is force-advanced to the oldest word still held, per the
//! documented overrun policy (spec §4.5 edge case, §9).
//!
//! The buffer is word-addressed (`data_size` words of `word_size` bytes
//! each) so a single ring can carry `i16` PCM samples, raw bytes, or any
//! other fixed-width word; `word_size == 1` gives the byte-ring most
//! callers in this crate actually want.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::CoreError;

/// Default bound on concurrent readers, per spec §4.5 ("tested at 8").
pub const DEFAULT_MAX_READERS: usize = 8;

/// Writer admission policy (spec §4.5 "Writer policies").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterPolicy {
    /// Always writes the full request, overwriting oldest data regardless
    /// of readers.
    Nonblockable,
    /// Writes only up to the space ahead of `oldest_unconsumed`; may write
    /// fewer words than requested, or zero.
    Nonblocking,
    /// Writes the full request or nothing; returns `RingWouldBlock` rather
    /// than partially overwrite unconsumed data.
    AllOrNothing,
}

/// A reader seek target (spec §4.5 "Seek semantics"). Offsets are in words,
/// relative to the named reference point.
#[derive(Debug, Clone, Copy)]
pub enum SeekTarget {
    AfterReader(usize),
    BeforeReader(usize),
    BeforeWriter(usize),
    Absolute(usize),
}

/// Cache-line padded to keep the writer's hot cursor off the readers'.
#[repr(align(64))]
struct ReaderSlot {
    cursor: AtomicUsize,
    enabled: AtomicBool,
    /// Word index past which this reader may never read (spec §4.5 seek
    /// edge case); `None` means unbounded.
    close_index: AtomicUsize,
    has_close_index: AtomicBool,
}

/// A single-writer, multi-reader ring of fixed-width words. `data_size`
/// (the word count) is rounded up to a power of two so indices can be
/// masked instead of taken modulo.
pub struct DataStreamRing {
    buffer: Box<[u8]>,
    word_size: usize,
    data_size: usize,
    mask: usize,
    max_readers: usize,
    writer_enabled: AtomicBool,
    write_start: AtomicUsize,
    write_end: AtomicUsize,
    next_reader_id: AtomicU64,
    readers: DashMap<u64, ReaderSlot>,
    /// Guards AllOrNothing writes against concurrent backward seeks, per
    /// spec §4.5 "Concurrency invariants".
    backward_seek_mutex: Mutex<()>,
}

impl DataStreamRing {
    /// Convenience constructor for a byte-addressed ring (`word_size = 1`)
    /// with the default reader bound — what most callers in this crate
    /// want for raw PCM byte transport.
    pub fn new(capacity_bytes: usize) -> Arc<Self> {
        Self::with_options(capacity_bytes, 1, DEFAULT_MAX_READERS)
    }

    /// Full constructor per spec §4.5's `{data_size, word_size, max_readers}`
    /// configuration.
    pub fn with_options(data_size: usize, word_size: usize, max_readers: usize) -> Arc<Self> {
        let data_size = data_size.max(1).next_power_of_two();
        let buffer = vec![0u8; data_size * word_size.max(1)].into_boxed_slice();
        Arc::new(DataStreamRing {
            buffer,
            word_size: word_size.max(1),
            data_size,
            mask: data_size - 1,
            max_readers: max_readers.max(1),
            writer_enabled: AtomicBool::new(true),
            write_start: AtomicUsize::new(0),
            write_end: AtomicUsize::new(0),
            next_reader_id: AtomicU64::new(0),
            readers: DashMap::new(),
            backward_seek_mutex: Mutex::new(()),
        })
    }

    pub fn word_size(&self) -> usize {
        self.word_size
    }

    /// Word capacity of the ring (`data_size` from spec §4.5).
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Byte capacity of the ring; kept for callers that think in bytes.
    pub fn capacity(&self) -> usize {
        self.data_size * self.word_size
    }

    /// Total words ever written, monotonically increasing.
    pub fn write_end(&self) -> usize {
        self.write_end.load(Ordering::Acquire)
    }

    /// Oldest word position still physically present in the buffer.
    pub fn write_start(&self) -> usize {
        self.write_start.load(Ordering::Acquire)
    }

    /// The minimum cursor across all enabled readers, or `write_start` if
    /// there are none — the position below which words are safe to
    /// overwrite. Only ever moves forward (spec §4.5).
    fn oldest_unconsumed(&self) -> usize {
        let mut oldest: Option<usize> = None;
        for entry in self.readers.iter() {
            if entry.value().enabled.load(Ordering::Acquire) {
                let cursor = entry.value().cursor.load(Ordering::Acquire);
                oldest = Some(oldest.map_or(cursor, |o: usize| o.min(cursor)));
            }
        }
        oldest.unwrap_or_else(|| self.write_start())
    }

    fn advance_write_end(&self, new_write_end: usize) {
        self.write_end.store(new_write_end, Ordering::Release);
        let floor = new_write_end.saturating_sub(self.data_size);
        // write_start only ever advances; never move it back.
        let _ = self.write_start.fetch_max(floor, Ordering::AcqRel);
    }

    /// Raw word copy into the ring buffer at a given absolute word cursor.
    /// SAFETY: caller guarantees single-writer access (only the writer
    /// mutates buffer contents; readers only copy out).
    fn copy_in(&self, start_word: usize, words: &[u8]) {
        let n = words.len() / self.word_size;
        for i in 0..n {
            let idx = (start_word + i) & self.mask;
            let src = &words[i * self.word_size..(i + 1) * self.word_size];
            unsafe {
                let ptr = self.buffer.as_ptr() as *mut u8;
                std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.add(idx * self.word_size), self.word_size);
            }
        }
    }

    /// Writer-side append using the caller's chosen admission policy
    /// (spec §4.5 "Writer policies"). `data` is a byte slice whose length
    /// must be a multiple of `word_size`; backward-compatible byte rings
    /// (`word_size == 1`) take any length.
    pub fn write_with_policy(&self, data: &[u8], policy: WriterPolicy) -> Result<usize, CoreError> {
        if data.len() % self.word_size != 0 {
            return Err(CoreError::RingInvalid(format!(
                "write of {} bytes is not a multiple of word_size {}",
                data.len(),
                self.word_size
            )));
        }
        let requested_words = data.len() / self.word_size;

        match policy {
            WriterPolicy::Nonblockable => {
                // Oversize requests keep only the trailing data_size words.
                let (words, n) = if requested_words > self.data_size {
                    let drop_words = requested_words - self.data_size;
                    (&data[drop_words * self.word_size..], self.data_size)
                } else {
                    (data, requested_words)
                };
                let write_end = self.write_end.load(Ordering::Relaxed);
                self.copy_in(write_end, words);
                self.advance_write_end(write_end + n);
                Ok(n)
            }
            WriterPolicy::Nonblocking => {
                let write_end = self.write_end.load(Ordering::Relaxed);
                let headroom = self.data_size.saturating_sub(write_end.saturating_sub(self.oldest_unconsumed()));
                let n = requested_words.min(headroom);
                if n == 0 {
                    return Ok(0);
                }
                self.copy_in(write_end, &data[..n * self.word_size]);
                self.advance_write_end(write_end + n);
                Ok(n)
            }
            WriterPolicy::AllOrNothing => {
                let _guard = self.backward_seek_mutex.lock();
                let (words, n) = if requested_words > self.data_size {
                    let drop_words = requested_words - self.data_size;
                    (&data[drop_words * self.word_size..], self.data_size)
                } else {
                    (data, requested_words)
                };
                let write_end = self.write_end.load(Ordering::Relaxed);
                let headroom = self.data_size.saturating_sub(write_end.saturating_sub(self.oldest_unconsumed()));
                if n > headroom {
                    return Err(CoreError::RingWouldBlock);
                }
                self.copy_in(write_end, words);
                self.advance_write_end(write_end + n);
                Ok(n)
            }
        }
    }

    /// Backward-compatible entry point: `Nonblockable` policy, but rejects
    /// (rather than truncates) a request that can never fit. Most callers
    /// in this crate (mic capture, decoded speaker frames) want this.
    pub fn write(&self, data: &[u8]) -> Result<usize, CoreError> {
        if data.len() > self.capacity() {
            return Err(CoreError::RingInvalid(format!(
                "write of {} bytes exceeds ring capacity {}",
                data.len(),
                self.capacity()
            )));
        }
        self.write_with_policy(data, WriterPolicy::Nonblockable)
    }

    /// Disables the writer (spec §4.5 "Closed"): once all buffered data is
    /// drained, readers observe `Closed` instead of `WouldBlock`.
    pub fn disable_writer(&self) {
        self.writer_enabled.store(false, Ordering::Release);
    }

    fn writer_enabled(&self) -> bool {
        self.writer_enabled.load(Ordering::Acquire)
    }

    /// Registers a new reader starting at the current write position.
    /// Returns `None` if `max_readers` is already attached.
    pub fn register_reader(self: &Arc<Self>) -> RingReader {
        self.try_register_reader().expect("max_readers exceeded")
    }

    pub fn try_register_reader(self: &Arc<Self>) -> Option<RingReader> {
        if self.readers.len() >= self.max_readers {
            return None;
        }
        let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
        let start = self.write_end();
        self.readers.insert(
            id,
            ReaderSlot {
                cursor: AtomicUsize::new(start),
                enabled: AtomicBool::new(true),
                close_index: AtomicUsize::new(0),
                has_close_index: AtomicBool::new(false),
            },
        );
        Some(RingReader { ring: self.clone(), id })
    }
}

/// A reader handle into a [`DataStreamRing`]. Dropping it deregisters the
/// reader so it no longer holds back `oldest_unconsumed`.
pub struct RingReader {
    ring: Arc<DataStreamRing>,
    id: u64,
}

impl RingReader {
    fn cursor(&self) -> usize {
        self.ring.readers.get(&self.id).map(|s| s.cursor.load(Ordering::Acquire)).unwrap_or(0)
    }

    fn close_index(&self) -> Option<usize> {
        self.ring.readers.get(&self.id).and_then(|s| {
            if s.has_close_index.load(Ordering::Acquire) {
                Some(s.close_index.load(Ordering::Acquire))
            } else {
                None
            }
        })
    }

    /// Word offset into the stream this reader has consumed up to.
    pub fn position(&self) -> usize {
        self.cursor()
    }

    pub fn set_enabled(&self, enabled: bool) {
        if let Some(slot) = self.ring.readers.get(&self.id) {
            slot.enabled.store(enabled, Ordering::Release);
        }
    }

    /// Bounds this reader to never read past `index` (spec §4.5 seek
    /// edge case). Pass `None` to clear the bound.
    pub fn set_close_index(&self, index: Option<usize>) {
        if let Some(slot) = self.ring.readers.get(&self.id) {
            match index {
                Some(idx) => {
                    slot.close_index.store(idx, Ordering::Release);
                    slot.has_close_index.store(true, Ordering::Release);
                }
                None => slot.has_close_index.store(false, Ordering::Release),
            }
        }
    }

    fn store_cursor(&self, position: usize) {
        if let Some(slot) = self.ring.readers.get(&self.id) {
            slot.cursor.store(position, Ordering::Release);
        }
    }

    /// Unconditional reposition, clamped to the currently available
    /// window. Kept for callers (resync-on-overrun) that don't need the
    /// full failure-reporting `seek` surface.
    pub fn seek(&self, position: usize) {
        let clamped = position.clamp(self.ring.write_start(), self.ring.write_end());
        self.store_cursor(clamped);
    }

    /// Full seek surface (spec §4.5 "Seek semantics"). Fails with
    /// `RingInvalid` if the target is past the reader's close index, lands
    /// on data already overwritten, or lands before stream start.
    pub fn seek_to(&self, target: SeekTarget) -> Result<(), CoreError> {
        let is_backward = matches!(target, SeekTarget::BeforeReader(_) | SeekTarget::BeforeWriter(_));
        let _guard = if is_backward { Some(self.ring.backward_seek_mutex.lock()) } else { None };

        let write_start = self.ring.write_start();
        let write_end = self.ring.write_end();
        let cursor = self.cursor();

        let target_word = match target {
            SeekTarget::AfterReader(offset) => cursor.checked_add(offset),
            SeekTarget::BeforeReader(offset) => cursor.checked_sub(offset),
            SeekTarget::BeforeWriter(offset) => write_end.checked_sub(offset),
            SeekTarget::Absolute(offset) => Some(offset),
        };
        let target_word = match target_word {
            Some(w) => w,
            None => return Err(CoreError::RingInvalid("seek target underflows stream start".into())),
        };

        if target_word < write_start {
            return Err(CoreError::RingInvalid("seek target lands on data already overwritten".into()));
        }
        if target_word > write_end {
            return Err(CoreError::RingInvalid("seek target is before stream start".into()));
        }
        if let Some(close_index) = self.close_index() {
            if target_word > close_index {
                return Err(CoreError::RingInvalid("seek target is past the reader's close index".into()));
            }
        }

        self.store_cursor(target_word);
        Ok(())
    }

    /// Non-blocking read of up to `out.len() / word_size` words. Returns
    /// `Ok(0)` if nothing is available and the writer is still enabled,
    /// `Err(RingClosed)` if the writer has been disabled and no data
    /// remains, or `Err(RingOverrun)` if the writer has advanced past this
    /// reader's oldest unread word — the cursor is force-advanced to the
    /// oldest word still held before returning the error, so the next call
    /// resumes cleanly.
    pub fn try_read(&self, out: &mut [u8]) -> Result<usize, CoreError> {
        if out.len() % self.ring.word_size != 0 {
            return Err(CoreError::RingInvalid(format!(
                "read buffer of {} bytes is not a multiple of word_size {}",
                out.len(),
                self.ring.word_size
            )));
        }

        let write_end = self.ring.write_end();
        let write_start = self.ring.write_start();
        let cursor = self.cursor();

        if cursor < write_start {
            self.seek(write_start);
            return Err(CoreError::RingOverrun);
        }

        let available_words = write_end.saturating_sub(cursor);
        if available_words == 0 {
            return if self.ring.writer_enabled() { Ok(0) } else { Err(CoreError::RingClosed) };
        }

        let requested_words = out.len() / self.ring.word_size;
        let to_read = requested_words.min(available_words);
        if to_read == 0 {
            return Ok(0);
        }

        for i in 0..to_read {
            let idx = (cursor + i) & self.ring.mask;
            let dst = &mut out[i * self.ring.word_size..(i + 1) * self.ring.word_size];
            dst.copy_from_slice(&self.ring.buffer[idx * self.ring.word_size..(idx + 1) * self.ring.word_size]);
        }

        self.store_cursor(cursor + to_read);
        Ok(to_read)
    }
}

impl Drop for RingReader {
    fn drop(&mut self) {
        self.ring.readers.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_reads_back_what_writer_wrote() {
        let ring = DataStreamRing::new(64);
        let reader = ring.register_reader();
        ring.write(&[1, 2, 3, 4]).unwrap();

        let mut out = [0u8; 4];
        let n = reader.try_read(&mut out).unwrap();
        assert_eq!(n, 4);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn read_with_nothing_available_returns_zero() {
        let ring = DataStreamRing::new(64);
        let reader = ring.register_reader();
        let mut out = [0u8; 4];
        assert_eq!(reader.try_read(&mut out).unwrap(), 0);
    }

    #[test]
    fn slow_reader_detects_overrun_and_resyncs() {
        let ring = DataStreamRing::new(8);
        let reader = ring.register_reader();

        ring.write(&[0; 8]).unwrap();
        ring.write(&[0; 8]).unwrap();
        ring.write(&[0; 8]).unwrap();

        let mut out = [0u8; 4];
        let err = reader.try_read(&mut out).unwrap_err();
        assert!(matches!(err, CoreError::RingOverrun));

        // Resynced to the oldest byte still held; a subsequent read works.
        let n = reader.try_read(&mut out).unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn disabled_reader_does_not_hold_back_oldest_unconsumed() {
        let ring = DataStreamRing::new(8);
        let slow_reader = ring.register_reader();
        slow_reader.set_enabled(false);

        ring.write(&[0; 8]).unwrap();
        ring.write(&[0; 8]).unwrap();

        assert_eq!(ring.oldest_unconsumed(), ring.write_start());
    }

    #[test]
    fn write_larger_than_capacity_is_rejected() {
        let ring = DataStreamRing::new(8);
        let err = ring.write(&[0; 100]).unwrap_err();
        assert!(matches!(err, CoreError::RingInvalid(_)));
    }

    #[test]
    fn dropping_reader_deregisters_it() {
        let ring = DataStreamRing::new(8);
        {
            let _reader = ring.register_reader();
            assert_eq!(ring.readers.len(), 1);
        }
        assert_eq!(ring.readers.len(), 0);
    }

    #[test]
    fn nonblockable_oversize_write_keeps_trailing_window() {
        let ring = DataStreamRing::new(4);
        let n = ring.write_with_policy(&[1, 2, 3, 4, 5, 6], WriterPolicy::Nonblockable).unwrap();
        assert_eq!(n, 4);
        let reader = ring.register_reader();
        reader.seek(ring.write_start());
        let mut out = [0u8; 4];
        assert_eq!(reader.try_read(&mut out).unwrap(), 4);
        assert_eq!(out, [3, 4, 5, 6]);
    }

    #[test]
    fn nonblocking_write_is_bounded_by_oldest_unconsumed() {
        let ring = DataStreamRing::new(4);
        let reader = ring.register_reader();
        // Fill the ring completely; the reader hasn't consumed anything.
        let n = ring.write_with_policy(&[1, 2, 3, 4], WriterPolicy::Nonblocking).unwrap();
        assert_eq!(n, 4);
        // No headroom left: a further nonblocking write writes nothing.
        let n2 = ring.write_with_policy(&[5, 6], WriterPolicy::Nonblocking).unwrap();
        assert_eq!(n2, 0);

        let mut out = [0u8; 2];
        assert_eq!(reader.try_read(&mut out).unwrap(), 2);
        // Freed two words of headroom.
        let n3 = ring.write_with_policy(&[5, 6], WriterPolicy::Nonblocking).unwrap();
        assert_eq!(n3, 2);
    }

    #[test]
    fn all_or_nothing_rejects_when_it_would_overwrite_unconsumed_data() {
        let ring = DataStreamRing::new(4);
        let reader = ring.register_reader();
        ring.write_with_policy(&[1, 2, 3, 4], WriterPolicy::AllOrNothing).unwrap();

        let err = ring.write_with_policy(&[5, 6], WriterPolicy::AllOrNothing).unwrap_err();
        assert!(matches!(err, CoreError::RingWouldBlock));

        let mut out = [0u8; 4];
        assert_eq!(reader.try_read(&mut out).unwrap(), 4);
        // Now there's room for the full request.
        let n = ring.write_with_policy(&[5, 6], WriterPolicy::AllOrNothing).unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn all_or_nothing_oversize_request_drops_leading_part() {
        let ring = DataStreamRing::new(4);
        let n = ring.write_with_policy(&[1, 2, 3, 4, 5, 6, 7, 8], WriterPolicy::AllOrNothing).unwrap();
        assert_eq!(n, 4);
        let reader = ring.register_reader();
        reader.seek(ring.write_start());
        let mut out = [0u8; 4];
        reader.try_read(&mut out).unwrap();
        assert_eq!(out, [5, 6, 7, 8]);
    }

    #[test]
    fn disabled_writer_signals_closed_once_drained() {
        let ring = DataStreamRing::new(8);
        let reader = ring.register_reader();
        ring.write(&[1, 2]).unwrap();
        ring.disable_writer();

        let mut out = [0u8; 2];
        assert_eq!(reader.try_read(&mut out).unwrap(), 2);
        let err = reader.try_read(&mut out).unwrap_err();
        assert!(matches!(err, CoreError::RingClosed));
    }

    #[test]
    fn seek_before_writer_repositions_relative_to_write_end() {
        let ring = DataStreamRing::new(16);
        let reader = ring.register_reader();
        ring.write(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        reader.seek_to(SeekTarget::BeforeWriter(4)).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(reader.try_read(&mut out).unwrap(), 4);
        assert_eq!(out, [5, 6, 7, 8]);
    }

    #[test]
    fn seek_absolute_before_stream_start_is_invalid() {
        let ring = DataStreamRing::new(4);
        let reader = ring.register_reader();
        ring.write(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let err = reader.seek_to(SeekTarget::Absolute(0)).unwrap_err();
        assert!(matches!(err, CoreError::RingInvalid(_)));
    }

    #[test]
    fn seek_past_close_index_is_rejected() {
        let ring = DataStreamRing::new(16);
        let reader = ring.register_reader();
        ring.write(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        reader.set_close_index(Some(2));
        let err = reader.seek_to(SeekTarget::Absolute(4)).unwrap_err();
        assert!(matches!(err, CoreError::RingInvalid(_)));
    }

    #[test]
    fn max_readers_bound_is_enforced() {
        let ring = DataStreamRing::with_options(8, 1, 2);
        let _a = ring.try_register_reader().unwrap();
        let _b = ring.try_register_reader().unwrap();
        assert!(ring.try_register_reader().is_none());
    }

    #[test]
    fn word_addressed_ring_moves_whole_words() {
        // word_size = 2 bytes (e.g. i16 PCM samples serialized as LE bytes).
        let ring = DataStreamRing::with_options(4, 2, DEFAULT_MAX_READERS);
        let reader = ring.register_reader();
        ring.write(&[0x01, 0x00, 0x02, 0x00]).unwrap(); // two words: 1, 2
        assert_eq!(ring.write_end(), 2);

        let mut out = [0u8; 4];
        assert_eq!(reader.try_read(&mut out).unwrap(), 2);
        assert_eq!(out, [0x01, 0x00, 0x02, 0x00]);
    }
}
