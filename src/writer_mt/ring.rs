//! Fixed-size ring of record slots shared by the filler (producer),
//! compressor threads, and the writer thread.
//!
//! A disruptor normally sequences producer/consumer access with bare
//! atomics and store-release/acquire-load pairs. Here the whole ring is
//! instead guarded by one [`Mutex`]: contention is low (each slot is
//! touched by exactly one thread at a time by construction of the state
//! machine below) and it keeps the hand-rolled ring free of `unsafe`,
//! matching how this crate's other shared mutable state
//! (jobs/compressed-file lists) is protected.

use std::collections::BTreeSet;
use std::sync::Mutex;

use derivative::Derivative;

use crate::compressor::CompressionType;
use crate::error::{HipoError, Result};
use crate::record::header::ByteOrder;
use crate::record::output::RecordOutput;

use super::wait::WaitStrategy;

/// One ring slot: an owned [`RecordOutput`] plus the bytes it built on
/// its last `build()` call (kept separate so the writer thread can read
/// them without re-invoking the compressor).
pub struct RecordRingItem {
    pub output: RecordOutput,
    built: Vec<u8>,
    built_event_count: u32,
}

impl std::fmt::Debug for RecordRingItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordRingItem")
            .field("output", &self.output)
            .field("built_len", &self.built.len())
            .finish()
    }
}

impl RecordRingItem {
    fn new(byte_order: ByteOrder) -> Self {
        Self {
            output: RecordOutput::new(byte_order, CompressionType::None),
            built: Vec::new(),
            built_event_count: 0,
        }
    }
}

/// Per-slot lifecycle. `Compressing`/`Writing` are transient markers
/// held only while that slot's mutex-guarded section executes;
/// observers only ever see the other four.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty,
    Filling,
    Full,
    Compressing,
    Compressed,
    Writing,
    Released,
}

/// Tracks compressor completions that may land out of order across N
/// compressor threads, exposing only the contiguous prefix a
/// thread-safe `release_writer` can safely hand to the writer thread.
#[derive(Debug, Default)]
struct ReleaseTracker {
    last_released: i64,
    pending: BTreeSet<u64>,
}

impl ReleaseTracker {
    fn release(&mut self, seq: u64) {
        self.pending.insert(seq);
        let mut next = (self.last_released + 1) as u64;
        while self.pending.remove(&next) {
            self.last_released = next as i64;
            next += 1;
        }
    }
}

struct Inner {
    slots: Vec<RecordRingItem>,
    slot_state: Vec<SlotState>,
    released: ReleaseTracker,
    /// Set by [`RecordSupply::close_producer`] once the producer has
    /// published its last sequence; lets consumers stop waiting for work
    /// that will never arrive instead of blocking forever.
    total_published: Option<u64>,
    alerted: bool,
    error_message: Option<String>,
    disk_full: bool,
}

/// The shared ring. Cheap to share behind an `Arc`; all mutation goes
/// through the single internal mutex.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RecordSupply {
    mask: u64,
    compressor_threads: u64,
    compression_type: CompressionType,
    #[derivative(Debug = "ignore")]
    wait_strategy: Box<dyn WaitStrategy>,
    #[derivative(Debug = "ignore")]
    inner: Mutex<Inner>,
}

impl RecordSupply {
    pub fn new(
        ring_size: usize,
        compressor_threads: usize,
        byte_order: ByteOrder,
        compression_type: CompressionType,
        wait_strategy: Box<dyn WaitStrategy>,
    ) -> Result<Self> {
        if ring_size == 0 || !ring_size.is_power_of_two() || ring_size < compressor_threads {
            return Err(HipoError::BadHeader(format!(
                "ring_size {ring_size} must be a power of two >= compressor_threads {compressor_threads}"
            )));
        }
        let slots = (0..ring_size).map(|_| RecordRingItem::new(byte_order)).collect();
        let slot_state = vec![SlotState::Empty; ring_size];
        Ok(Self {
            mask: ring_size as u64 - 1,
            compressor_threads: compressor_threads as u64,
            compression_type,
            wait_strategy,
            inner: Mutex::new(Inner {
                slots,
                slot_state,
                released: ReleaseTracker::default(),
                total_published: None,
                alerted: false,
                error_message: None,
                disk_full: false,
            }),
        })
    }

    pub fn compressor_threads(&self) -> u64 {
        self.compressor_threads
    }

    fn idx(&self, seq: u64) -> usize {
        (seq & self.mask) as usize
    }

    fn alerted_err(&self, inner: &Inner) -> HipoError {
        HipoError::Alerted(inner.error_message.clone().unwrap_or_default())
    }

    /// Producer: block until slot `seq` is free, reset it, and mark it
    /// `Filling`.
    pub fn get(&self, seq: u64) -> Result<()> {
        let idx = self.idx(seq);
        let mut guard = self.inner.lock().unwrap();
        loop {
            if guard.alerted {
                return Err(self.alerted_err(&guard));
            }
            if guard.disk_full {
                drop(guard);
                self.wait_strategy.park();
                guard = self.inner.lock().unwrap();
                continue;
            }
            if matches!(guard.slot_state[idx], SlotState::Empty | SlotState::Released) {
                guard.slots[idx].output.reset();
                guard.slots[idx].built.clear();
                guard.slot_state[idx] = SlotState::Filling;
                return Ok(());
            }
            drop(guard);
            self.wait_strategy.park();
            guard = self.inner.lock().unwrap();
        }
    }

    pub fn with_slot<T>(&self, seq: u64, f: impl FnOnce(&mut RecordRingItem) -> T) -> T {
        let idx = self.idx(seq);
        let mut guard = self.inner.lock().unwrap();
        f(&mut guard.slots[idx])
    }

    /// Producer: mark slot `seq` ready for a compressor.
    pub fn publish(&self, seq: u64) {
        let idx = self.idx(seq);
        let mut guard = self.inner.lock().unwrap();
        guard.slot_state[idx] = SlotState::Full;
    }

    /// Tell consumers the final sequence count so they can stop waiting
    /// for a publish that will never come.
    pub fn close_producer(&self, total_published: u64) {
        let mut guard = self.inner.lock().unwrap();
        guard.total_published = Some(total_published);
    }

    pub fn error_alert(&self, err: HipoError) {
        let mut guard = self.inner.lock().unwrap();
        if guard.error_message.is_none() {
            guard.error_message = Some(err.to_string());
        }
        guard.alerted = true;
    }

    pub fn take_error(&self) -> Option<String> {
        self.inner.lock().unwrap().error_message.clone()
    }

    pub fn set_disk_full(&self, value: bool) {
        self.inner.lock().unwrap().disk_full = value;
    }

    pub fn disk_full(&self) -> bool {
        self.inner.lock().unwrap().disk_full
    }

    /// Compress barrier: block until slot `seq` is `Full`, then claim it
    /// for compression. Returns `Ok(false)` if the producer is done and
    /// will never publish `seq`.
    fn wait_for_full(&self, seq: u64) -> Result<bool> {
        let idx = self.idx(seq);
        let mut guard = self.inner.lock().unwrap();
        loop {
            if guard.alerted {
                return Err(self.alerted_err(&guard));
            }
            if let Some(total) = guard.total_published {
                if seq >= total {
                    return Ok(false);
                }
            }
            if guard.disk_full {
                drop(guard);
                self.wait_strategy.park();
                guard = self.inner.lock().unwrap();
                continue;
            }
            if guard.slot_state[idx] == SlotState::Full {
                guard.slot_state[idx] = SlotState::Compressing;
                return Ok(true);
            }
            drop(guard);
            self.wait_strategy.park();
            guard = self.inner.lock().unwrap();
        }
    }

    fn compress_slot(&self, seq: u64) -> Result<()> {
        let idx = self.idx(seq);
        let mut guard = self.inner.lock().unwrap();
        let item = &mut guard.slots[idx];
        item.output.set_record_number((seq + 1) as u32);
        item.output.set_compression_type(self.compression_type);
        let event_count = item.output.event_count();
        let built = item.output.build()?;
        item.built.clear();
        item.built.extend_from_slice(built);
        item.built_event_count = event_count;
        guard.slot_state[idx] = SlotState::Compressed;
        log::debug!(
            "compressed record #{} ({event_count} events, {} bytes)",
            seq + 1,
            item.built.len()
        );
        Ok(())
    }

    fn release_compressed(&self, seq: u64) {
        let mut guard = self.inner.lock().unwrap();
        guard.released.release(seq);
    }

    /// One compressor thread's run loop. Thread `thread_index` of `n`
    /// owns residue class `thread_index, thread_index+n, ...` so that
    /// releasing one sequence always skips exactly the `n-1` slots it
    /// was never going to touch.
    pub fn run_compressor(&self, thread_index: u64, n: u64) {
        let mut seq = thread_index;
        loop {
            match self.wait_for_full(seq) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    self.error_alert(e);
                    return;
                }
            }
            if let Err(e) = self.compress_slot(seq) {
                self.error_alert(e);
                return;
            }
            self.release_compressed(seq);
            seq += n;
        }
    }

    /// Write barrier: block until slot `seq` is compressed and is part
    /// of the contiguous released prefix.
    fn wait_for_compressed(&self, seq: u64) -> Result<bool> {
        let idx = self.idx(seq);
        let mut guard = self.inner.lock().unwrap();
        loop {
            if guard.alerted {
                return Err(self.alerted_err(&guard));
            }
            if let Some(total) = guard.total_published {
                if seq >= total {
                    return Ok(false);
                }
            }
            if guard.slot_state[idx] == SlotState::Compressed && guard.released.last_released >= seq as i64 {
                return Ok(true);
            }
            drop(guard);
            self.wait_strategy.park();
            guard = self.inner.lock().unwrap();
        }
    }

    /// The single writer thread's run loop: writes built records to
    /// `dest` strictly in sequence order, appends `(length, entries)` to
    /// the trailer index, and frees each slot back to the producer. Hands
    /// `dest` back on both success and failure so the caller can still
    /// patch the file header (or close the handle) afterwards.
    pub fn run_writer<W: std::io::Write>(&self, mut dest: W) -> (W, Result<Vec<(u32, u32)>>) {
        let mut trailer_index = Vec::new();
        let mut seq = 0u64;
        loop {
            match self.wait_for_compressed(seq) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => return (dest, Err(e)),
            }
            let idx = self.idx(seq);
            let (bytes, event_count) = {
                let mut guard = self.inner.lock().unwrap();
                guard.slot_state[idx] = SlotState::Writing;
                let item = &guard.slots[idx];
                (item.built.clone(), item.built_event_count)
            };
            loop {
                match dest.write_all(&bytes) {
                    Ok(()) => {
                        if self.disk_full() {
                            self.set_disk_full(false);
                        }
                        break;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::StorageFull => {
                        log::warn!("disk full while writing record #{}, pausing", seq + 1);
                        self.set_disk_full(true);
                        self.wait_strategy.park();
                    }
                    Err(e) => {
                        let kind = e.kind();
                        let message = e.to_string();
                        self.error_alert(HipoError::Io(std::io::Error::new(kind, message.clone())));
                        return (dest, Err(HipoError::Io(std::io::Error::new(kind, message))));
                    }
                }
            }
            log::debug!("wrote record #{} ({event_count} events, {} bytes)", seq + 1, bytes.len());
            trailer_index.push((bytes.len() as u32, event_count));
            {
                let mut guard = self.inner.lock().unwrap();
                guard.slot_state[idx] = SlotState::Released;
            }
            seq += 1;
        }
        (dest, Ok(trailer_index))
    }
}
