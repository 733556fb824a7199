// Part of antctl. Copyright 2022-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Lock-free hand-off between the cycle thread and operator threads.
//!
//! Two primitives cover all cross-thread traffic: a single-writer seqlock
//! for the status snapshot (writer never blocks, readers retry on a torn
//! read) and a latest-wins intent slot per axis built on top of it.  The
//! cycle thread never takes a lock and never allocates here.

use std::cell::UnsafeCell;
use std::hint;
use std::ptr;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::types::{Intent, IntentKind};

/// Single-writer, multi-reader sequence lock around a `Copy` value.
///
/// The version counter is odd while a write is in flight.  Readers spin
/// until they observe the same even version on both sides of their copy.
/// Only one thread may ever call [`SeqLock::write`]; the cycle engine is
/// that thread for the status instance, the operator thread for each
/// intent slot.
pub struct SeqLock<T> {
    version: CachePadded<AtomicU64>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Copy + Send> Send for SeqLock<T> {}
unsafe impl<T: Copy + Send> Sync for SeqLock<T> {}

impl<T: Copy> SeqLock<T> {
    pub fn new(value: T) -> Self {
        SeqLock {
            version: CachePadded::new(AtomicU64::new(0)),
            data: UnsafeCell::new(value),
        }
    }

    /// Publish a new value.  Must only be called from the single writer
    /// thread; concurrent writers would corrupt the version protocol.
    pub fn write(&self, value: T) {
        let v = self.version.load(Ordering::Relaxed);
        self.version.store(v.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        unsafe { ptr::write_volatile(self.data.get(), value) };
        self.version.store(v.wrapping_add(2), Ordering::Release);
    }

    /// Copy out the latest consistent value.  Lock-free for the writer;
    /// the reader retries while a write is in flight.
    pub fn read(&self) -> T {
        loop {
            let v1 = self.version.load(Ordering::Acquire);
            if v1 & 1 == 0 {
                let value = unsafe { ptr::read_volatile(self.data.get()) };
                fence(Ordering::Acquire);
                if self.version.load(Ordering::Relaxed) == v1 {
                    return value;
                }
            }
            hint::spin_loop();
        }
    }

    /// Number of completed publications.
    pub fn updates(&self) -> u64 {
        self.version.load(Ordering::Acquire) / 2
    }
}

/// Latest-wins operator intent slot for one axis (single producer, single
/// consumer).  Posting supersedes any unconsumed intent; the consumer keys
/// freshness off the monotonic sequence number.
pub struct IntentSlot {
    slot: SeqLock<Intent>,
    next_seq: AtomicU64,
}

impl IntentSlot {
    pub fn new() -> Self {
        IntentSlot {
            slot: SeqLock::new(Intent::default()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Post an intent, stamping it with the next sequence number, which is
    /// returned to the producer.
    pub fn post(&self, mut intent: Intent) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        intent.seq = seq;
        self.slot.write(intent);
        seq
    }

    /// The newest posted intent, if it is fresher than `consumed_seq`.
    /// The consumer tracks consumed sequence numbers itself, which keeps
    /// this side read-only and the "never consumed twice" invariant local
    /// to one thread.
    pub fn fresher_than(&self, consumed_seq: u64) -> Option<Intent> {
        let intent = self.slot.read();
        (intent.seq > consumed_seq && intent.kind != IntentKind::None).then_some(intent)
    }
}

impl Default for IntentSlot {
    fn default() -> Self {
        Self::new()
    }
}
