use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::time::Duration;

use super::layout::{IndexCell, RingCursor};
use crate::Core::futex;

/// A bounded, lock-free, multi-producer multi-consumer ring of chunk indices.
///
/// Like the queue itself this is NOT stored in shared memory. It is a transient
/// view holding pointers into a mapped segment.
///
/// ### Concurrency Design:
/// - **Push**: claim a position by CAS on `tail`; the target cell is free when
///   its `sequence` equals the position. Publishing stores `pos + 1`.
/// - **Pop**: claim a position by CAS on `head`; the cell is ready when its
///   `sequence` equals `pos + 1`. Releasing stores `pos + capacity`.
pub struct IndexRing {
    pub(crate) cursor: *const RingCursor,
    pub(crate) cells: *const IndexCell,
    pub(crate) capacity: usize,
    pub(crate) mask: usize,
}

unsafe impl Send for IndexRing {}
unsafe impl Sync for IndexRing {}

impl IndexRing {
    /// Create a ring view over existing memory.
    ///
    /// # Safety
    /// `cursor` and `cells` must point into a mapping that outlives the view,
    /// with room for `capacity` cells. `capacity` must be a power of two.
    pub unsafe fn new(cursor: *const RingCursor, cells: *const IndexCell, capacity: usize) -> Self {
        Self {
            cursor,
            cells,
            capacity,
            mask: capacity - 1,
        }
    }

    /// Reset cell sequence numbers to k for k in 0..capacity.
    /// This should ONLY be called by the creator process, before any peer attaches.
    ///
    /// # Safety
    /// Caller guarantees no other thread or process is using the ring.
    pub unsafe fn init(&self) {
        let cursor = &*self.cursor;
        cursor.tail.store(0, Relaxed);
        cursor.head.store(0, Relaxed);
        cursor.signal.store(0, Relaxed);
        for k in 0..self.capacity {
            (*self.cells.add(k)).sequence.store(k as u64, Relaxed);
        }
    }

    #[inline]
    fn cursor(&self) -> &RingCursor {
        unsafe { &*self.cursor }
    }

    #[inline]
    fn cell(&self, pos: u64) -> &IndexCell {
        unsafe { &*self.cells.add((pos as usize) & self.mask) }
    }

    /// Push an index. Returns false if the ring is full.
    pub fn push(&self, index: u32) -> bool {
        let tail_atomic = &self.cursor().tail;

        loop {
            let tail = tail_atomic.load(Relaxed);
            let cell = self.cell(tail);
            let seq = cell.sequence.load(Acquire);
            let dif = seq as i64 - tail as i64;

            if dif == 0 {
                if tail_atomic
                    .compare_exchange_weak(tail, tail + 1, AcqRel, Relaxed)
                    .is_ok()
                {
                    cell.index.store(index, Relaxed);
                    cell.sequence.store(tail + 1, Release);
                    return true;
                }
            } else if dif < 0 {
                // full
                return false;
            } else {
                // another pusher moved tail; retry
                std::hint::spin_loop();
            }
        }
    }

    /// Pop an index. Returns None if the ring is empty.
    pub fn pop(&self) -> Option<u32> {
        let head_atomic = &self.cursor().head;

        loop {
            let head = head_atomic.load(Relaxed);
            let cell = self.cell(head);
            let seq = cell.sequence.load(Acquire);
            let dif = seq as i64 - (head as i64 + 1);

            if dif == 0 {
                if head_atomic
                    .compare_exchange_weak(head, head + 1, AcqRel, Relaxed)
                    .is_ok()
                {
                    let index = cell.index.load(Relaxed);
                    // free the cell for future pushers
                    cell.sequence.store(head + self.capacity as u64, Release);
                    return Some(index);
                }
            } else if dif < 0 {
                // empty
                return None;
            } else {
                // pusher not finished; retry
                std::hint::spin_loop();
            }
        }
    }

    /// Number of indices currently queued. Racy; for diagnostics only.
    pub fn len(&self) -> usize {
        let cursor = self.cursor();
        let tail = cursor.tail.load(Acquire);
        let head = cursor.head.load(Acquire);
        tail.saturating_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current value of the futex word. Load it BEFORE trying to pop so a push
    /// landing between the failed pop and the wait is not missed.
    #[inline]
    pub fn signal_value(&self) -> u32 {
        self.cursor().signal.load(Acquire)
    }

    /// Wake everyone sleeping on this ring.
    pub fn notify(&self) {
        let signal = &self.cursor().signal;
        signal.fetch_add(1, Release);
        futex::futex_wake_all(signal);
    }

    /// Sleep until the futex word moves away from `observed` or `timeout` elapses.
    pub fn wait(&self, observed: u32, timeout: Option<Duration>) {
        futex::futex_wait(&self.cursor().signal, observed, timeout);
    }
}
