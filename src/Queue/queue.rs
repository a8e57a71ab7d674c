use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::layout::{
    MessageChunk, QueueHeader, SegmentLayout, CHUNK_SIZE, QUEUE_MAGIC, QUEUE_VERSION,
};
use super::ring::IndexRing;
use crate::error::QueueError;
use crate::Core::SharedMemory::{attach_shared_memory, create_shared_memory, SharedMemoryBackend};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Exclusive ownership of one chunk slot.
///
/// A handle is produced by `acquire_for_write` / `acquire_for_read` and consumed
/// by `post` / `return_chunk`. It cannot be cloned, so a slot cannot be posted or
/// returned twice through safe code.
#[must_use = "a chunk handle must be posted or returned, otherwise the slot leaks"]
pub struct ChunkHandle {
    pub(crate) index: u32,
    pub(crate) queue_id: u64,
}

impl ChunkHandle {
    /// Slot index of this chunk in its queue's arena.
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Snapshot of the process-local chunk counters of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub acquired_for_write: u64,
    pub posted: u64,
    pub acquired_for_read: u64,
    pub returned: u64,
}

#[derive(Default)]
struct QueueCounters {
    acquired_for_write: AtomicU64,
    posted: AtomicU64,
    acquired_for_read: AtomicU64,
    returned: AtomicU64,
}

/// One direction of a channel: a fixed arena of [`MessageChunk`] slots in a
/// named shared-memory segment plus two index rings.
///
/// ```text
///   writer: acquire_for_write ── free ring ──► fill ──► post ── posted ring ──►
///   reader: acquire_for_read ──► consume ──► return_chunk ──► free ring
/// ```
///
/// Both rings are multi-producer multi-consumer, so any number of sender threads
/// may acquire and post concurrently.
pub struct SharedMessageQueue {
    shm: Box<dyn SharedMemoryBackend>,
    header: *mut QueueHeader,
    posted: IndexRing,
    free: IndexRing,
    chunks: *mut MessageChunk,
    slot_count: u32,
    queue_id: u64,
    counters: QueueCounters,
    // process-local: only the reader in this process observes it
    stop_requested: AtomicBool,
}

// The raw pointers target the mapping owned by `shm`; all shared state is atomic
unsafe impl Send for SharedMessageQueue {}
unsafe impl Sync for SharedMessageQueue {}

impl SharedMessageQueue {
    /// Create the segment `name` with `slot_count` chunks, all of them free.
    pub fn create(name: &str, slot_count: usize) -> io::Result<Self> {
        if slot_count == 0 || (slot_count & (slot_count - 1)) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Slot count must be a power of two and greater than zero",
            ));
        }
        if slot_count >= u32::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Slot count {} does not fit a chunk index", slot_count),
            ));
        }

        let layout = SegmentLayout::for_slots(slot_count);
        let shm = create_shared_memory(layout.total, name).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!(
                    "Failed to create queue segment:\n\
                    ├─ Name:        {name}\n\
                    ├─ Slots:       {slot_count}\n\
                    ├─ Total size:  {}\n\
                    ╰─ Error: {e}",
                    layout.total
                ),
            )
        })?;

        let header = shm.as_ptr() as *mut QueueHeader;
        unsafe {
            (*header).magic = QUEUE_MAGIC;
            (*header).version = QUEUE_VERSION;
            (*header).slot_count = slot_count as u32;
            (*header).chunk_size = CHUNK_SIZE as u32;
            (*header).reserved = 0;
        }

        let queue = unsafe { Self::from_mapping(shm, header, slot_count, layout) };

        // Initialize rings and chunk links (only done by creator)
        unsafe {
            queue.posted.init();
            queue.free.init();
            for k in 0..slot_count {
                (*queue.chunks.add(k)).reset();
            }
        }
        for k in 0..slot_count as u32 {
            if !queue.free.push(k) {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "Free ring rejected an initial slot",
                ));
            }
        }

        tracing::debug!(queue = %name, slots = slot_count, bytes = layout.total, "queue segment created");
        Ok(queue)
    }

    /// Attach to a segment created by the peer.
    pub fn attach(name: &str) -> io::Result<Self> {
        let min_required_size = std::mem::size_of::<QueueHeader>();
        let shm = attach_shared_memory(name, min_required_size)?;
        let header = shm.as_ptr() as *mut QueueHeader;

        let slot_count = unsafe {
            if (*header).magic != QUEUE_MAGIC {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Invalid magic number - queue segment not properly initialized",
                ));
            }
            if (*header).version != QUEUE_VERSION {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "Queue layout version mismatch: expected {}, got {}",
                        QUEUE_VERSION,
                        (*header).version
                    ),
                ));
            }
            if (*header).chunk_size as usize != CHUNK_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "Chunk size mismatch: expected {}, got {}",
                        CHUNK_SIZE,
                        (*header).chunk_size
                    ),
                ));
            }
            (*header).slot_count as usize
        };

        if slot_count == 0 || (slot_count & (slot_count - 1)) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Corrupt slot count {}", slot_count),
            ));
        }

        let layout = SegmentLayout::for_slots(slot_count);
        if shm.size() < layout.total {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Queue segment too small: expected {}, got {}",
                    layout.total,
                    shm.size()
                ),
            ));
        }

        tracing::debug!(queue = %name, slots = slot_count, "queue segment attached");
        Ok(unsafe { Self::from_mapping(shm, header, slot_count, layout) })
    }

    unsafe fn from_mapping(
        shm: Box<dyn SharedMemoryBackend>,
        header: *mut QueueHeader,
        slot_count: usize,
        layout: SegmentLayout,
    ) -> Self {
        let base = shm.as_ptr();
        let posted = IndexRing::new(
            &(*header).posted,
            base.add(layout.posted_cells) as *const _,
            slot_count,
        );
        let free = IndexRing::new(
            &(*header).free,
            base.add(layout.free_cells) as *const _,
            slot_count,
        );
        let chunks = base.add(layout.chunks) as *mut MessageChunk;

        Self {
            shm,
            header,
            posted,
            free,
            chunks,
            slot_count: slot_count as u32,
            queue_id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            counters: QueueCounters::default(),
            stop_requested: AtomicBool::new(false),
        }
    }

    /// Take a free chunk without blocking. The chunk header is cleared.
    pub fn try_acquire_for_write(&self) -> Result<ChunkHandle, QueueError> {
        match self.free.pop() {
            Some(index) => self.grant_for_write(index),
            None => Err(QueueError::Full(self.name().to_string())),
        }
    }

    /// Take a free chunk, sleeping until the reader returns one.
    pub fn acquire_for_write(&self) -> Result<ChunkHandle, QueueError> {
        let index = self.pop_blocking(&self.free, None, false)?;
        self.grant_for_write(index)
    }

    /// Like [`acquire_for_write`](Self::acquire_for_write) but gives up after `timeout`.
    pub fn acquire_for_write_timeout(&self, timeout: Duration) -> Result<ChunkHandle, QueueError> {
        let index = self.pop_blocking(&self.free, Some(timeout), false)?;
        self.grant_for_write(index)
    }

    fn grant_for_write(&self, index: u32) -> Result<ChunkHandle, QueueError> {
        let mut handle = self.handle_for(index)?;
        self.chunk_mut(&mut handle).reset();
        self.counters.acquired_for_write.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    /// Publish a written chunk to the reader. Ownership passes to the peer.
    pub fn post(&self, handle: ChunkHandle) -> Result<(), QueueError> {
        self.check(&handle)?;
        if !self.posted.push(handle.index) {
            return Err(QueueError::Full(self.name().to_string()));
        }
        self.counters.posted.fetch_add(1, Ordering::Relaxed);
        self.posted.notify();
        Ok(())
    }

    /// Take the next posted chunk, sleeping until one arrives.
    ///
    /// Fails with `Stopped` once after [`request_stop`](Self::request_stop).
    pub fn acquire_for_read(&self) -> Result<ChunkHandle, QueueError> {
        let index = self.pop_blocking(&self.posted, None, true)?;
        self.grant_for_read(index)
    }

    /// Take the next posted chunk, or `None` if nothing arrived within `timeout`.
    pub fn acquire_for_read_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<ChunkHandle>, QueueError> {
        match self.pop_blocking(&self.posted, Some(timeout), true) {
            Ok(index) => self.grant_for_read(index).map(Some),
            Err(QueueError::TimedOut(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn grant_for_read(&self, index: u32) -> Result<ChunkHandle, QueueError> {
        let handle = self.handle_for(index)?;
        self.counters.acquired_for_read.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    /// Give a consumed chunk back to the writer's free pool.
    pub fn return_chunk(&self, handle: ChunkHandle) -> Result<(), QueueError> {
        self.check(&handle)?;
        if !self.free.push(handle.index) {
            return Err(QueueError::Full(self.name().to_string()));
        }
        self.counters.returned.fetch_add(1, Ordering::Relaxed);
        self.free.notify();
        Ok(())
    }

    /// Wake this process's reader without a chunk: its next (or current)
    /// blocking read fails with `Stopped`. For when no free chunk is left to
    /// carry a stop sentinel.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.posted.notify();
    }

    fn pop_blocking(
        &self,
        ring: &IndexRing,
        timeout: Option<Duration>,
        stoppable: bool,
    ) -> Result<u32, QueueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let observed = ring.signal_value();
            if stoppable && self.stop_requested.swap(false, Ordering::AcqRel) {
                return Err(QueueError::Stopped(self.name().to_string()));
            }
            if let Some(index) = ring.pop() {
                return Ok(index);
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(QueueError::TimedOut(self.name().to_string()));
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            ring.wait(observed, remaining);
        }
    }

    fn handle_for(&self, index: u32) -> Result<ChunkHandle, QueueError> {
        if index >= self.slot_count {
            return Err(QueueError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Ring of `{}` yielded slot {} beyond {} slots",
                    self.name(),
                    index,
                    self.slot_count
                ),
            )));
        }
        Ok(ChunkHandle {
            index,
            queue_id: self.queue_id,
        })
    }

    fn check(&self, handle: &ChunkHandle) -> Result<(), QueueError> {
        if handle.queue_id != self.queue_id || handle.index >= self.slot_count {
            return Err(QueueError::ForeignHandle {
                index: handle.index,
                queue: self.name().to_string(),
            });
        }
        Ok(())
    }

    /// Read access to the chunk a handle owns.
    pub fn chunk(&self, handle: &ChunkHandle) -> &MessageChunk {
        debug_assert_eq!(handle.queue_id, self.queue_id, "chunk handle from another queue");
        debug_assert!(handle.index < self.slot_count);
        unsafe { &*self.chunks.add(handle.index as usize) }
    }

    /// Write access to the chunk a handle owns. The handle is the only path to
    /// this slot until it is posted or returned.
    #[allow(clippy::mut_from_ref)]
    pub fn chunk_mut(&self, handle: &mut ChunkHandle) -> &mut MessageChunk {
        debug_assert_eq!(handle.queue_id, self.queue_id, "chunk handle from another queue");
        debug_assert!(handle.index < self.slot_count);
        unsafe { &mut *self.chunks.add(handle.index as usize) }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            acquired_for_write: self.counters.acquired_for_write.load(Ordering::Relaxed),
            posted: self.counters.posted.load(Ordering::Relaxed),
            acquired_for_read: self.counters.acquired_for_read.load(Ordering::Relaxed),
            returned: self.counters.returned.load(Ordering::Relaxed),
        }
    }

    pub fn name(&self) -> &str {
        self.shm.name()
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count as usize
    }

    /// Chunks currently available to writers. Racy; for diagnostics only.
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Chunks posted and not yet taken by the reader. Racy; for diagnostics only.
    pub fn posted_len(&self) -> usize {
        self.posted.len()
    }

    pub fn header_ptr(&self) -> *const QueueHeader {
        self.header
    }
}
