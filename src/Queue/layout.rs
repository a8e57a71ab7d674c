use crossbeam_utils::CachePadded;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64};

/// Total bytes occupied by one chunk slot in shared memory.
pub const CHUNK_SIZE: usize = 1024;

/// Bytes of chaining metadata at the front of every chunk.
pub const CHUNK_HEADER_SIZE: usize = 16;

/// Payload bytes a single chunk can carry.
pub const CHUNK_DATA_SIZE: usize = CHUNK_SIZE - CHUNK_HEADER_SIZE;

/// Marks an unset `first` / `next` link.
pub const NIL_INDEX: u32 = u32::MAX;

pub const QUEUE_MAGIC: u64 = 0x5348_4D5F_5155_4555; // "SHM_QUEU"
pub const QUEUE_VERSION: u32 = 1;

/// Bit flags carried in [`MessageChunk::flag`].
pub struct ChunkFlags;

impl ChunkFlags {
    pub const NONE: u8 = 0x00;
    /// Final fragment of a logical message.
    pub const LAST_CHUNK: u8 = 0x01;
    /// The sender aborted the message with this id; discard what was received.
    pub const CANCEL: u8 = 0x02;
    /// Sentinel posted to a channel's own receive queue to end its loop.
    /// Compared for equality, never tested as a bit.
    pub const STOP: u8 = 0xFF;
}

/// One fragment of a logical message. Lives in shared memory and never moves;
/// it is addressed by its slot index in the queue's chunk arena.
///
/// `id`, `msg_type`, `flag` and `data_len` are written by the sender before the
/// chunk is posted. `first` and `next` are assigned by the receiver only, while
/// it reassembles the chain.
#[repr(C, align(64))]
pub struct MessageChunk {
    pub id: u32,
    pub msg_type: u8,
    pub flag: u8,
    pub data_len: u16,
    pub first: u32,
    pub next: u32,
    pub data: [u8; CHUNK_DATA_SIZE],
}

impl MessageChunk {
    #[inline]
    pub fn is_last(&self) -> bool {
        self.flag != ChunkFlags::STOP && self.flag & ChunkFlags::LAST_CHUNK != 0
    }

    #[inline]
    pub fn is_cancel(&self) -> bool {
        self.flag != ChunkFlags::STOP && self.flag & ChunkFlags::CANCEL != 0
    }

    #[inline]
    pub fn is_stop(&self) -> bool {
        self.flag == ChunkFlags::STOP
    }

    /// The valid payload bytes of this fragment.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        let len = (self.data_len as usize).min(CHUNK_DATA_SIZE);
        &self.data[..len]
    }

    /// Clear the header before the chunk is reused by a writer.
    pub(crate) fn reset(&mut self) {
        self.id = 0;
        self.msg_type = 0;
        self.flag = ChunkFlags::NONE;
        self.data_len = 0;
        self.first = NIL_INDEX;
        self.next = NIL_INDEX;
    }
}

/// Cursors of one index ring. Both rings of a queue (free list and posted list)
/// share this shape.
#[repr(C, align(128))]
pub struct RingCursor {
    /// Claimed by pushers. Padded to avoid false sharing with `head`.
    pub tail: CachePadded<AtomicU64>,

    /// Claimed by poppers.
    pub head: CachePadded<AtomicU64>,

    /// Futex word bumped on every push; poppers sleep on it.
    pub signal: AtomicU32,
}

/// One cell of an index ring.
#[repr(C)]
pub struct IndexCell {
    /// Sequence number driving the cell's state machine:
    /// `seq == pos` means free for a pusher at `pos`,
    /// `seq == pos + 1` means filled and ready for a popper at `pos`.
    pub sequence: AtomicU64,

    /// Chunk slot index stored in this cell.
    pub index: AtomicU32,

    pub _pad: u32,
}

/// Header at the very beginning of a queue segment.
///
/// Layout of the whole segment:
/// `QueueHeader | posted cells | free cells | chunk arena`,
/// each band aligned to 128 bytes.
#[repr(C, align(128))]
pub struct QueueHeader {
    pub magic: u64,
    pub version: u32,
    pub slot_count: u32,
    pub chunk_size: u32,
    pub reserved: u32,

    /// Chunks written by the sender and waiting for the receiver.
    pub posted: RingCursor,

    /// Chunks available to the sender.
    pub free: RingCursor,
}

#[inline]
const fn align_128(n: usize) -> usize {
    (n + 127) & !127
}

/// Byte offsets of each band inside a queue segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    pub posted_cells: usize,
    pub free_cells: usize,
    pub chunks: usize,
    pub total: usize,
}

impl SegmentLayout {
    pub fn for_slots(slot_count: usize) -> Self {
        let cells = align_128(slot_count * size_of::<IndexCell>());
        let posted_cells = align_128(size_of::<QueueHeader>());
        let free_cells = posted_cells + cells;
        let chunks = free_cells + cells;
        let total = chunks + slot_count * size_of::<MessageChunk>();
        Self {
            posted_cells,
            free_cells,
            chunks,
            total,
        }
    }
}
