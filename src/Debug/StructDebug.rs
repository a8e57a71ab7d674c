use std::fmt;

use crate::Channel::{ChunkChain, SharedMemoryChannel};
use crate::Queue::{ChunkHandle, SharedMessageQueue};

/// Debug function for SharedMessageQueue
///
/// Shows the segment name, header location and ring occupancy. Chunk contents
/// are never read.
pub fn debug_shared_message_queue(queue: &SharedMessageQueue, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SharedMessageQueue")
        .field("name", &queue.name())
        .field("header", &format_args!("{:p}", queue.header_ptr()))
        .field("slot_count", &queue.slot_count())
        .field("free", &queue.free_len())
        .field("posted", &queue.posted_len())
        .field("stats", &queue.stats())
        .finish()
}

/// Debug function for SharedMemoryChannel
pub fn debug_shared_memory_channel(channel: &SharedMemoryChannel, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SharedMemoryChannel")
        .field("name", &channel.name())
        .field("send", &channel.send_queue().name())
        .field("receive", &channel.receive_queue().name())
        .finish_non_exhaustive()
}

/// Debug function for ChunkHandle
///
/// Only the slot index; the handle itself cannot reach the chunk.
pub fn debug_chunk_handle(handle: &ChunkHandle, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("ChunkHandle").field(&handle.index()).finish()
}

/// Debug function for ChunkChain
///
/// Shows the header fields of the head chunk and the slot indices in order.
pub fn debug_chunk_chain(chain: &ChunkChain, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ChunkChain")
        .field("queue", &chain.queue().name())
        .field("id", &chain.id())
        .field("msg_type", &format_args!("{:#04x}", chain.msg_type()))
        .field("indices", &chain.indices().collect::<Vec<_>>())
        .field("payload_len", &chain.payload_len())
        .finish()
}
