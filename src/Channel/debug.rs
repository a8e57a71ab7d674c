use std::fmt;

use super::chain::ChunkChain;
use super::channel::SharedMemoryChannel;

// Debug proxy implementations that call the standalone debug functions
impl fmt::Debug for SharedMemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_shared_memory_channel(self, f)
    }
}

impl fmt::Debug for ChunkChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_chunk_chain(self, f)
    }
}
