use std::fmt;

use super::queue::{ChunkHandle, SharedMessageQueue};

// Debug proxy implementations that call the standalone debug functions
impl fmt::Debug for SharedMessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_shared_message_queue(self, f)
    }
}

impl fmt::Debug for ChunkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_chunk_handle(self, f)
    }
}
