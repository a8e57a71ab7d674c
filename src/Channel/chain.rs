use std::io::{self, Read};
use std::sync::Arc;

use crate::error::QueueError;
use crate::Queue::layout::MessageChunk;
use crate::Queue::{ChunkHandle, SharedMessageQueue};

/// The ordered fragments of one logical message, owned by the receiving side.
///
/// Every chunk in the chain is given back to the queue it was read from exactly
/// once: explicitly through [`release`](Self::release), or when the chain is
/// dropped. There is no way to extract a handle, so a chunk cannot outlive the
/// chain or be returned twice.
pub struct ChunkChain {
    queue: Arc<SharedMessageQueue>,
    handles: Vec<ChunkHandle>,
}

impl ChunkChain {
    /// Start a chain at `head`, recording it as its own `first`.
    pub(crate) fn new(queue: Arc<SharedMessageQueue>, mut head: ChunkHandle) -> Self {
        let head_index = head.index();
        queue.chunk_mut(&mut head).first = head_index;
        Self {
            queue,
            handles: vec![head],
        }
    }

    /// Link `handle` behind the current tail and stamp the head's index on it.
    pub(crate) fn append(&mut self, mut handle: ChunkHandle) {
        let head_index = self.head_index();
        let new_index = handle.index();
        if let Some(tail) = self.handles.last_mut() {
            self.queue.chunk_mut(tail).next = new_index;
        }
        self.queue.chunk_mut(&mut handle).first = head_index;
        self.handles.push(handle);
    }

    /// Message id shared by every fragment.
    pub fn id(&self) -> u32 {
        self.head().id
    }

    /// Wire discriminant carried by the head fragment.
    pub fn msg_type(&self) -> u8 {
        self.head().msg_type
    }

    pub fn head_index(&self) -> u32 {
        self.handles[0].index()
    }

    pub fn head(&self) -> &MessageChunk {
        self.queue.chunk(&self.handles[0])
    }

    pub fn tail(&self) -> &MessageChunk {
        // a chain always holds at least its head
        self.queue.chunk(&self.handles[self.handles.len() - 1])
    }

    /// Number of fragments.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Fragments in arrival order.
    pub fn chunks(&self) -> impl Iterator<Item = &MessageChunk> + '_ {
        self.handles.iter().map(move |h| self.queue.chunk(h))
    }

    /// Slot indices in arrival order.
    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.handles.iter().map(|h| h.index())
    }

    /// Total payload bytes across all fragments.
    pub fn payload_len(&self) -> usize {
        self.chunks().map(|c| c.payload().len()).sum()
    }

    /// Stream over the concatenated payload of every fragment.
    pub fn reader(&self) -> ChainReader<'_> {
        ChainReader {
            chain: self,
            chunk: 0,
            offset: 0,
        }
    }

    /// Copy the concatenated payload out of shared memory.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload_len());
        for chunk in self.chunks() {
            out.extend_from_slice(chunk.payload());
        }
        out
    }

    pub fn queue(&self) -> &Arc<SharedMessageQueue> {
        &self.queue
    }

    /// Return every fragment to the queue now, reporting the first failure.
    /// Remaining fragments are still returned after a failure.
    pub fn release(mut self) -> Result<(), QueueError> {
        self.return_all()
    }

    fn return_all(&mut self) -> Result<(), QueueError> {
        let mut first_err = None;
        for handle in self.handles.drain(..) {
            if let Err(e) = self.queue.return_chunk(handle) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ChunkChain {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        if let Err(e) = self.return_all() {
            tracing::error!(queue = %self.queue.name(), error = %e, "failed to return chunk chain");
        }
    }
}

/// `io::Read` over the payload bytes of a [`ChunkChain`], fragment after fragment.
pub struct ChainReader<'a> {
    chain: &'a ChunkChain,
    chunk: usize,
    offset: usize,
}

impl Read for ChainReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.chunk < self.chain.handles.len() {
            let payload = self.chain.queue.chunk(&self.chain.handles[self.chunk]).payload();
            if self.offset < payload.len() {
                let n = buf.len().min(payload.len() - self.offset);
                buf[..n].copy_from_slice(&payload[self.offset..self.offset + n]);
                self.offset += n;
                return Ok(n);
            }
            self.chunk += 1;
            self.offset = 0;
        }
        Ok(0)
    }
}
