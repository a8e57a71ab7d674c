use std::io::{self, Write};
use std::time::Duration;

use crate::error::QueueError;
use crate::Queue::layout::{ChunkFlags, CHUNK_DATA_SIZE};
use crate::Queue::{ChunkHandle, SharedMessageQueue};

/// `io::Write` that spreads one logical message over as many chunks as needed.
///
/// A chunk is posted as soon as the next byte no longer fits. The final chunk
/// is held back until [`finish`](Self::finish) marks it with `LAST_CHUNK`.
///
/// The receiver holds every fragment until the last one arrives, so one message
/// may span at most `slot_count - 1` chunks; the spare slot carries a cancel
/// notice. A write that would need more fails with `InvalidInput`.
///
/// If the writer is aborted (or dropped) after some fragments already reached
/// the peer, a `CANCEL` notice with the same id is posted so the peer discards
/// the partial chain.
pub struct ChunkWriter<'a> {
    queue: &'a SharedMessageQueue,
    id: u32,
    msg_type: u8,
    current: Option<ChunkHandle>,
    posted: usize,
    max_fragments: usize,
    acquire_timeout: Duration,
    queue_error: Option<QueueError>,
    finished: bool,
}

impl<'a> ChunkWriter<'a> {
    pub fn new(queue: &'a SharedMessageQueue, id: u32, msg_type: u8, acquire_timeout: Duration) -> Self {
        Self {
            queue,
            id,
            msg_type,
            current: None,
            posted: 0,
            max_fragments: max_fragments(queue.slot_count()),
            acquire_timeout,
            queue_error: None,
            finished: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Fragments already handed to the peer.
    pub fn posted(&self) -> usize {
        self.posted
    }

    /// The queue failure that made a `write` fail, if any.
    pub fn take_queue_error(&mut self) -> Option<QueueError> {
        self.queue_error.take()
    }

    fn acquire(&mut self) -> Result<ChunkHandle, QueueError> {
        let mut handle = self.queue.acquire_for_write_timeout(self.acquire_timeout)?;
        let chunk = self.queue.chunk_mut(&mut handle);
        chunk.id = self.id;
        chunk.msg_type = self.msg_type;
        Ok(handle)
    }

    fn post_current(&mut self) -> Result<(), QueueError> {
        if let Some(handle) = self.current.take() {
            tracing::trace!(queue = %self.queue.name(), msg_id = self.id, slot = handle.index(), "post fragment");
            self.queue.post(handle)?;
            self.posted += 1;
        }
        Ok(())
    }

    fn to_io(&mut self, e: QueueError) -> io::Error {
        let err = io::Error::new(io::ErrorKind::Other, e.to_string());
        self.queue_error = Some(e);
        err
    }

    /// Mark the last fragment and post it. Returns the number of fragments sent.
    /// An empty message still occupies one chunk.
    pub fn finish(mut self) -> Result<usize, QueueError> {
        if self.current.is_none() {
            let handle = self.acquire()?;
            self.current = Some(handle);
        }
        if let Some(handle) = self.current.as_mut() {
            self.queue.chunk_mut(handle).flag = ChunkFlags::LAST_CHUNK;
        }
        self.post_current()?;
        self.finished = true;
        Ok(self.posted)
    }

    /// Give back the unposted chunk and, if fragments already went out, tell the
    /// peer to drop them. Returns whether a cancel notice was posted.
    pub fn abort(mut self) -> Result<bool, QueueError> {
        self.finished = true;
        self.cancel()
    }

    fn cancel(&mut self) -> Result<bool, QueueError> {
        if let Some(handle) = self.current.take() {
            self.queue.return_chunk(handle)?;
        }
        if self.posted == 0 {
            return Ok(false);
        }

        let mut notice = self.acquire()?;
        self.queue.chunk_mut(&mut notice).flag = ChunkFlags::CANCEL;
        self.queue.post(notice)?;
        tracing::debug!(queue = %self.queue.name(), msg_id = self.id, fragments = self.posted, "cancel notice posted");
        Ok(true)
    }
}

impl Write for ChunkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let full = match self.current.as_ref() {
            Some(handle) => self.queue.chunk(handle).data_len as usize >= CHUNK_DATA_SIZE,
            None => true,
        };
        if full {
            let needed = self.posted + usize::from(self.current.is_some()) + 1;
            if needed > self.max_fragments {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "message needs more than {} chunks of queue `{}`",
                        self.max_fragments,
                        self.queue.name()
                    ),
                ));
            }
            // only now is it known that the held chunk is not the last one
            if let Err(e) = self.post_current() {
                return Err(self.to_io(e));
            }
            match self.acquire() {
                Ok(handle) => self.current = Some(handle),
                Err(e) => return Err(self.to_io(e)),
            }
        }

        let queue = self.queue;
        let Some(handle) = self.current.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "no chunk to write into"));
        };
        let chunk = queue.chunk_mut(handle);
        let used = chunk.data_len as usize;
        let n = buf.len().min(CHUNK_DATA_SIZE - used);
        chunk.data[used..used + n].copy_from_slice(&buf[..n]);
        chunk.data_len = (used + n) as u16;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Most fragments one message may occupy in a queue of `slot_count` chunks.
pub fn max_fragments(slot_count: usize) -> usize {
    slot_count.saturating_sub(1).max(1)
}

impl Drop for ChunkWriter<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.cancel() {
            tracing::error!(queue = %self.queue.name(), msg_id = self.id, error = %e, "failed to cancel abandoned message");
        }
    }
}
