use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use super::chain::ChunkChain;
use super::writer::max_fragments;
use crate::Queue::{ChunkHandle, SharedMessageQueue};

/// What one incoming fragment produced.
pub enum Fragment {
    /// The last fragment arrived; the whole message is ready for dispatch.
    Complete(ChunkChain),
    /// More fragments are expected for this id.
    Pending,
    /// The sender aborted the message; `dropped` fragments were given back.
    Cancelled { id: u32, dropped: usize },
    /// Partial messages held too many chunks; message `id` was discarded and
    /// its `dropped` fragments given back. Its remaining fragments are dropped
    /// as they arrive.
    Evicted { id: u32, dropped: usize },
}

/// In-flight messages keyed by message id.
///
/// Owned by exactly one receive loop. The table is deliberately `!Sync` so it
/// cannot be shared behind a reference with another thread.
///
/// Fragments held here are missing from the sender's free pool. Once they
/// reach the per-message fragment limit the largest partial message is
/// evicted, so interleaved senders cannot drain the pool between them.
pub struct ReassemblyTable {
    queue: Arc<SharedMessageQueue>,
    pending: HashMap<u32, ChunkChain>,
    evicted: HashSet<u32>,
    held: usize,
    limit: usize,
    _single_owner: PhantomData<Cell<()>>,
}

impl ReassemblyTable {
    pub fn new(queue: Arc<SharedMessageQueue>) -> Self {
        let limit = max_fragments(queue.slot_count());
        Self {
            queue,
            pending: HashMap::new(),
            evicted: HashSet::new(),
            held: 0,
            limit,
            _single_owner: PhantomData,
        }
    }

    /// Feed one fragment read from the queue.
    pub fn accept(&mut self, handle: ChunkHandle) -> Fragment {
        let (id, is_last, is_cancel) = {
            let chunk = self.queue.chunk(&handle);
            (chunk.id, chunk.is_last(), chunk.is_cancel())
        };

        if is_cancel {
            self.evicted.remove(&id);
            let dropped = match self.pending.remove(&id) {
                Some(chain) => {
                    self.held -= chain.len();
                    chain.len()
                }
                None => 0,
            };
            // the notice itself carries no payload
            self.give_back(handle, id);
            return Fragment::Cancelled { id, dropped };
        }

        if self.evicted.contains(&id) {
            if is_last {
                self.evicted.remove(&id);
            }
            self.give_back(handle, id);
            return Fragment::Evicted { id, dropped: 1 };
        }

        match self.pending.remove(&id) {
            None if is_last => Fragment::Complete(ChunkChain::new(self.queue.clone(), handle)),
            None => {
                let chain = ChunkChain::new(self.queue.clone(), handle);
                self.pending.insert(id, chain);
                self.held += 1;
                self.evict_if_starving()
            }
            Some(mut chain) => {
                chain.append(handle);
                if is_last {
                    self.held -= chain.len() - 1;
                    Fragment::Complete(chain)
                } else {
                    self.pending.insert(id, chain);
                    self.held += 1;
                    self.evict_if_starving()
                }
            }
        }
    }

    fn evict_if_starving(&mut self) -> Fragment {
        if self.held < self.limit {
            return Fragment::Pending;
        }
        let largest = self
            .pending
            .iter()
            .max_by_key(|(_, chain)| chain.len())
            .map(|(id, _)| *id);
        let Some(id) = largest else {
            return Fragment::Pending;
        };
        let dropped = match self.pending.remove(&id) {
            Some(chain) => chain.len(),
            None => 0,
        };
        self.held -= dropped;
        self.evicted.insert(id);
        Fragment::Evicted { id, dropped }
    }

    fn give_back(&self, handle: ChunkHandle, id: u32) {
        if let Err(e) = self.queue.return_chunk(handle) {
            tracing::error!(queue = %self.queue.name(), msg_id = id, error = %e, "failed to return chunk");
        }
    }

    /// Messages still waiting for their last fragment.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Fragments currently held by partial messages.
    pub fn held(&self) -> usize {
        self.held
    }

    /// Drop every partial message, giving its fragments back.
    pub fn clear(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        self.evicted.clear();
        self.held = 0;
        n
    }
}
