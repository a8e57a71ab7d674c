use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Owner of the argument buffers marshalled into this process for incoming calls.
pub trait ArgsAllocator: Send + Sync {
    /// Called when a buffer of `len` bytes is handed to a call.
    fn leased(&self, _len: usize) {}

    /// Take the buffer back. Called exactly once per lease.
    fn release(&self, args: Vec<u8>);
}

/// Releases buffers by dropping them.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapArgsAllocator;

impl ArgsAllocator for HeapArgsAllocator {
    fn release(&self, args: Vec<u8>) {
        drop(args);
    }
}

/// Counts leases and releases; `outstanding()` is zero once every call let go.
#[derive(Debug, Default)]
pub struct TrackingArgsAllocator {
    leased: AtomicUsize,
    released: AtomicUsize,
    released_bytes: AtomicUsize,
}

impl TrackingArgsAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn leased_count(&self) -> usize {
        self.leased.load(Ordering::SeqCst)
    }

    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn released_bytes(&self) -> usize {
        self.released_bytes.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> usize {
        self.leased_count().saturating_sub(self.released_count())
    }
}

impl ArgsAllocator for TrackingArgsAllocator {
    fn leased(&self, _len: usize) {
        self.leased.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self, args: Vec<u8>) {
        self.released_bytes.fetch_add(args.len(), Ordering::SeqCst);
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Argument buffer of one incoming call. Released to its allocator on drop,
/// whichever way the call ends.
pub struct ArgsLease {
    args: Option<Vec<u8>>,
    allocator: Arc<dyn ArgsAllocator>,
}

impl ArgsLease {
    pub fn new(args: Vec<u8>, allocator: Arc<dyn ArgsAllocator>) -> Self {
        allocator.leased(args.len());
        Self {
            args: Some(args),
            allocator,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        self.args.as_deref().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }
}

impl fmt::Debug for ArgsLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgsLease").field("len", &self.len()).finish()
    }
}

impl Drop for ArgsLease {
    fn drop(&mut self) {
        if let Some(args) = self.args.take() {
            self.allocator.release(args);
        }
    }
}
