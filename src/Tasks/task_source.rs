use futures::task::AtomicWaker;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::error::CompletionError;
use crate::Dispatch::scheduler::WorkScheduler;

pub const DEFAULT_MAX_IDLE: usize = 1024;

enum SlotState<T> {
    /// Rented, no result yet.
    Waiting,
    /// Result set, not yet retrieved.
    Ready(T),
    /// In the pool, or owned by nobody.
    Idle,
}

struct SlotInner<T> {
    /// Bumped every time the slot is recycled; stale sources and futures carry
    /// an older value and are refused.
    generation: u64,
    state: SlotState<T>,
}

struct Slot<T> {
    inner: Mutex<SlotInner<T>>,
    waker: AtomicWaker,
}

struct PoolInner<T> {
    idle: Mutex<Vec<Arc<Slot<T>>>>,
    max_idle: usize,
    created: AtomicUsize,
}

impl<T> PoolInner<T> {
    fn recycle(&self, slot: Arc<Slot<T>>) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(slot);
        }
    }
}

/// Pool of reusable completion slots.
///
/// After warm-up, renting, completing and awaiting a slot performs no heap
/// allocation: slots are recycled once their result has been retrieved.
pub struct TaskSourcePool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for TaskSourcePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Default for TaskSourcePool<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}

impl<T: Send + 'static> TaskSourcePool<T> {
    /// `max_idle` bounds how many recycled slots are kept; its storage is
    /// reserved up front.
    pub fn new(max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(max_idle)),
                max_idle,
                created: AtomicUsize::new(0),
            }),
        }
    }

    /// Take a slot from the pool (or make one) in the waiting state.
    pub fn rent(&self) -> PooledTaskSource<T> {
        let slot = self.inner.idle.lock().pop().unwrap_or_else(|| {
            self.inner.created.fetch_add(1, Ordering::Relaxed);
            Arc::new(Slot {
                inner: Mutex::new(SlotInner {
                    generation: 0,
                    state: SlotState::Idle,
                }),
                waker: AtomicWaker::new(),
            })
        });

        let generation = {
            let mut inner = slot.inner.lock();
            inner.state = SlotState::Waiting;
            inner.generation
        };

        PooledTaskSource {
            slot,
            generation,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Slots currently waiting in the pool.
    pub fn idle(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Slots ever allocated by this pool.
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::Relaxed)
    }
}

/// Single-assignment result slot that one side awaits and another completes,
/// possibly from another thread.
///
/// Completing never runs the awaiting continuation inline: `set_result` only
/// wakes the awaiting task, which its own executor polls later.
pub struct PooledTaskSource<T> {
    slot: Arc<Slot<T>>,
    generation: u64,
    pool: Arc<PoolInner<T>>,
}

impl<T> Clone for PooledTaskSource<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            generation: self.generation,
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<T: Send + 'static> PooledTaskSource<T> {
    /// The awaitable side. Resolves once, with the value given to `set_result`.
    pub fn wait(&self) -> TaskSourceFuture<T> {
        TaskSourceFuture {
            slot: Arc::clone(&self.slot),
            generation: self.generation,
            pool: Arc::clone(&self.pool),
            done: false,
        }
    }

    /// Store the result and wake the awaiting task.
    pub fn set_result(&self, value: T) -> Result<(), CompletionError> {
        {
            let mut inner = self.slot.inner.lock();
            if inner.generation != self.generation {
                return Err(CompletionError::Abandoned);
            }
            if matches!(inner.state, SlotState::Ready(_)) {
                return Err(CompletionError::AlreadyCompleted);
            }
            if matches!(inner.state, SlotState::Idle) {
                return Err(CompletionError::Abandoned);
            }
            inner.state = SlotState::Ready(value);
        }
        self.slot.waker.wake();
        Ok(())
    }

    /// Hop to the worker pool and set the result from there.
    ///
    /// For completers running on a thread that must never be re-entered, such
    /// as a channel's receive loop. If the pool refuses the job the value is
    /// dropped and the caller must treat the completion as failed.
    pub fn set_result_on_other_thread(
        &self,
        value: T,
        scheduler: &dyn WorkScheduler,
    ) -> Result<(), CompletionError> {
        let source = self.clone();
        scheduler.schedule(Box::pin(async move {
            if let Err(e) = source.set_result(value) {
                tracing::debug!(error = %e, "deferred completion was not delivered");
            }
        }))?;
        Ok(())
    }

    /// True once a result is stored and not yet retrieved.
    pub fn is_completed(&self) -> bool {
        let inner = self.slot.inner.lock();
        inner.generation == self.generation && matches!(inner.state, SlotState::Ready(_))
    }
}

/// Future returned by [`PooledTaskSource::wait`].
///
/// Yields `Err(AlreadyTaken)` if the result was already retrieved through
/// another future of the same source. Dropping it before completion abandons
/// the slot; a later `set_result` then fails with `Abandoned`.
pub struct TaskSourceFuture<T> {
    slot: Arc<Slot<T>>,
    generation: u64,
    pool: Arc<PoolInner<T>>,
    done: bool,
}

impl<T> TaskSourceFuture<T> {
    /// Reset the slot for its next renter, returning any stored result.
    /// Called with the slot's lock held.
    fn recycle(&self, inner: &mut SlotInner<T>) -> Option<T> {
        inner.generation = inner.generation.wrapping_add(1);
        let previous = std::mem::replace(&mut inner.state, SlotState::Idle);
        match previous {
            SlotState::Ready(value) => Some(value),
            _ => None,
        }
    }
}

impl<T: Send + 'static> TaskSourceFuture<T> {
    /// Block the current thread until the result arrives.
    ///
    /// Never call this on the thread that is expected to deliver the result.
    pub fn wait_blocking(self) -> Result<T, CompletionError> {
        futures::executor::block_on(self)
    }
}

impl<T> Future for TaskSourceFuture<T> {
    type Output = Result<T, CompletionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.done {
            return Poll::Ready(Err(CompletionError::AlreadyTaken));
        }

        // Register first so a result set between the check and the return is not missed
        self.slot.waker.register(cx.waker());

        let outcome = {
            let mut inner = self.slot.inner.lock();
            if inner.generation != self.generation {
                None
            } else if matches!(inner.state, SlotState::Waiting) {
                return Poll::Pending;
            } else {
                Some(self.recycle(&mut inner))
            }
        };

        self.done = true;
        match outcome {
            Some(value) => {
                self.pool.recycle(Arc::clone(&self.slot));
                match value {
                    Some(value) => Poll::Ready(Ok(value)),
                    None => Poll::Ready(Err(CompletionError::AlreadyTaken)),
                }
            }
            None => Poll::Ready(Err(CompletionError::AlreadyTaken)),
        }
    }
}

impl<T> Drop for TaskSourceFuture<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let recycled = {
            let mut inner = self.slot.inner.lock();
            if inner.generation != self.generation {
                false
            } else {
                // abandoned; a late result is discarded with the slot reset
                let _ = self.recycle(&mut inner);
                true
            }
        };
        if recycled {
            self.pool.recycle(Arc::clone(&self.slot));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    fn poll_once<T>(fut: &mut TaskSourceFuture<T>) -> Poll<Result<T, CompletionError>> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(fut).poll(&mut cx)
    }

    #[test]
    fn result_is_delivered_once() {
        let pool = TaskSourcePool::<u32>::new(4);
        let source = pool.rent();
        let mut fut = source.wait();

        assert!(poll_once(&mut fut).is_pending());
        source.set_result(7).unwrap();
        assert!(source.is_completed());
        assert_eq!(poll_once(&mut fut), Poll::Ready(Ok(7)));
        assert_eq!(poll_once(&mut fut), Poll::Ready(Err(CompletionError::AlreadyTaken)));
    }

    #[test]
    fn second_result_is_refused() {
        let pool = TaskSourcePool::<u32>::new(4);
        let source = pool.rent();
        source.set_result(1).unwrap();
        assert_eq!(source.set_result(2), Err(CompletionError::AlreadyCompleted));
    }

    #[test]
    fn second_retrieval_is_refused() {
        let pool = TaskSourcePool::<u32>::new(4);
        let source = pool.rent();
        let mut first = source.wait();
        let mut second = source.wait();
        source.set_result(5).unwrap();

        assert_eq!(poll_once(&mut first), Poll::Ready(Ok(5)));
        assert_eq!(poll_once(&mut second), Poll::Ready(Err(CompletionError::AlreadyTaken)));
    }

    #[test]
    fn slot_is_reused_after_retrieval() {
        let pool = TaskSourcePool::<u32>::new(4);
        for i in 0..10 {
            let source = pool.rent();
            let mut fut = source.wait();
            source.set_result(i).unwrap();
            assert_eq!(poll_once(&mut fut), Poll::Ready(Ok(i)));
        }
        assert_eq!(pool.created(), 1);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn late_result_after_abandon_is_rejected() {
        let pool = TaskSourcePool::<u32>::new(4);
        let source = pool.rent();
        drop(source.wait());

        assert_eq!(source.set_result(3), Err(CompletionError::Abandoned));
        assert_eq!(pool.idle(), 1);

        // the recycled slot serves a new renter untouched by the stale source
        let fresh = pool.rent();
        let mut fut = fresh.wait();
        assert_eq!(source.set_result(4), Err(CompletionError::Abandoned));
        fresh.set_result(9).unwrap();
        assert_eq!(poll_once(&mut fut), Poll::Ready(Ok(9)));
    }
}
