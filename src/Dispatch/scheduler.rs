use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{Semaphore, TryAcquireError};

use crate::error::ScheduleError;

/// A unit of work handed to the worker pool.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// General-purpose worker pool, kept separate from the channel receive threads.
///
/// `schedule` never runs the job inline. A rejected job is dropped before
/// `schedule` returns, so whatever it owned is released by then.
pub trait WorkScheduler: Send + Sync {
    fn schedule(&self, job: Job) -> Result<(), ScheduleError>;
}

/// [`WorkScheduler`] on a tokio runtime, bounded to `max_in_flight` jobs.
pub struct TokioScheduler {
    handle: Handle,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
}

impl TokioScheduler {
    pub fn new(handle: Handle, max_in_flight: usize) -> Self {
        Self {
            handle,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        }
    }

    /// Jobs accepted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight
            .saturating_sub(self.permits.available_permits())
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Refuse every later job. Jobs already running are left to finish.
    pub fn shutdown(&self) {
        self.permits.close();
        tracing::info!(in_flight = self.in_flight(), "worker pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.permits.is_closed()
    }
}

impl WorkScheduler for TokioScheduler {
    fn schedule(&self, job: Job) -> Result<(), ScheduleError> {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Err(ScheduleError::Saturated),
            Err(TryAcquireError::Closed) => return Err(ScheduleError::ShutDown),
        };
        self.handle.spawn(async move {
            job.await;
            drop(permit);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn saturated_pool_refuses_jobs() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let scheduler = TokioScheduler::new(rt.handle().clone(), 1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        scheduler
            .schedule(Box::pin(async move {
                let _ = release_rx.await;
            }))
            .unwrap();
        assert_eq!(scheduler.in_flight(), 1);
        assert_eq!(
            scheduler.schedule(Box::pin(async {})),
            Err(ScheduleError::Saturated)
        );

        release_tx.send(()).unwrap();
        rt.block_on(async {
            while scheduler.in_flight() > 0 {
                tokio::task::yield_now().await;
            }
        });
        scheduler.schedule(Box::pin(async {})).unwrap();
    }

    #[test]
    fn shut_down_pool_refuses_jobs() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let scheduler = TokioScheduler::new(rt.handle().clone(), 4);
        scheduler.shutdown();
        assert!(scheduler.is_shut_down());
        assert_eq!(
            scheduler.schedule(Box::pin(async {})),
            Err(ScheduleError::ShutDown)
        );
    }
}
