use std::sync::Arc;

use crate::Channel::{ChunkChain, SharedMemoryChannel};
use crate::Messages::{InvalidModelsCache, MetricRequire};

/// Role-specific handler for fully reassembled messages.
///
/// Runs on the channel's receive thread, which is also the thread draining the
/// shared-memory ring, so implementations must return quickly and move real
/// work to a [`WorkScheduler`](super::WorkScheduler). Dropping `chain` returns
/// its chunks; every path must end up doing so.
pub trait MessageDispatcher: Send + Sync {
    fn process_message(&self, channel: &Arc<SharedMemoryChannel>, chain: ChunkChain);
}

/// Receiver of the one-way notices exchanged between Host and workers.
pub trait EventSink: Send + Sync {
    fn models_invalidated(&self, channel: &str, notice: InvalidModelsCache);

    fn metric(&self, channel: &str, metric: MetricRequire);
}

/// Default [`EventSink`]: records each notice in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn models_invalidated(&self, channel: &str, notice: InvalidModelsCache) {
        tracing::info!(
            channel,
            services = ?notice.services,
            others = notice.others.len(),
            "models cache invalidated"
        );
    }

    fn metric(&self, channel: &str, metric: MetricRequire) {
        tracing::debug!(
            channel,
            method = %metric.method,
            duration_micros = metric.duration_micros,
            "service metric"
        );
    }
}
