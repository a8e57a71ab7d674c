use futures::FutureExt;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use super::args::{ArgsAllocator, ArgsLease, HeapArgsAllocator};
use super::scheduler::WorkScheduler;
use super::service::ServiceInvoker;
use super::session::with_session;
use crate::error::ChannelError;
use crate::Channel::{ChunkChain, SharedMemoryChannel};
use crate::Messages::codec::Message;
use crate::Messages::{
    Correlation, InvokeOutcome, InvokeRequire, InvokeResponse, MetricRequire, ServiceError,
    SessionToken,
};

/// What a dispatcher needs to serve incoming `InvokeRequire` messages.
#[derive(Clone)]
pub struct InvokeContext {
    invoker: Arc<dyn ServiceInvoker>,
    scheduler: Arc<dyn WorkScheduler>,
    allocator: Arc<dyn ArgsAllocator>,
    report_metrics: bool,
}

impl InvokeContext {
    pub fn new(invoker: Arc<dyn ServiceInvoker>, scheduler: Arc<dyn WorkScheduler>) -> Self {
        Self {
            invoker,
            scheduler,
            allocator: Arc::new(HeapArgsAllocator),
            report_metrics: false,
        }
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn ArgsAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Push a `MetricRequire` to the peer after every served call.
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.report_metrics = enabled;
        self
    }

    pub fn scheduler(&self) -> &Arc<dyn WorkScheduler> {
        &self.scheduler
    }

    /// Decode an `InvokeRequire` and hand the call to the worker pool.
    ///
    /// Runs on the receive thread. The chain is returned by the decode, so a
    /// rejected job leaks nothing; the caller then gets an `Unavailable` reply.
    pub(crate) fn dispatch(&self, channel: &Arc<SharedMemoryChannel>, chain: ChunkChain) {
        let request: InvokeRequire = match channel.deserialize(Some(chain)) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(channel = %channel.name(), error = %e, "dropping undecodable invoke request");
                return;
            }
        };
        self.dispatch_decoded(channel, request);
    }

    /// Schedule a request the caller already decoded. Its chain must already
    /// be released.
    pub(crate) fn dispatch_decoded(&self, channel: &Arc<SharedMemoryChannel>, request: InvokeRequire) {
        let correlation = request.correlation();
        let service = request.service;
        let lease = ArgsLease::new(request.args, Arc::clone(&self.allocator));
        let job = run_invoke(
            Arc::clone(&self.invoker),
            Arc::clone(channel),
            correlation.clone(),
            service.clone(),
            request.session,
            lease,
            self.report_metrics,
        );

        if let Err(e) = self.scheduler.schedule(Box::pin(job)) {
            tracing::error!(
                channel = %channel.name(),
                service = %service,
                wait_handle = correlation.wait_handle,
                error = %e,
                "worker pool refused service call"
            );
            let reply = InvokeResponse::reply_to(
                correlation,
                Err(ServiceError::unavailable(format!("service `{}` not run: {}", service, e))),
            );
            if let Err(e) = channel.send(&reply) {
                tracing::error!(channel = %channel.name(), error = %e, "failed to send unavailable reply");
            }
        }
    }
}

/// One service call on the worker pool: run it under its session, release
/// the arguments, then answer with the request's correlation fields.
async fn run_invoke(
    invoker: Arc<dyn ServiceInvoker>,
    channel: Arc<SharedMemoryChannel>,
    correlation: Correlation,
    service: String,
    session: Option<SessionToken>,
    lease: ArgsLease,
    report_metrics: bool,
) {
    let started = Instant::now();
    let call = AssertUnwindSafe(invoker.invoke(&service, lease.bytes())).catch_unwind();
    let outcome: InvokeOutcome = match with_session(session, call).await {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::error!(channel = %channel.name(), service = %service, "service panicked");
            Err(ServiceError::failed(format!("service `{}` panicked", service)))
        }
    };
    drop(lease);
    let elapsed = started.elapsed();

    let wait_handle = correlation.wait_handle;
    let reply = InvokeResponse::reply_to(correlation.clone(), outcome);
    match send_blocking(&channel, reply).await {
        Ok(_) => {
            tracing::trace!(channel = %channel.name(), service = %service, wait_handle, "response sent")
        }
        Err(ChannelError::SerializeFail(e)) => {
            tracing::error!(channel = %channel.name(), service = %service, error = %e, "response could not be encoded");
            let fallback = InvokeResponse::reply_to(
                correlation,
                Err(ServiceError::failed(format!("response encoding failed: {}", e))),
            );
            if let Err(e) = send_blocking(&channel, fallback).await {
                tracing::error!(channel = %channel.name(), error = %e, "failed to send error response");
            }
        }
        Err(e) => {
            tracing::error!(channel = %channel.name(), service = %service, wait_handle, error = %e, "failed to send response");
        }
    }

    if report_metrics {
        let metric = MetricRequire {
            method: service,
            duration_micros: u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
        };
        if let Err(e) = send_blocking(&channel, metric).await {
            tracing::debug!(channel = %channel.name(), error = %e, "metric not sent");
        }
    }
}

/// Send from async code. A full queue makes `send` sleep on a futex for up to
/// its timeout, so on a tokio runtime it runs on the blocking pool and the
/// runtime's workers stay free.
async fn send_blocking<M: Message>(channel: &Arc<SharedMemoryChannel>, msg: M) -> Result<u32, ChannelError> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let channel = Arc::clone(channel);
            handle
                .spawn_blocking(move || channel.send(&msg))
                .await
                .map_err(|e| ChannelError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?
        }
        Err(_) => channel.send(&msg),
    }
}
