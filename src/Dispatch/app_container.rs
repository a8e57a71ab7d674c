use std::sync::Arc;

use super::caller::RpcCaller;
use super::dispatcher::{EventSink, LoggingEventSink, MessageDispatcher};
use super::invoke::InvokeContext;
use crate::Channel::{ChunkChain, SharedMemoryChannel};
use crate::Messages::{InvalidModelsCache, InvokeResponse, MessageType, MetricRequire};

/// Dispatcher of a worker process.
///
/// Service calls go to the worker pool; replies to this worker's own calls are
/// completed from the pool too, so nothing awaiting them can block the
/// receive thread.
pub struct AppContainerDispatcher {
    invoke: InvokeContext,
    caller: Arc<RpcCaller>,
    events: Arc<dyn EventSink>,
}

impl AppContainerDispatcher {
    pub fn new(invoke: InvokeContext, caller: Arc<RpcCaller>) -> Self {
        Self {
            invoke,
            caller,
            events: Arc::new(LoggingEventSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn caller(&self) -> &Arc<RpcCaller> {
        &self.caller
    }

    fn complete_call(&self, channel: &Arc<SharedMemoryChannel>, chain: ChunkChain) {
        let response: InvokeResponse = match channel.deserialize(Some(chain)) {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(channel = %channel.name(), error = %e, "dropping undecodable response");
                return;
            }
        };
        let wait_handle = response.wait_handle;
        if let Err(e) = self
            .caller
            .complete_on_other_thread(response, self.invoke.scheduler().as_ref())
        {
            tracing::error!(channel = %channel.name(), wait_handle, error = %e, "response not delivered");
        }
    }
}

impl MessageDispatcher for AppContainerDispatcher {
    fn process_message(&self, channel: &Arc<SharedMemoryChannel>, chain: ChunkChain) {
        match MessageType::try_from(chain.msg_type()) {
            Ok(MessageType::InvokeRequire) => self.invoke.dispatch(channel, chain),
            Ok(MessageType::InvokeResponse) => self.complete_call(channel, chain),
            Ok(MessageType::InvalidModelsCache) => {
                match channel.deserialize::<InvalidModelsCache>(Some(chain)) {
                    Ok(notice) => self.events.models_invalidated(channel.name(), notice),
                    Err(e) => tracing::error!(channel = %channel.name(), error = %e, "dropping undecodable cache notice"),
                }
            }
            Ok(MessageType::MetricRequire) => match channel.deserialize::<MetricRequire>(Some(chain)) {
                Ok(metric) => self.events.metric(channel.name(), metric),
                Err(e) => tracing::error!(channel = %channel.name(), error = %e, "dropping undecodable metric"),
            },
            Err(e) => {
                tracing::warn!(
                    channel = %channel.name(),
                    msg_type = chain.msg_type(),
                    msg_id = chain.id(),
                    error = %e,
                    "dropping message of unknown type"
                );
                drop(chain);
            }
        }
    }
}
