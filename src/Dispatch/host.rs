use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::caller::RpcCaller;
use super::dispatcher::{EventSink, LoggingEventSink, MessageDispatcher};
use super::invoke::InvokeContext;
use crate::Channel::{ChunkChain, SharedMemoryChannel};
use crate::Messages::codec::decode_message;
use crate::Messages::{
    InvalidModelsCache, InvokeRequire, InvokeResponse, MessageSource, MessageType, MetricRequire,
    ServiceError,
};

/// Where the Host sends calls for a routed service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    AppContainer(u32),
    DebugSession(String),
}

/// Dispatcher of the Host process, shared by the receive loops of every
/// worker channel.
///
/// Replies are delivered by the `source` they echo: the Host's own calls are
/// completed in place, calls relayed for a worker or a debug session are
/// forwarded unchanged to that peer's channel. Calls for a routed service are
/// forwarded to the route's target; the rest are served locally when an
/// [`InvokeContext`] is installed. In every case the inbound chain is
/// returned exactly once, when it is dropped.
pub struct HostDispatcher {
    caller: Arc<RpcCaller>,
    invoke: Option<InvokeContext>,
    events: Arc<dyn EventSink>,
    workers: RwLock<HashMap<u32, Arc<SharedMemoryChannel>>>,
    debug_sessions: RwLock<HashMap<String, Arc<SharedMemoryChannel>>>,
    routes: RwLock<HashMap<String, Route>>,
}

impl HostDispatcher {
    pub fn new(caller: Arc<RpcCaller>) -> Self {
        Self {
            caller,
            invoke: None,
            events: Arc::new(LoggingEventSink),
            workers: RwLock::new(HashMap::new()),
            debug_sessions: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Serve unrouted calls with the Host's own services.
    pub fn with_services(mut self, invoke: InvokeContext) -> Self {
        self.invoke = Some(invoke);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn caller(&self) -> &Arc<RpcCaller> {
        &self.caller
    }

    pub fn register_worker(&self, peer_id: u32, channel: Arc<SharedMemoryChannel>) {
        tracing::info!(peer_id, channel = %channel.name(), "worker registered");
        self.workers.write().insert(peer_id, channel);
    }

    pub fn remove_worker(&self, peer_id: u32) -> Option<Arc<SharedMemoryChannel>> {
        self.workers.write().remove(&peer_id)
    }

    pub fn register_debug_session(&self, session_id: impl Into<String>, channel: Arc<SharedMemoryChannel>) {
        let session_id = session_id.into();
        tracing::info!(session = %session_id, channel = %channel.name(), "debug session registered");
        self.debug_sessions.write().insert(session_id, channel);
    }

    pub fn remove_debug_session(&self, session_id: &str) -> Option<Arc<SharedMemoryChannel>> {
        self.debug_sessions.write().remove(session_id)
    }

    /// Send calls for `service` to `target`. `service` is either a full path
    /// or a module name, matching every service in that module.
    pub fn route_service(&self, service: impl Into<String>, target: Route) {
        self.routes.write().insert(service.into(), target);
    }

    pub fn remove_route(&self, service: &str) -> Option<Route> {
        self.routes.write().remove(service)
    }

    fn route_for(&self, service: &str) -> Option<Route> {
        let routes = self.routes.read();
        if let Some(route) = routes.get(service) {
            return Some(route.clone());
        }
        let module = service.split('.').next()?;
        routes.get(module).cloned()
    }

    fn channel_for(&self, route: &Route) -> Option<Arc<SharedMemoryChannel>> {
        match route {
            Route::AppContainer(peer_id) => self.workers.read().get(peer_id).cloned(),
            Route::DebugSession(id) => self.debug_sessions.read().get(id).cloned(),
        }
    }

    fn forward(&self, route: &Route, chain: &ChunkChain) -> bool {
        let Some(target) = self.channel_for(route) else {
            tracing::warn!(?route, msg_id = chain.id(), "no channel for route; message dropped");
            return false;
        };
        match target.forward(chain) {
            Ok(id) => {
                tracing::trace!(?route, from = chain.id(), to = id, "message forwarded");
                true
            }
            Err(e) => {
                tracing::error!(?route, channel = %target.name(), error = %e, "forward failed");
                false
            }
        }
    }

    fn deliver_response(&self, channel: &Arc<SharedMemoryChannel>, chain: ChunkChain) {
        let response: InvokeResponse = match decode_message(&mut chain.reader()) {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(channel = %channel.name(), error = %e, "dropping undecodable response");
                return;
            }
        };

        let route = match &response.source {
            MessageSource::Host => None,
            MessageSource::AppContainer { peer_id } => Some(Route::AppContainer(*peer_id)),
            MessageSource::DebugSession { session_id } => Some(Route::DebugSession(session_id.clone())),
        };

        match route {
            None => {
                let wait_handle = response.wait_handle;
                if let Err(e) = self.caller.complete(response) {
                    tracing::warn!(channel = %channel.name(), wait_handle, error = %e, "response not delivered");
                }
            }
            Some(route) => {
                self.forward(&route, &chain);
            }
        }
        drop(chain);
    }

    fn serve_request(&self, channel: &Arc<SharedMemoryChannel>, chain: ChunkChain) {
        let request: InvokeRequire = match decode_message(&mut chain.reader()) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(channel = %channel.name(), error = %e, "dropping undecodable invoke request");
                return;
            }
        };

        if let Some(route) = self.route_for(&request.service) {
            if self.forward(&route, &chain) {
                return;
            }
            self.refuse(channel, request, "route target is unavailable");
            return;
        }

        drop(chain);
        match &self.invoke {
            Some(invoke) => invoke.dispatch_decoded(channel, request),
            None => self.refuse(channel, request, "no local services"),
        }
    }

    fn refuse(&self, channel: &Arc<SharedMemoryChannel>, request: InvokeRequire, reason: &str) {
        let reply = InvokeResponse::reply_to(
            request.correlation(),
            Err(ServiceError::unavailable(format!("service `{}`: {}", request.service, reason))),
        );
        if let Err(e) = channel.send(&reply) {
            tracing::error!(channel = %channel.name(), error = %e, "failed to send unavailable reply");
        }
    }
}

impl MessageDispatcher for HostDispatcher {
    fn process_message(&self, channel: &Arc<SharedMemoryChannel>, chain: ChunkChain) {
        match MessageType::try_from(chain.msg_type()) {
            Ok(MessageType::InvokeRequire) => self.serve_request(channel, chain),
            Ok(MessageType::InvokeResponse) => self.deliver_response(channel, chain),
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
