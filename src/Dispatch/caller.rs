use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::scheduler::WorkScheduler;
use crate::error::{ChannelError, CompletionError};
use crate::Channel::SharedMemoryChannel;
use crate::Messages::{
    ContentType, InvokeOutcome, InvokeRequire, InvokeResponse, MessageSource, SessionToken,
};
use crate::Tasks::{PooledTaskSource, TaskSourceFuture, TaskSourcePool};

/// Calling side of the RPC layer: sends `InvokeRequire` and matches each
/// `InvokeResponse` back to its waiting caller by wait handle.
///
/// There is no timeout here; race the returned future against a timer if
/// the peer may never answer.
pub struct RpcCaller {
    source: MessageSource,
    content_type: ContentType,
    pool: TaskSourcePool<InvokeOutcome>,
    pending: Mutex<HashMap<u64, PooledTaskSource<InvokeOutcome>>>,
    next_wait_handle: AtomicU64,
}

impl RpcCaller {
    pub fn new(source: MessageSource) -> Self {
        Self {
            source,
            content_type: ContentType::Binary,
            pool: TaskSourcePool::default(),
            pending: Mutex::new(HashMap::new()),
            next_wait_handle: AtomicU64::new(1),
        }
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn source(&self) -> &MessageSource {
        &self.source
    }

    /// Send a call for `service` and return the future of its outcome.
    ///
    /// The request's `source_msg_id` is the id of the message carrying it.
    pub fn invoke(
        &self,
        channel: &SharedMemoryChannel,
        service: &str,
        args: Vec<u8>,
        session: Option<SessionToken>,
    ) -> Result<TaskSourceFuture<InvokeOutcome>, ChannelError> {
        let wait_handle = self.next_wait_handle.fetch_add(1, Ordering::Relaxed);
        let source = self.pool.rent();
        let response = source.wait();
        // registered before sending; the reply can arrive before send returns
        self.pending.lock().insert(wait_handle, source);

        let msg_id = channel.allocate_id();
        let request = InvokeRequire {
            source: self.source.clone(),
            content_type: self.content_type,
            wait_handle,
            source_msg_id: msg_id,
            session,
            service: service.to_string(),
            args,
        };

        if let Err(e) = channel.send_with_id(msg_id, &request) {
            self.pending.lock().remove(&wait_handle);
            return Err(e);
        }
        tracing::trace!(channel = %channel.name(), service, wait_handle, msg_id, "call sent");
        Ok(response)
    }

    fn take_pending(&self, wait_handle: u64) -> Result<PooledTaskSource<InvokeOutcome>, CompletionError> {
        self.pending
            .lock()
            .remove(&wait_handle)
            .ok_or(CompletionError::UnknownWaitHandle(wait_handle))
    }

    /// Deliver `response` to its caller. Only wakes the caller; its
    /// continuation runs on its own executor.
    pub fn complete(&self, response: InvokeResponse) -> Result<(), CompletionError> {
        let source = self.take_pending(response.wait_handle)?;
        source.set_result(response.result)
    }

    /// Like [`complete`](Self::complete), but the result is set from a job on
    /// `scheduler`. If the job is refused the caller never gets an answer.
    pub fn complete_on_other_thread(
        &self,
        response: InvokeResponse,
        scheduler: &dyn WorkScheduler,
    ) -> Result<(), CompletionError> {
        let source = self.take_pending(response.wait_handle)?;
        source.set_result_on_other_thread(response.result, scheduler)
    }

    /// Forget a call whose caller gave up. Returns false if it was not pending.
    pub fn abandon(&self, wait_handle: u64) -> bool {
        self.pending.lock().remove(&wait_handle).is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}
