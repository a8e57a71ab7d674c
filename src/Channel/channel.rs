use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::builder::ChannelConfig;
use super::chain::ChunkChain;
use super::reassembly::{Fragment, ReassemblyTable};
use super::writer::ChunkWriter;
use crate::error::{ChannelError, QueueError};
use crate::Core::SharedMemory::unlink_shared_memory;
use crate::Dispatch::MessageDispatcher;
use crate::Messages::codec::{decode_message, encode_message, Message};
use crate::Queue::layout::ChunkFlags;
use crate::Queue::SharedMessageQueue;

/// Consecutive queue failures after which the receive loop gives up.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 16;

/// Segment carrying creator → opener traffic.
pub fn send_segment_name(name: &str) -> String {
    format!("{}-S", name)
}

/// Segment carrying opener → creator traffic.
pub fn receive_segment_name(name: &str) -> String {
    format!("{}-R", name)
}

/// Bidirectional message transport between two processes over a pair of
/// shared-memory queues.
///
/// Sending is safe from any number of threads. Receiving happens on exactly one
/// dedicated thread per channel (see [`spawn_receive_loop`](Self::spawn_receive_loop)),
/// which owns the reassembly table and hands complete messages to a
/// [`MessageDispatcher`].
pub struct SharedMemoryChannel {
    name: String,
    send: Arc<SharedMessageQueue>,
    recv: Arc<SharedMessageQueue>,
    next_msg_id: AtomicU32,
    send_timeout: Duration,
}

/// Why a receive loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The stop sentinel was read.
    Stopped,
    /// The queue kept failing.
    QueueFailed,
}

/// Counters reported by a finished receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveLoopReport {
    pub exit: LoopExit,
    pub dispatched: u64,
    pub cancelled: u64,
    /// Partial messages discarded to keep the sender's pool from running dry.
    pub evicted: u64,
    /// Partial messages discarded at shutdown.
    pub abandoned: usize,
}

/// Handle to a receive loop running on its own OS thread.
pub struct ReceiveLoop {
    channel: Arc<SharedMemoryChannel>,
    thread: JoinHandle<ReceiveLoopReport>,
}

impl ReceiveLoop {
    /// Wait for the loop thread to end.
    pub fn join(self) -> io::Result<ReceiveLoopReport> {
        self.thread
            .join()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "receive loop thread panicked"))
    }

    /// Post the stop sentinel and wait for the loop to end.
    pub fn shutdown(self) -> io::Result<ReceiveLoopReport> {
        self.channel
            .stop()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.join()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

impl SharedMemoryChannel {
    /// Create both segments. This endpoint sends on `{name}-S` and receives on `{name}-R`.
    pub fn create(name: &str, config: &ChannelConfig) -> io::Result<Arc<Self>> {
        let send = SharedMessageQueue::create(&send_segment_name(name), config.send_slots)?;
        let recv = SharedMessageQueue::create(&receive_segment_name(name), config.receive_slots)?;
        tracing::info!(channel = %name, send_slots = config.send_slots, receive_slots = config.receive_slots, "channel created");
        Ok(Arc::new(Self::from_queues(name, send, recv, config.send_timeout)))
    }

    /// Attach to segments made by [`create`](Self::create). Roles are reversed:
    /// this endpoint sends on `{name}-R` and receives on `{name}-S`.
    pub fn open(name: &str, config: &ChannelConfig) -> io::Result<Arc<Self>> {
        let send = SharedMessageQueue::attach(&receive_segment_name(name))?;
        let recv = SharedMessageQueue::attach(&send_segment_name(name))?;
        tracing::info!(channel = %name, "channel opened");
        Ok(Arc::new(Self::from_queues(name, send, recv, config.send_timeout)))
    }

    fn from_queues(
        name: &str,
        send: SharedMessageQueue,
        recv: SharedMessageQueue,
        send_timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            send: Arc::new(send),
            recv: Arc::new(recv),
            next_msg_id: AtomicU32::new(1),
            send_timeout,
        }
    }

    /// Remove both segments of channel `name` from /dev/shm.
    pub fn unlink(name: &str) -> io::Result<()> {
        unlink_shared_memory(&send_segment_name(name))?;
        unlink_shared_memory(&receive_segment_name(name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send_queue(&self) -> &Arc<SharedMessageQueue> {
        &self.send
    }

    pub fn receive_queue(&self) -> &Arc<SharedMessageQueue> {
        &self.recv
    }

    /// Reserve a fresh message id. Safe from any thread.
    pub fn allocate_id(&self) -> u32 {
        loop {
            let id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
            // 0 is what a zeroed chunk carries; never hand it out
            if id != 0 {
                return id;
            }
        }
    }

    /// Serialize `msg` into as many chunks as needed and post them.
    /// Returns the message id used.
    pub fn send<M: Message>(&self, msg: &M) -> Result<u32, ChannelError> {
        let id = self.allocate_id();
        self.send_with_id(id, msg)?;
        Ok(id)
    }

    /// Like [`send`](Self::send) with an id from [`allocate_id`](Self::allocate_id),
    /// for payloads that must carry their own message id.
    pub fn send_with_id<M: Message>(&self, id: u32, msg: &M) -> Result<(), ChannelError> {
        let mut writer = ChunkWriter::new(&self.send, id, M::MESSAGE_TYPE.value(), self.send_timeout);

        if let Err(e) = encode_message(msg, &mut writer) {
            let queue_error = writer.take_queue_error();
            match writer.abort() {
                Ok(true) => tracing::warn!(channel = %self.name, msg_id = id, "partial message cancelled"),
                Ok(false) => {}
                Err(cancel_err) => {
                    tracing::error!(channel = %self.name, msg_id = id, error = %cancel_err, "cancel notice could not be posted")
                }
            }
            return Err(match queue_error {
                Some(q) => ChannelError::Queue(q),
                None => ChannelError::SerializeFail(e),
            });
        }

        let fragments = writer.finish()?;
        tracing::trace!(channel = %self.name, msg_id = id, msg_type = M::MESSAGE_TYPE.value(), fragments, "message sent");
        Ok(())
    }

    /// Re-send an already encoded message under a fresh id, keeping its type and bytes.
    pub fn forward(&self, chain: &ChunkChain) -> Result<u32, ChannelError> {
        let id = self.allocate_id();
        let mut writer = ChunkWriter::new(&self.send, id, chain.msg_type(), self.send_timeout);

        if let Err(e) = io::copy(&mut chain.reader(), &mut writer) {
            let queue_error = writer.take_queue_error();
            if let Err(cancel_err) = writer.abort() {
                tracing::error!(channel = %self.name, msg_id = id, error = %cancel_err, "cancel notice could not be posted");
            }
            return Err(match queue_error {
                Some(q) => ChannelError::Queue(q),
                None => ChannelError::Io(e),
            });
        }

        writer.finish()?;
        tracing::trace!(channel = %self.name, msg_id = id, from = chain.id(), "message forwarded");
        Ok(id)
    }

    /// Decode the message held by `chain` as `M`.
    ///
    /// The chain is consumed: every chunk goes back to the receive queue before
    /// this returns, whatever the outcome.
    pub fn deserialize<M: Message>(&self, chain: Option<ChunkChain>) -> Result<M, ChannelError> {
        let chain = chain.ok_or(ChannelError::DeserializeFailByFirstSegmentIsNull)?;
        let result = decode_message::<M, _>(&mut chain.reader());
        if let Err(e) = chain.release() {
            tracing::error!(channel = %self.name, error = %e, "failed to return chunks after deserialize");
        }
        result
    }

    /// Post the stop sentinel to this endpoint's own receive queue.
    ///
    /// Messages posted before the sentinel are still dispatched. If the peer
    /// holds every chunk of the queue the loop is woken without a sentinel and
    /// stops at once.
    pub fn stop(&self) -> Result<(), ChannelError> {
        match self.recv.try_acquire_for_write() {
            Ok(mut sentinel) => {
                self.recv.chunk_mut(&mut sentinel).flag = ChunkFlags::STOP;
                self.recv.post(sentinel)?;
                tracing::debug!(channel = %self.name, "stop sentinel posted");
            }
            Err(QueueError::Full(_)) => {
                self.recv.request_stop();
                tracing::warn!(channel = %self.name, "receive queue exhausted; loop woken without a sentinel");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Run the receive loop on a dedicated thread named `shm-recv-{name}`.
    pub fn spawn_receive_loop(
        self: &Arc<Self>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> io::Result<ReceiveLoop> {
        let channel = Arc::clone(self);
        let thread = thread::Builder::new()
            .name(format!("shm-recv-{}", self.name))
            .spawn(move || channel.run_receive_loop(dispatcher.as_ref()))?;
        Ok(ReceiveLoop {
            channel: Arc::clone(self),
            thread,
        })
    }

    /// Block the calling thread reading, reassembling and dispatching messages
    /// until the stop sentinel arrives.
    pub fn run_receive_loop(self: &Arc<Self>, dispatcher: &dyn MessageDispatcher) -> ReceiveLoopReport {
        // Owned by this frame and never shared
        let mut table = ReassemblyTable::new(Arc::clone(&self.recv));
        let mut dispatched = 0u64;
        let mut cancelled = 0u64;
        let mut evicted = 0u64;
        let mut errors = 0u32;

        tracing::info!(channel = %self.name, "receive loop started");

        let exit = loop {
            let handle = match self.recv.acquire_for_read() {
                Ok(handle) => {
                    errors = 0;
                    handle
                }
                Err(QueueError::Stopped(_)) => break LoopExit::Stopped,
                Err(e) => {
                    errors += 1;
                    tracing::error!(channel = %self.name, error = %e, errors, "failed to read from queue");
                    if errors >= MAX_CONSECUTIVE_READ_ERRORS {
                        break LoopExit::QueueFailed;
                    }
                    continue;
                }
            };

            if self.recv.chunk(&handle).is_stop() {
                if let Err(e) = self.recv.return_chunk(handle) {
                    tracing::error!(channel = %self.name, error = %e, "failed to return stop sentinel");
                }
                break LoopExit::Stopped;
            }

            match table.accept(handle) {
                Fragment::Complete(chain) => {
                    dispatched += 1;
                    tracing::trace!(channel = %self.name, msg_id = chain.id(), msg_type = chain.msg_type(), fragments = chain.len(), "dispatch");
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        dispatcher.process_message(self, chain)
                    }));
                    if outcome.is_err() {
                        tracing::error!(channel = %self.name, "dispatcher panicked; message dropped");
                    }
                }
                Fragment::Pending => {}
                Fragment::Cancelled { id, dropped } => {
                    cancelled += 1;
                    tracing::debug!(channel = %self.name, msg_id = id, dropped, "partial message cancelled by sender");
                }
                Fragment::Evicted { id, dropped } => {
                    evicted += 1;
                    tracing::warn!(channel = %self.name, msg_id = id, dropped, held = table.held(), "partial message evicted");
                }
            }
        };

        let abandoned = table.clear();
        if abandoned > 0 {
            tracing::warn!(channel = %self.name, abandoned, "discarded partial messages at shutdown");
        }
        tracing::info!(channel = %self.name, ?exit, dispatched, "receive loop stopped");

        ReceiveLoopReport {
            exit,
            dispatched,
            cancelled,
            evicted,
            abandoned,
        }
    }
}
