use std::io;
use thiserror::Error;

/// Failures of the chunk pool behind one queue segment.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no free chunk available in queue `{0}`")]
    Full(String),

    #[error("timed out waiting on queue `{0}`")]
    TimedOut(String),

    #[error("reader of queue `{0}` was asked to stop")]
    Stopped(String),

    #[error("chunk {index} does not belong to queue `{queue}`")]
    ForeignHandle { index: u32, queue: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures of the payload codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload stream error: {0}")]
    Io(#[from] io::Error),

    #[error("payload stream is empty")]
    Empty,

    #[error("{0}")]
    Custom(String),
}

/// Per-message transport failures. None of them take the channel down.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("deserialize failed: first chunk of the chain is missing")]
    DeserializeFailByFirstSegmentIsNull,

    #[error("deserialize failed: expected payload type {expected:#04x}, got {actual:#04x}")]
    DeserializeFailByMessageType { expected: u8, actual: u8 },

    #[error("deserialize failed: {0}")]
    DeserializeFail(#[source] CodecError),

    #[error("serialize failed: {0}")]
    SerializeFail(#[source] CodecError),

    #[error("message type {0:#04x} is not recognised")]
    UnknownMessageType(u8),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The worker pool refused a job.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("worker pool is saturated")]
    Saturated,

    #[error("worker pool is shut down")]
    ShutDown,
}

/// Misuse or failure of a pooled completion slot.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CompletionError {
    #[error("result was already set for this completion")]
    AlreadyCompleted,

    #[error("completion was abandoned before a result was set")]
    Abandoned,

    #[error("result was already taken from this completion")]
    AlreadyTaken,

    #[error("no pending call for wait handle {0}")]
    UnknownWaitHandle(u64),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}
