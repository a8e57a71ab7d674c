// Module naming follows project convention (capitalised namespaces)
#[allow(non_snake_case)]
pub mod Core {
    pub mod SharedMemory;
    pub mod futex;
    pub use SharedMemory::{
        attach_shared_memory, create_shared_memory, unlink_shared_memory, RawHandle,
        SharedMemoryBackend,
    };
}
#[allow(non_snake_case)]
pub mod Queue {
    pub mod layout;
    pub mod ring;
    pub mod queue;
    mod debug;
    pub use layout::{ChunkFlags, MessageChunk, CHUNK_DATA_SIZE, CHUNK_SIZE}; // re-export for stable path
    pub use queue::{ChunkHandle, QueueStats, SharedMessageQueue};
}
#[allow(non_snake_case)]
pub mod Channel {
    pub mod builder;
    pub mod chain;
    pub mod channel;
    pub mod reassembly;
    pub mod writer;
    mod debug;
    pub use builder::{ChannelBuilder, ChannelConfig};
    pub use chain::{ChainReader, ChunkChain};
    pub use channel::{LoopExit, ReceiveLoop, ReceiveLoopReport, SharedMemoryChannel};
    pub use writer::ChunkWriter;
}
#[allow(non_snake_case)]
pub mod Messages {
    pub mod codec;
    pub mod payloads;
    pub mod types;
    pub use codec::Message;
    pub use payloads::{
        ContentType, Correlation, InvalidModelsCache, InvokeOutcome, InvokeRequire,
        InvokeResponse, MessageSource, MetricRequire, ServiceError, ServiceErrorKind,
        SessionToken,
    };
    pub use types::{MessageType, PayloadType};
}
#[allow(non_snake_case)]
pub mod Dispatch {
    pub mod app_container;
    pub mod args;
    pub mod caller;
    pub mod dispatcher;
    pub mod host;
    pub mod invoke;
    pub mod scheduler;
    pub mod service;
    pub mod session;
    pub use app_container::AppContainerDispatcher;
    pub use args::{ArgsAllocator, ArgsLease, HeapArgsAllocator, TrackingArgsAllocator};
    pub use caller::RpcCaller;
    pub use dispatcher::{EventSink, LoggingEventSink, MessageDispatcher};
    pub use host::{HostDispatcher, Route};
    pub use invoke::InvokeContext;
    pub use scheduler::{Job, TokioScheduler, WorkScheduler};
    pub use service::{ServiceInvoker, ServiceRegistry};
    pub use session::{current_session, with_session};
}
#[allow(non_snake_case)]
pub mod Tasks {
    pub mod task_source;
    pub use task_source::{PooledTaskSource, TaskSourceFuture, TaskSourcePool};
}
#[allow(non_snake_case)]
pub mod Debug {
    pub mod StructDebug;
}
pub mod error;
