use serde::{Deserialize, Serialize};
use std::fmt;

use super::codec::Message;
use super::types::{MessageType, PayloadType};

/// Which process a call originated from. The Host uses it to route replies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageSource {
    /// The Host process itself.
    Host,
    /// A primary worker process, identified by the peer id its supervisor assigned.
    AppContainer { peer_id: u32 },
    /// A per-debug-session worker.
    DebugSession { session_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ContentType {
    #[default]
    Binary,
    Json,
}

/// Opaque session identity propagated into the service call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken(pub String);

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceErrorKind {
    /// No service is registered under the requested path.
    NotFound,
    /// The service ran and failed (or panicked).
    Failed,
    /// The receiving side could not run the call at all.
    Unavailable,
}

/// Error carried back to the caller inside an [`InvokeResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn not_found(service: &str) -> Self {
        Self {
            kind: ServiceErrorKind::NotFound,
            message: format!("service `{}` is not registered", service),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: ServiceErrorKind::Failed,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: ServiceErrorKind::Unavailable,
            message: message.into(),
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ServiceError {}

/// Result of a remote service call as seen by the caller.
pub type InvokeOutcome = Result<Vec<u8>, ServiceError>;

/// The fields a reply must echo so the caller can match it to its call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub source: MessageSource,
    pub content_type: ContentType,
    pub wait_handle: u64,
    pub source_msg_id: u32,
}

/// RPC call into a service on the other side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeRequire {
    pub source: MessageSource,
    pub content_type: ContentType,
    pub wait_handle: u64,
    pub source_msg_id: u32,
    pub session: Option<SessionToken>,
    /// Dotted path `module.Service.Method`.
    pub service: String,
    /// Marshalled into the receiver's address space; the receiver must release it.
    pub args: Vec<u8>,
}

impl InvokeRequire {
    pub fn correlation(&self) -> Correlation {
        Correlation {
            source: self.source.clone(),
            content_type: self.content_type,
            wait_handle: self.wait_handle,
            source_msg_id: self.source_msg_id,
        }
    }
}

/// RPC reply. `result` carries either the service's value or its error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub source: MessageSource,
    pub content_type: ContentType,
    pub wait_handle: u64,
    pub source_msg_id: u32,
    pub result: InvokeOutcome,
}

impl InvokeResponse {
    pub fn reply_to(correlation: Correlation, result: InvokeOutcome) -> Self {
        Self {
            source: correlation.source,
            content_type: correlation.content_type,
            wait_handle: correlation.wait_handle,
            source_msg_id: correlation.source_msg_id,
            result,
        }
    }
}

/// Cache eviction notice pushed by the model layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InvalidModelsCache {
    pub services: Vec<String>,
    pub others: Vec<u64>,
}

/// Telemetry push for one service method execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRequire {
    pub method: String,
    pub duration_micros: u64,
}

impl Message for InvokeRequire {
    const MESSAGE_TYPE: MessageType = MessageType::InvokeRequire;
    const PAYLOAD_TYPE: PayloadType = PayloadType::InvokeRequire;
}

impl Message for InvokeResponse {
    const MESSAGE_TYPE: MessageType = MessageType::InvokeResponse;
    const PAYLOAD_TYPE: PayloadType = PayloadType::InvokeResponse;
}

impl Message for InvalidModelsCache {
    const MESSAGE_TYPE: MessageType = MessageType::InvalidModelsCache;
    const PAYLOAD_TYPE: PayloadType = PayloadType::InvalidModelsCache;
}

impl Message for MetricRequire {
    const MESSAGE_TYPE: MessageType = MessageType::MetricRequire;
    const PAYLOAD_TYPE: PayloadType = PayloadType::MetricRequire;
}
