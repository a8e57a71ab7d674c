use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::Messages::{InvokeOutcome, ServiceError};

/// Runs a service method named by its dotted path `module.Service.Method`.
///
/// Errors belong in the returned outcome; they travel back to the caller as a
/// normal response.
#[async_trait]
pub trait ServiceInvoker: Send + Sync {
    async fn invoke(&self, service: &str, args: &[u8]) -> InvokeOutcome;
}

pub type ServiceFuture = Pin<Box<dyn Future<Output = InvokeOutcome> + Send>>;

pub type ServiceHandler = Arc<dyn Fn(Vec<u8>) -> ServiceFuture + Send + Sync>;

/// [`ServiceInvoker`] over a table of registered handlers.
#[derive(Default)]
pub struct ServiceRegistry {
    handlers: RwLock<HashMap<String, ServiceHandler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `path`, replacing any earlier one.
    pub fn register<F, Fut>(&self, path: impl Into<String>, handler: F)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = InvokeOutcome> + Send + 'static,
    {
        let path = path.into();
        let boxed: ServiceHandler = Arc::new(move |args| {
            let fut: ServiceFuture = Box::pin(handler(args));
            fut
        });
        if self.handlers.write().insert(path.clone(), boxed).is_some() {
            tracing::debug!(service = %path, "service handler replaced");
        }
    }

    pub fn unregister(&self, path: &str) -> bool {
        self.handlers.write().remove(path).is_some()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.handlers.read().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

#[async_trait]
impl ServiceInvoker for ServiceRegistry {
    async fn invoke(&self, service: &str, args: &[u8]) -> InvokeOutcome {
        // clone out so the lock is not held across the call
        let handler = self.handlers.read().get(service).cloned();
        match handler {
            Some(handler) => handler(args.to_vec()).await,
            None => Err(ServiceError::not_found(service)),
        }
    }
}
