//! Handler registry keyed by routing-key patterns.
//!
//! Precedence when several patterns accept the same key: the most specific
//! pattern wins (most leading components present); among equally specific
//! patterns the earliest registration wins.

use std::cmp::Reverse;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tracing::info;

use switchyard_core::RoutingKey;

use crate::cancel::CancelSignal;
use crate::envelope::Envelope;
use crate::error::{DispatchError, WorkError};

/// Processes one inbound message.
///
/// Handlers should watch `cancel` and return [`WorkError::Cancelled`] when
/// it fires; a handler that ignores it keeps running after its slot is
/// reclaimed.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope, cancel: CancelSignal) -> Result<(), WorkError>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Envelope, CancelSignal) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), WorkError>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope, cancel: CancelSignal) -> Result<(), WorkError> {
        (self.0)(envelope, cancel).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Envelope, CancelSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WorkError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct Registration {
    name: String,
    pattern: RoutingKey,
    handler: Arc<dyn MessageHandler>,
    seq: u64,
}

#[derive(Default)]
struct Registry {
    registrations: Vec<Registration>,
    next_seq: u64,
}

/// Thread-safe handler registry.
#[derive(Default)]
pub struct Router {
    inner: RwLock<Registry>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` under a unique `name` for every key `pattern` matches.
    pub fn register(
        &self,
        name: impl Into<String>,
        pattern: RoutingKey,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), DispatchError> {
        let name = name.into();
        let mut registry = self.write();
        if registry.registrations.iter().any(|r| r.name == name) {
            return Err(DispatchError::DuplicateHandler(name));
        }
        let seq = registry.next_seq;
        registry.next_seq += 1;
        info!(handler = %name, pattern = %pattern, "handler registered");
        registry.registrations.push(Registration {
            name,
            pattern,
            handler,
            seq,
        });
        Ok(())
    }

    /// Remove a handler by name. Returns false if it was not registered.
    pub fn unregister(&self, name: &str) -> bool {
        let mut registry = self.write();
        let before = registry.registrations.len();
        registry.registrations.retain(|r| r.name != name);
        let removed = registry.registrations.len() != before;
        if removed {
            info!(handler = %name, "handler unregistered");
        }
        removed
    }

    /// Name of the handler that accepts `key`, if any.
    pub fn resolve(&self, key: &RoutingKey) -> Option<String> {
        let registry = self.read();
        Self::best_match(&registry, key).map(|r| r.name.clone())
    }

    /// Handler and its name for `key`.
    pub fn route(&self, key: &RoutingKey) -> Option<(String, Arc<dyn MessageHandler>)> {
        let registry = self.read();
        Self::best_match(&registry, key).map(|r| (r.name.clone(), r.handler.clone()))
    }

    fn best_match<'a>(registry: &'a Registry, key: &RoutingKey) -> Option<&'a Registration> {
        registry
            .registrations
            .iter()
            .filter(|r| r.pattern.matches(key))
            .max_by_key(|r| (r.pattern.specificity(), Reverse(r.seq)))
    }

    /// Look up a handler by registration name.
    pub fn handler(&self, name: &str) -> Option<Arc<dyn MessageHandler>> {
        self.read()
            .registrations
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.handler.clone())
    }

    /// Registered names in registration order.
    pub fn handler_names(&self) -> Vec<String> {
        self.read()
            .registrations
            .iter()
            .map(|r| r.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
