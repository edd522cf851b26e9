//! Router + scheduler composed into the inbound message surface.

use std::sync::Arc;

use tracing::debug;

use switchyard_core::{RoutingKey, SwitchyardConfig};

use crate::envelope::Envelope;
use crate::error::{DispatchError, WorkError};
use crate::metrics::SchedulerSnapshot;
use crate::router::{MessageHandler, Router};
use crate::scheduler::Scheduler;
use crate::work::{WorkId, WorkReport, WorkRequest};

/// Routes envelopes to handlers and schedules each handler invocation.
///
/// Scheduled work carries only the handler's name; the handler itself is
/// looked up when the work starts executing, so unregistering a handler
/// fails its still-queued work instead of keeping the handler alive.
pub struct Dispatcher {
    router: Arc<Router>,
    scheduler: Scheduler,
}

impl Dispatcher {
    pub fn new(config: &SwitchyardConfig) -> Result<Self, DispatchError> {
        Ok(Self::with_scheduler(Scheduler::new(config)?))
    }

    pub fn with_scheduler(scheduler: Scheduler) -> Self {
        Self {
            router: Arc::new(Router::new()),
            scheduler,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn register_handler(
        &self,
        name: impl Into<String>,
        pattern: RoutingKey,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), DispatchError> {
        self.router.register(name, pattern, handler)
    }

    pub fn unregister_handler(&self, name: &str) -> bool {
        self.router.unregister(name)
    }

    /// Route and schedule an envelope.
    pub fn dispatch(&self, envelope: Envelope) -> Result<WorkId, DispatchError> {
        let request = self.request_for(envelope)?;
        self.scheduler.submit(request)
    }

    /// Route and schedule an envelope; `on_complete` receives the final report.
    pub fn dispatch_with_callback<F>(
        &self,
        envelope: Envelope,
        on_complete: F,
    ) -> Result<WorkId, DispatchError>
    where
        F: FnOnce(&WorkReport) + Send + Sync + 'static,
    {
        let request = self.request_for(envelope)?.on_complete(on_complete);
        self.scheduler.submit(request)
    }

    fn request_for(&self, envelope: Envelope) -> Result<WorkRequest, DispatchError> {
        let key = envelope.routing_key.clone();
        let name = self
            .router
            .resolve(&key)
            .ok_or_else(|| DispatchError::NoHandler(key.to_string()))?;
        debug!(routing_key = %key, handler = %name, correlation_id = %envelope.correlation_id, "routed");

        let priority = envelope.priority;
        let caller = envelope.caller.clone();
        let limit = envelope.processing_limit();
        let long_running = envelope.long_running;
        let router = Arc::clone(&self.router);

        let mut request = WorkRequest::new(priority, move |cancel| async move {
            let Some(handler) = router.handler(&name) else {
                return Err(WorkError::failed(format!(
                    "handler '{name}' is no longer registered"
                )));
            };
            handler.handle(envelope, cancel).await
        })
        .caller(caller)
        .routing_key(key)
        .long_running(long_running);
        if let Some(limit) = limit {
            request = request.max_processing_time(limit);
        }
        Ok(request)
    }

    pub fn reserve_bulkhead(&self, priority: i32, slots: usize, overage: usize) -> bool {
        self.scheduler.reserve_bulkhead(priority, slots, overage)
    }

    pub fn cancel(&self, id: WorkId) -> Result<(), DispatchError> {
        self.scheduler.cancel(id)
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.scheduler.snapshot()
    }

    pub fn start(&self) -> Result<(), DispatchError> {
        self.scheduler.start()
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await
    }
}
