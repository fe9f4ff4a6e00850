//! Event dispatch for stateless workers.
//!
//! A worker pops an envelope off the queue and hands it to
//! [`EventDispatcher::dispatch`], which routes it by event type through an
//! explicit registration table resolved at startup. Unknown event types
//! are an error: a queue misrouting should surface, not vanish.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;

use tarn_core::ContentStore;

use crate::config::FlowConfig;
use crate::coordinator::ChainCoordinator;
use crate::error::{Error, Result};
use crate::events::{EventEnvelope, EventPublisher};
use crate::handlers;
use crate::machine::RequestStageMachine;
use crate::metrics::FlowMetrics;
use crate::registry::ConstructRegistry;
use crate::store::FlowStore;
use crate::validation::ModelValidator;

/// Everything a handler needs, shared across all of a worker's handlers.
pub struct FlowRuntime {
    /// The chain coordinator.
    pub coordinator: ChainCoordinator,
    /// The request stage machine.
    pub machine: RequestStageMachine,
}

impl FlowRuntime {
    /// Wires up a runtime over the given collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn FlowStore>,
        content: Arc<dyn ContentStore>,
        registry: Arc<dyn ConstructRegistry>,
        publisher: Arc<dyn EventPublisher>,
        model: Arc<dyn ModelValidator>,
        config: FlowConfig,
    ) -> Self {
        Self {
            coordinator: ChainCoordinator::new(
                Arc::clone(&store),
                Arc::clone(&content),
                Arc::clone(&registry),
                Arc::clone(&publisher),
                model,
                config.clone(),
            ),
            machine: RequestStageMachine::new(store, registry, publisher, config),
        }
    }
}

/// A registered event handler.
pub type HandlerFn = for<'a> fn(&'a FlowRuntime, &'a EventEnvelope) -> BoxFuture<'a, Result<()>>;

/// Routes envelopes to handlers by event type.
pub struct EventDispatcher {
    runtime: Arc<FlowRuntime>,
    handlers: HashMap<String, HandlerFn>,
    metrics: FlowMetrics,
}

impl EventDispatcher {
    /// Creates a dispatcher with the default coordinator-facing handlers
    /// registered.
    #[must_use]
    pub fn new(runtime: Arc<FlowRuntime>) -> Self {
        let mut dispatcher = Self {
            runtime,
            handlers: HashMap::new(),
            metrics: FlowMetrics::new(),
        };
        handlers::register_defaults(&mut dispatcher);
        dispatcher
    }

    /// Registers a handler for an event type, replacing any existing one.
    pub fn register(&mut self, event_type: impl Into<String>, handler: HandlerFn) {
        self.handlers.insert(event_type.into(), handler);
    }

    /// Returns the registered event types.
    #[must_use]
    pub fn registered_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Dispatches one envelope to its handler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownEventType`] for unregistered types; handler
    /// errors propagate.
    #[tracing::instrument(skip(self, envelope), fields(event_type = %envelope.event_type, event_id = %envelope.id))]
    pub async fn dispatch(&self, envelope: &EventEnvelope) -> Result<()> {
        let handler =
            self.handlers
                .get(&envelope.event_type)
                .ok_or_else(|| Error::UnknownEventType {
                    event_type: envelope.event_type.clone(),
                })?;

        let started = Instant::now();
        let outcome = handler(&self.runtime, envelope).await;
        self.metrics.record_event_handled(
            &envelope.event_type,
            outcome.is_ok(),
            started.elapsed(),
        );

        if let Err(err) = &outcome {
            tracing::warn!(error = %err, "event handler failed");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::events::{types, FlowEventData, InMemoryEventPublisher};
    use crate::registry::InMemoryConstructRegistry;
    use crate::store::memory::InMemoryFlowStore;
    use crate::validation::StaticModelValidator;
    use tarn_core::{ChainId, MemoryContentStore};

    fn dispatcher() -> EventDispatcher {
        let runtime = FlowRuntime::new(
            Arc::new(InMemoryFlowStore::new()),
            Arc::new(MemoryContentStore::new()),
            Arc::new(InMemoryConstructRegistry::new()),
            Arc::new(InMemoryEventPublisher::new()),
            Arc::new(StaticModelValidator::new("SUCCESS")),
            FlowConfig::default(),
        );
        EventDispatcher::new(Arc::new(runtime))
    }

    #[test]
    fn default_handlers_cover_consumed_event_types() {
        let dispatcher = dispatcher();
        let registered = dispatcher.registered_types();
        for expected in [
            types::CHAIN_INITIATE,
            types::STEP_COMPLETION,
            types::LOOKUP_COMPLETION,
            types::PROCESSING_COMPLETION,
            types::RESPONDING_COMPLETION,
            types::REQUEST_FAILURE,
        ] {
            assert!(registered.contains(&expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn unknown_event_type_is_an_error() {
        let dispatcher = dispatcher();
        let mut envelope = EventEnvelope::new(
            "tenant",
            FlowEventData::ChainInitiate {
                chain_id: ChainId::generate(),
            },
        );
        envelope.event_type = "tarn.flow.unheard_of".into();

        assert!(matches!(
            dispatcher.dispatch(&envelope).await,
            Err(Error::UnknownEventType { .. })
        ));
    }
}
