//! Event envelopes and publication.
//!
//! Workers communicate only through a durable, at-least-once, unordered
//! event queue. Envelopes are `CloudEvents`-compatible:
//!
//! - `id`: unique event identifier (ULID)
//! - `source`: event origin URI (`/tarn/flow/{tenant}`)
//! - `type`: `tarn.flow.{event_name}` for coordinator-facing events; the
//!   construct's registered event target verbatim for execute events
//! - `time`: event timestamp
//! - `data`: the payload
//!
//! ## Idempotency
//!
//! Every envelope carries an `idempotency_key` derived deterministically
//! from the logical event's identity, so redelivered and re-published
//! duplicates of the same logical event carry the same key and consumers
//! can deduplicate.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use tarn_core::{ChainId, ContentId, RequestId};

use crate::chain::ChainExecutionStatus;
use crate::error::{Error, Result};
use crate::job::JobRef;
use crate::request::RequestStatus;

/// Event type strings for coordinator-facing events.
pub mod types {
    /// A submitted chain should begin executing.
    pub const CHAIN_INITIATE: &str = "tarn.flow.chain_initiate";
    /// A step's request reached a terminal status.
    pub const STEP_COMPLETION: &str = "tarn.flow.step_completion";
    /// One lookup instruction finished.
    pub const LOOKUP_COMPLETION: &str = "tarn.flow.lookup_completion";
    /// The processing pass finished.
    pub const PROCESSING_COMPLETION: &str = "tarn.flow.processing_completion";
    /// The responding pass finished.
    pub const RESPONDING_COMPLETION: &str = "tarn.flow.responding_completion";
    /// A construct reported a request failure.
    pub const REQUEST_FAILURE: &str = "tarn.flow.request_failure";
    /// A chain closed.
    pub const CHAIN_CLOSED: &str = "tarn.flow.chain_closed";
}

/// `CloudEvents`-compatible envelope for orchestration events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Unique event identifier (ULID).
    pub id: String,

    /// Event origin URI, `/tarn/flow/{tenant_id}`.
    pub source: String,

    /// `CloudEvents` specification version.
    pub specversion: String,

    /// Event type, or a construct event target for execute events.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Event timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    /// Content type of the data field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,

    /// Tenant scope.
    pub tenant_id: String,

    /// Idempotency key, deterministic per logical event.
    pub idempotency_key: String,

    /// The ID of the event that caused this one, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Schema version for the envelope + payload.
    pub schema_version: u32,

    /// Event payload.
    pub data: FlowEventData,
}

impl EventEnvelope {
    /// Creates an envelope with the payload's default event type.
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, data: FlowEventData) -> Self {
        let tenant = tenant_id.into();
        let id = Ulid::new().to_string();
        let idempotency_key = data.idempotency_key();
        let event_type = data.event_type().to_string();

        Self {
            id,
            source: format!("/tarn/flow/{tenant}"),
            specversion: "1.0".into(),
            event_type,
            time: Some(Utc::now()),
            datacontenttype: Some("application/json".into()),
            tenant_id: tenant,
            idempotency_key,
            causation_id: None,
            schema_version: 1,
            data,
        }
    }

    /// Creates an envelope addressed to a construct's event target.
    #[must_use]
    pub fn to_target(
        tenant_id: impl Into<String>,
        target: impl Into<String>,
        data: FlowEventData,
    ) -> Self {
        let mut envelope = Self::new(tenant_id, data);
        envelope.event_type = target.into();
        envelope
    }

    /// Sets the causation identifier.
    #[must_use]
    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }
}

/// Orchestration event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlowEventData {
    /// A persisted chain should begin executing.
    ChainInitiate {
        /// The chain to start.
        chain_id: ChainId,
    },

    /// An archive should run one lookup instruction.
    ExecuteLookup {
        /// The owning request.
        request_id: RequestId,
        /// The owning request's job, for child-job creation.
        job: JobRef,
        /// Position within the request's lookup fan-out.
        instruction_index: usize,
        /// The dereferenced lookup instruction.
        instruction: Value,
    },

    /// A processor should run over the aggregated lookup results.
    ExecuteProcessing {
        /// The owning request.
        request_id: RequestId,
        /// The owning request's job.
        job: JobRef,
        /// The dereferenced processing instructions.
        instruction: Value,
        /// All content entries the lookups produced.
        content_ids: Vec<ContentId>,
    },

    /// A responder should reduce processed entries to one response.
    ExecuteResponding {
        /// The owning request.
        request_id: RequestId,
        /// The owning request's job.
        job: JobRef,
        /// The dereferenced response config.
        instruction: Value,
        /// The entries the processing pass produced.
        content_ids: Vec<ContentId>,
    },

    /// One lookup instruction finished.
    LookupCompletion {
        /// The owning request.
        request_id: RequestId,
        /// Position within the request's lookup fan-out.
        instruction_index: usize,
        /// Content entries this lookup produced.
        content_ids: Vec<ContentId>,
    },

    /// The processing pass finished.
    ProcessingCompletion {
        /// The owning request.
        request_id: RequestId,
        /// Content entries the processing pass produced.
        content_ids: Vec<ContentId>,
    },

    /// The responding pass finished.
    RespondingCompletion {
        /// The owning request.
        request_id: RequestId,
        /// Content entries the responding pass produced; must be exactly one.
        content_ids: Vec<ContentId>,
    },

    /// A construct reported a request failure.
    RequestFailure {
        /// The failing request.
        request_id: RequestId,
        /// What went wrong.
        reason: String,
    },

    /// A step's request reached a terminal status.
    StepCompletion {
        /// The finished request.
        request_id: RequestId,
        /// COMPLETED or FAILED.
        status: RequestStatus,
    },

    /// A chain closed.
    ChainClosed {
        /// The closed chain.
        chain_id: ChainId,
        /// COMPLETED or FAILED.
        status: ChainExecutionStatus,
        /// Closure detail, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl FlowEventData {
    /// Returns the default event type for this payload.
    ///
    /// Execute payloads are normally re-addressed to a construct target
    /// via [`EventEnvelope::to_target`].
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ChainInitiate { .. } => types::CHAIN_INITIATE,
            Self::ExecuteLookup { .. } => "tarn.flow.execute_lookup",
            Self::ExecuteProcessing { .. } => "tarn.flow.execute_processing",
            Self::ExecuteResponding { .. } => "tarn.flow.execute_responding",
            Self::LookupCompletion { .. } => types::LOOKUP_COMPLETION,
            Self::ProcessingCompletion { .. } => types::PROCESSING_COMPLETION,
            Self::RespondingCompletion { .. } => types::RESPONDING_COMPLETION,
            Self::RequestFailure { .. } => types::REQUEST_FAILURE,
            Self::StepCompletion { .. } => types::STEP_COMPLETION,
            Self::ChainClosed { .. } => types::CHAIN_CLOSED,
        }
    }

    /// Returns the deterministic idempotency key for this logical event.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        match self {
            Self::ChainInitiate { chain_id } => format!("chain-initiate:{chain_id}"),
            Self::ExecuteLookup {
                request_id,
                instruction_index,
                ..
            } => format!("execute-lookup:{request_id}:{instruction_index}"),
            Self::ExecuteProcessing { request_id, .. } => {
                format!("execute-processing:{request_id}")
            }
            Self::ExecuteResponding { request_id, .. } => {
                format!("execute-responding:{request_id}")
            }
            Self::LookupCompletion {
                request_id,
                instruction_index,
                ..
            } => format!("lookup-completion:{request_id}:{instruction_index}"),
            Self::ProcessingCompletion { request_id, .. } => {
                format!("processing-completion:{request_id}")
            }
            Self::RespondingCompletion { request_id, .. } => {
                format!("responding-completion:{request_id}")
            }
            Self::RequestFailure { request_id, .. } => format!("request-failure:{request_id}"),
            Self::StepCompletion { request_id, status } => {
                format!("step-completion:{request_id}:{status}")
            }
            Self::ChainClosed { chain_id, .. } => format!("chain-closed:{chain_id}"),
        }
    }
}

/// Publishes envelopes onto the durable queue.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes one envelope.
    async fn publish(&self, envelope: EventEnvelope) -> Result<()>;
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// In-memory publisher that records envelopes for tests.
#[derive(Debug, Default)]
pub struct InMemoryEventPublisher {
    published: RwLock<Vec<EventEnvelope>>,
}

impl InMemoryEventPublisher {
    /// Creates an empty publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of everything published so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn published(&self) -> Result<Vec<EventEnvelope>> {
        let published = self.published.read().map_err(poison_err)?;
        Ok(published.clone())
    }

    /// Removes and returns everything published so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn drain(&self) -> Result<Vec<EventEnvelope>> {
        let mut published = self.published.write().map_err(poison_err)?;
        Ok(std::mem::take(&mut *published))
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, envelope: EventEnvelope) -> Result<()> {
        let mut published = self.published.write().map_err(poison_err)?;
        published.push(envelope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_defaults_and_source() {
        let chain_id = ChainId::generate();
        let envelope = EventEnvelope::new("acme", FlowEventData::ChainInitiate { chain_id });

        assert_eq!(envelope.source, "/tarn/flow/acme");
        assert_eq!(envelope.event_type, types::CHAIN_INITIATE);
        assert_eq!(envelope.specversion, "1.0");
        assert_eq!(
            envelope.idempotency_key,
            format!("chain-initiate:{chain_id}")
        );
    }

    #[test]
    fn execute_events_are_readdressed_to_construct_targets() {
        let envelope = EventEnvelope::to_target(
            "acme",
            "tarn_archive_vector_lookup",
            FlowEventData::ExecuteLookup {
                request_id: RequestId::generate(),
                job: JobRef::new("LAKE_REQUEST", tarn_core::JobId::generate()),
                instruction_index: 0,
                instruction: serde_json::json!({"archive": "VECTOR"}),
            },
        );
        assert_eq!(envelope.event_type, "tarn_archive_vector_lookup");
    }

    #[test]
    fn idempotency_keys_are_deterministic() {
        let request_id = RequestId::generate();
        let a = FlowEventData::StepCompletion {
            request_id,
            status: RequestStatus::Completed,
        };
        let b = FlowEventData::StepCompletion {
            request_id,
            status: RequestStatus::Completed,
        };
        assert_eq!(a.idempotency_key(), b.idempotency_key());
    }

    #[tokio::test]
    async fn in_memory_publisher_records() -> Result<()> {
        let publisher = InMemoryEventPublisher::new();
        publisher
            .publish(EventEnvelope::new(
                "acme",
                FlowEventData::ChainInitiate {
                    chain_id: ChainId::generate(),
                },
            ))
            .await?;

        assert_eq!(publisher.published()?.len(), 1);
        assert_eq!(publisher.drain()?.len(), 1);
        assert!(publisher.published()?.is_empty());
        Ok(())
    }
}
