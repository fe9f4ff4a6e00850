//! The request stage machine.
//!
//! Drives one request through `LOOKUP -> PROCESSING -> RESPONDING`,
//! dispatching each stage to the registered construct's event target and
//! consuming the completion callbacks constructs publish back. Workers
//! are stateless; every transition round-trips through the store, and
//! callbacks may arrive more than once and out of order with respect to
//! unrelated requests. A completion callback for an already-terminal
//! request is accepted and ignored.

use std::sync::Arc;

use tarn_core::{ContentId, RequestId};

use crate::config::FlowConfig;
use crate::error::{Error, Result};
use crate::events::{EventEnvelope, EventPublisher, FlowEventData};
use crate::job::{Job, JobStatus};
use crate::metrics::FlowMetrics;
use crate::registry::{named_construct, ConstructOperation, ConstructRegistry, ConstructType};
use crate::request::{Request, RequestBody, RequestStage, RequestStatus};
use crate::store::FlowStore;

/// Executes requests against the construct registry and event queue.
#[derive(Clone)]
pub struct RequestStageMachine {
    store: Arc<dyn FlowStore>,
    registry: Arc<dyn ConstructRegistry>,
    publisher: Arc<dyn EventPublisher>,
    config: FlowConfig,
    metrics: FlowMetrics,
}

impl RequestStageMachine {
    /// Creates a stage machine over the given collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn FlowStore>,
        registry: Arc<dyn ConstructRegistry>,
        publisher: Arc<dyn EventPublisher>,
        config: FlowConfig,
    ) -> Self {
        Self {
            store,
            registry,
            publisher,
            config,
            metrics: FlowMetrics::new(),
        }
    }

    /// Resolves a registered construct and validates an instruction body
    /// against its operation schema.
    async fn checked_construct(
        &self,
        construct_type: ConstructType,
        operation: ConstructOperation,
        step: &str,
        body: &serde_json::Value,
    ) -> Result<String> {
        let name = named_construct(construct_type, step, body)?;
        let construct = self
            .registry
            .get(construct_type, &name)
            .await?
            .ok_or_else(|| Error::Schema {
                construct: name.clone(),
                step: step.to_string(),
                message: format!("no registered {construct_type} construct named '{name}'"),
            })?;
        construct.validate_body(operation, step, body)?;
        construct.event_target(operation)
    }

    /// Validates a request body's constructs and schemas without
    /// submitting anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`], [`Error::UnsupportedOperation`], or
    /// [`Error::ChainLimitExceeded`]; all are synchronous rejections.
    pub async fn validate_body(&self, step: &str, body: &RequestBody) -> Result<()> {
        if body.lookup_instructions.is_empty() {
            return Err(Error::Schema {
                construct: ConstructType::Archive.to_string(),
                step: step.to_string(),
                message: "at least one lookup instruction is required".into(),
            });
        }
        if body.lookup_instructions.len() > self.config.max_lookup_fanout {
            return Err(Error::ChainLimitExceeded {
                message: format!(
                    "lookup fan-out {} exceeds the configured maximum of {}",
                    body.lookup_instructions.len(),
                    self.config.max_lookup_fanout
                ),
            });
        }

        for instruction in &body.lookup_instructions {
            self.checked_construct(
                ConstructType::Archive,
                ConstructOperation::Lookup,
                step,
                instruction,
            )
            .await?;
        }
        self.checked_construct(
            ConstructType::Processor,
            ConstructOperation::Process,
            step,
            &body.processing_instructions,
        )
        .await?;
        self.checked_construct(
            ConstructType::Responder,
            ConstructOperation::Respond,
            step,
            &body.response_config,
        )
        .await?;
        Ok(())
    }

    /// Submits a request: validates every construct, persists the row at
    /// stage LOOKUP, and fans out one execute-lookup event per instruction.
    ///
    /// # Errors
    ///
    /// Validation failures reject synchronously with nothing persisted.
    #[tracing::instrument(skip(self, request), fields(request_id = %request.request_id))]
    pub async fn submit(&self, request: Request) -> Result<Request> {
        let label = request.request_id.to_string();
        self.validate_body(&label, &request.body).await?;

        self.store.save_request(&request).await?;
        tracing::info!(
            fanout = request.body.lookup_instructions.len(),
            "request submitted"
        );

        for (index, instruction) in request.body.lookup_instructions.iter().enumerate() {
            let target = self
                .checked_construct(
                    ConstructType::Archive,
                    ConstructOperation::Lookup,
                    &label,
                    instruction,
                )
                .await?;
            self.publisher
                .publish(EventEnvelope::to_target(
                    request.tenant_id.clone(),
                    target,
                    FlowEventData::ExecuteLookup {
                        request_id: request.request_id,
                        job: request.job.clone(),
                        instruction_index: index,
                        instruction: instruction.clone(),
                    },
                ))
                .await?;
        }

        Ok(request)
    }

    /// Loads a request if it can still make progress.
    ///
    /// Terminal requests yield `None` (late redeliveries are ignored). A
    /// request whose owning job already failed is failed here and also
    /// yields `None`.
    async fn load_active(&self, request_id: &RequestId) -> Result<Option<Request>> {
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or(Error::RequestNotFound {
                request_id: *request_id,
            })?;

        if request.is_terminal() {
            tracing::debug!(request_id = %request_id, "callback for terminal request ignored");
            return Ok(None);
        }

        if let Some(job) = self.store.get_job(&request.job).await? {
            if job.status == JobStatus::Failed {
                tracing::warn!(request_id = %request_id, "owning job failed, failing request");
                self.fail_request(request, "owning job failed").await?;
                return Ok(None);
            }
        }

        Ok(Some(request))
    }

    /// Consumes one lookup completion callback.
    ///
    /// The callback that brings the outstanding count to zero aggregates
    /// all returned entries and advances the request to PROCESSING; zero
    /// aggregated entries fails the request. Redelivered callbacks for an
    /// already-recorded instruction index do not advance the join.
    ///
    /// # Errors
    ///
    /// Store and publication failures propagate.
    #[tracing::instrument(skip(self, content_ids), fields(request_id = %request_id, instruction_index))]
    pub async fn on_lookup_completion(
        &self,
        request_id: &RequestId,
        instruction_index: usize,
        content_ids: &[ContentId],
    ) -> Result<()> {
        if self.load_active(request_id).await?.is_none() {
            return Ok(());
        }

        let remaining = self
            .store
            .append_lookup_results(request_id, instruction_index, content_ids)
            .await?;
        tracing::debug!(remaining, "lookup completion recorded");
        if remaining > 0 {
            return Ok(());
        }

        let Some(mut request) = self.load_active(request_id).await? else {
            return Ok(());
        };
        if request.last_known_stage != RequestStage::Lookup {
            tracing::debug!("redelivered lookup callback for advanced request ignored");
            return Ok(());
        }

        if request.lookup_results.is_empty() {
            self.fail_request(request, "lookup returned no entries")
                .await?;
            return Ok(());
        }

        request.advance_to(RequestStage::Processing)?;
        self.metrics.record_stage_transition(
            &RequestStage::Lookup.to_string(),
            &RequestStage::Processing.to_string(),
        );
        self.store.save_request(&request).await?;

        let target = self
            .checked_construct(
                ConstructType::Processor,
                ConstructOperation::Process,
                &request.request_id.to_string(),
                &request.body.processing_instructions,
            )
            .await?;
        self.publisher
            .publish(EventEnvelope::to_target(
                request.tenant_id.clone(),
                target,
                FlowEventData::ExecuteProcessing {
                    request_id: request.request_id,
                    job: request.job.clone(),
                    instruction: request.body.processing_instructions.clone(),
                    content_ids: request.lookup_results.clone(),
                },
            ))
            .await?;
        Ok(())
    }

    /// Consumes the processing completion callback and advances the
    /// request to RESPONDING.
    ///
    /// # Errors
    ///
    /// Store and publication failures propagate.
    #[tracing::instrument(skip(self, content_ids), fields(request_id = %request_id))]
    pub async fn on_processing_completion(
        &self,
        request_id: &RequestId,
        content_ids: &[ContentId],
    ) -> Result<()> {
        let Some(mut request) = self.load_active(request_id).await? else {
            return Ok(());
        };

        if content_ids.is_empty() {
            self.fail_request(request, "processing returned no entries")
                .await?;
            return Ok(());
        }

        request.advance_to(RequestStage::Responding)?;
        self.metrics.record_stage_transition(
            &RequestStage::Processing.to_string(),
            &RequestStage::Responding.to_string(),
        );
        self.store.save_request(&request).await?;

        let target = self
            .checked_construct(
                ConstructType::Responder,
                ConstructOperation::Respond,
                &request.request_id.to_string(),
                &request.body.response_config,
            )
            .await?;
        self.publisher
            .publish(EventEnvelope::to_target(
                request.tenant_id.clone(),
                target,
                FlowEventData::ExecuteResponding {
                    request_id: request.request_id,
                    job: request.job.clone(),
                    instruction: request.body.response_config.clone(),
                    content_ids: content_ids.to_vec(),
                },
            ))
            .await?;
        Ok(())
    }

    /// Consumes the responding completion callback and closes the request.
    ///
    /// Responders must reduce to exactly one entry; anything else fails
    /// the request.
    ///
    /// # Errors
    ///
    /// Store and publication failures propagate.
    #[tracing::instrument(skip(self, content_ids), fields(request_id = %request_id))]
    pub async fn on_responding_completion(
        &self,
        request_id: &RequestId,
        content_ids: &[ContentId],
    ) -> Result<()> {
        let Some(mut request) = self.load_active(request_id).await? else {
            return Ok(());
        };

        let [result] = content_ids else {
            self.fail_request(
                request,
                &format!(
                    "responder returned {} entries, expected exactly one",
                    content_ids.len()
                ),
            )
            .await?;
            return Ok(());
        };

        request.complete(*result);
        self.store.save_request(&request).await?;
        self.close_job(&request, JobStatus::Completed, None).await?;
        self.metrics
            .record_request_terminal(&RequestStatus::Completed.to_string());
        tracing::info!(request_id = %request.request_id, "request completed");

        self.publisher
            .publish(EventEnvelope::new(
                request.tenant_id.clone(),
                FlowEventData::StepCompletion {
                    request_id: request.request_id,
                    status: RequestStatus::Completed,
                },
            ))
            .await?;
        Ok(())
    }

    /// Consumes an explicit failure callback from a construct.
    ///
    /// # Errors
    ///
    /// Store and publication failures propagate.
    #[tracing::instrument(skip(self), fields(request_id = %request_id))]
    pub async fn on_request_failure(&self, request_id: &RequestId, reason: &str) -> Result<()> {
        let Some(request) = self.load_active(request_id).await? else {
            return Ok(());
        };
        self.fail_request(request, reason).await
    }

    /// Fails a request, closes its job, and publishes the step completion.
    async fn fail_request(&self, mut request: Request, message: &str) -> Result<()> {
        request.fail(message);
        self.store.save_request(&request).await?;
        self.close_job(&request, JobStatus::Failed, Some(message))
            .await?;
        self.metrics
            .record_request_terminal(&RequestStatus::Failed.to_string());
        tracing::warn!(request_id = %request.request_id, message, "request failed");

        self.publisher
            .publish(EventEnvelope::new(
                request.tenant_id.clone(),
                FlowEventData::StepCompletion {
                    request_id: request.request_id,
                    status: RequestStatus::Failed,
                },
            ))
            .await?;
        Ok(())
    }

    /// Moves the owning job to a terminal status, tolerating jobs that are
    /// already terminal.
    async fn close_job(
        &self,
        request: &Request,
        status: JobStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let Some(mut job) = self.store.get_job(&request.job).await? else {
            tracing::warn!(job = %request.job, "owning job row missing at request closure");
            return Ok(());
        };
        if job.is_terminal() {
            return Ok(());
        }
        if job.status == JobStatus::Pending {
            job.transition_to(JobStatus::InProgress)?;
        }
        job.transition_to(status)?;
        if let Some(message) = message {
            job.status_message = Some(message.to_string());
        }
        self.store.save_job(&job).await
    }
}

/// Creates and persists the job a standalone request runs under, then
/// submits the request. Convenience for submitters outside a chain.
///
/// # Errors
///
/// Propagates validation and store failures.
pub async fn submit_standalone(
    machine: &RequestStageMachine,
    store: &Arc<dyn FlowStore>,
    tenant_id: &str,
    body: RequestBody,
) -> Result<Request> {
    let job = Job::new(tenant_id, "LAKE_REQUEST");
    store.save_job(&job).await?;
    let request = Request::new(tenant_id, job.job_ref(), body);
    machine.submit(request).await
}
