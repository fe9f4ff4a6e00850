//! The chain coordinator.
//!
//! Executes a validated chain: computes the next executable step group,
//! submits each step as a request through the stage machine, consumes
//! step completion callbacks, applies conditional and validation-based
//! branching, and closes the chain.
//!
//! ## Concurrency
//!
//! Callbacks arrive at least once, unordered, on any worker. Two
//! mechanisms keep concurrent coordination correct:
//!
//! - every `execute_next` pass runs under the chain's coordination mutex
//!   (a conditional-insert row with TTL expiry), and
//! - each step's [`CoordinatedStep`] row is written via conditional
//!   insert by step name before the submission counts, so a pass that
//!   loses the insert race simply skips the step.
//!
//! Completion handling is order-independent: recording a step result is a
//! commutative map-insert plus counter-decrement, and closure is decided
//! by re-listing the step rows rather than by arrival order.

use std::collections::BTreeSet;
use std::sync::Arc;

use ulid::Ulid;

use tarn_core::{ChainId, ContentStore, RequestId};

use crate::chain::{
    BranchAction, Chain, ChainExecutionStatus, ChainStep, CoordinatedStep, StepExecutionStatus,
    ValidationStatus,
};
use crate::config::FlowConfig;
use crate::error::{Error, Result};
use crate::events::{EventEnvelope, EventPublisher, FlowEventData};
use crate::graph::validate_steps;
use crate::job::{FailurePropagation, JobStatus, JobTracker, ScopeOptions};
use crate::machine::RequestStageMachine;
use crate::metrics::FlowMetrics;
use crate::reference::{scan_references, ReferenceResolver};
use crate::registry::ConstructRegistry;
use crate::request::{Request, RequestStatus};
use crate::store::FlowStore;
use crate::validation::{ModelValidator, ResponseValidator};

/// Job types the coordinator creates.
mod job_types {
    pub const CHAIN: &str = "CHAIN_REQUEST";
    pub const STEP: &str = "LAKE_REQUEST";
    pub const VALIDATION: &str = "CHAIN_REQUEST_VALIDATION";
}

/// Outcome of one coordination pass.
///
/// A skipped pass decided nothing about the chain: the mutex holder's own
/// pass owns the decision. Only `Submitted(0)` means the pass actually
/// looked and found nothing executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutePass {
    /// The chain's coordination mutex was held elsewhere.
    Skipped,
    /// The pass ran and newly submitted this many steps.
    Submitted(usize),
}

/// Coordinates chain execution across stateless workers.
#[derive(Clone)]
pub struct ChainCoordinator {
    store: Arc<dyn FlowStore>,
    machine: RequestStageMachine,
    resolver: ReferenceResolver,
    validator: ResponseValidator,
    tracker: JobTracker,
    publisher: Arc<dyn EventPublisher>,
    config: FlowConfig,
    metrics: FlowMetrics,
}

impl ChainCoordinator {
    /// Creates a coordinator over the given collaborators.
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
            machine: RequestStageMachine::new(
                Arc::clone(&store),
                registry,
                Arc::clone(&publisher),
                config.clone(),
            ),
            resolver: ReferenceResolver::new(Arc::clone(&store), Arc::clone(&content)),
            validator: ResponseValidator::new(model, content),
            tracker: JobTracker::new(Arc::clone(&store)),
            store,
            publisher,
            config,
            metrics: FlowMetrics::new(),
        }
    }

    /// Validates a chain declaration without mutating anything.
    ///
    /// Checks the configured step bound, graph structure (duplicates,
    /// undefined references, cycles), and every step body's constructs
    /// and schemas.
    ///
    /// # Errors
    ///
    /// All failures are structural; the chain must not be initiated.
    #[tracing::instrument(skip(self, chain), fields(chain_id = %chain.chain_id))]
    pub async fn validate_chain(&self, chain: &Chain) -> Result<()> {
        if chain.steps.len() > self.config.max_chain_steps {
            return Err(Error::ChainLimitExceeded {
                message: format!(
                    "chain declares {} steps, the configured maximum is {}",
                    chain.steps.len(),
                    self.config.max_chain_steps
                ),
            });
        }

        validate_steps(&chain.steps)?;

        for step in &chain.steps {
            self.machine.validate_body(&step.name, &step.body).await?;
        }
        Ok(())
    }

    /// Validates and starts a persisted chain, submitting its first
    /// executable step group. Returns the number of steps submitted.
    ///
    /// Re-delivery safe: an already-EXECUTING chain just re-runs
    /// `execute_next`; a terminal chain is a no-op.
    ///
    /// # Errors
    ///
    /// Structural validation failures close the chain FAILED.
    #[tracing::instrument(skip(self), fields(chain_id = %chain_id))]
    pub async fn initiate(&self, chain_id: &ChainId) -> Result<usize> {
        let mut chain = self.load_chain(chain_id).await?;
        if chain.is_terminal() {
            return Ok(0);
        }

        if chain.chain_execution_status == ChainExecutionStatus::Pending {
            if let Err(err) = self.validate_chain(&chain).await {
                self.close_chain(chain_id, ChainExecutionStatus::Failed, Some(err.to_string()))
                    .await?;
                return Err(err);
            }

            let mut job = self
                .tracker
                .create(chain.tenant_id.clone(), job_types::CHAIN)
                .await?;
            job.transition_to(JobStatus::InProgress)?;
            self.store.save_job(&job).await?;

            chain.job = Some(job.job_ref());
            chain.start();
            self.store.save_chain(&chain).await?;
            tracing::info!(steps = chain.steps.len(), "chain initiated");
        }

        match self.execute_next(chain_id).await? {
            ExecutePass::Skipped => Ok(0),
            ExecutePass::Submitted(submitted) => Ok(submitted),
        }
    }

    /// Submits every currently executable, not-yet-coordinated step.
    ///
    /// The whole pass runs under the chain's coordination mutex; a caller
    /// that cannot acquire it gets [`ExecutePass::Skipped`] and must
    /// leave both the work and the closure decision to the holder.
    ///
    /// # Errors
    ///
    /// Store, dereference, and submission failures propagate.
    #[tracing::instrument(skip(self), fields(chain_id = %chain_id))]
    pub async fn execute_next(&self, chain_id: &ChainId) -> Result<ExecutePass> {
        let key = format!("chain:{chain_id}");
        let holder = Ulid::new().to_string();
        if !self
            .store
            .try_acquire_mutex(&key, &holder, self.config.mutex_ttl)
            .await?
        {
            tracing::debug!("coordination mutex held elsewhere, skipping pass");
            return Ok(ExecutePass::Skipped);
        }

        let outcome = self.execute_next_locked(chain_id).await;
        self.store.release_mutex(&key, &holder).await?;
        Ok(ExecutePass::Submitted(outcome?))
    }

    async fn execute_next_locked(&self, chain_id: &ChainId) -> Result<usize> {
        let chain = self.load_chain(chain_id).await?;
        if chain.is_terminal() {
            return Ok(0);
        }

        let coordinated: BTreeSet<String> = self
            .store
            .list_steps(chain_id)
            .await?
            .into_iter()
            .map(|s| s.step_name)
            .collect();
        let completed: BTreeSet<String> = chain.executed_requests.keys().cloned().collect();

        let mut submitted = 0_usize;
        for step in &chain.steps {
            if coordinated.contains(&step.name) {
                continue;
            }
            if !Self::is_executable(step, &chain, &completed)? {
                continue;
            }
            if self.submit_step(&chain, step).await? {
                submitted += 1;
            }
        }

        if submitted > 0 {
            let delta = i64::try_from(submitted).unwrap_or(i64::MAX);
            self.store.add_remaining_running(chain_id, delta).await?;
            self.metrics.record_steps_submitted(submitted);
            tracing::info!(submitted, "step group submitted");
        }
        Ok(submitted)
    }

    /// A step is executable when all its references have completed and,
    /// for conditional steps, its condition has been met.
    fn is_executable(step: &ChainStep, chain: &Chain, completed: &BTreeSet<String>) -> Result<bool> {
        if step.conditional && !chain.conditions_met.contains(&step.name) {
            return Ok(false);
        }
        let references = scan_references(&step.body)?;
        Ok(references.iter().all(|r| completed.contains(r)))
    }

    /// Dereferences, creates the child job, writes the RUNNING step row
    /// (conditionally, by name), and submits the request. Returns false
    /// when a concurrent pass already claimed the step name.
    async fn submit_step(&self, chain: &Chain, step: &ChainStep) -> Result<bool> {
        let body = self
            .resolver
            .dereference_body(&step.body, &chain.executed_requests)
            .await?;

        let parent = match &chain.job {
            Some(job_ref) => self.tracker.get(job_ref).await?,
            None => {
                return Err(Error::InvalidStateTransition {
                    from: chain.chain_execution_status.to_string(),
                    to: ChainExecutionStatus::Executing.to_string(),
                    reason: "chain has no job, it was never initiated".into(),
                })
            }
        };

        let job = parent.create_child(job_types::STEP);
        let request = Request::new(chain.tenant_id.clone(), job.job_ref(), body);
        let row = CoordinatedStep::running(chain, step, request.request_id);

        // The conditional insert is the idempotency boundary: losing it
        // means another pass already submitted this step name.
        if !self.store.insert_step_if_new_name(&row).await? {
            tracing::debug!(step = %step.name, "step already coordinated, skipping");
            return Ok(false);
        }

        self.store.save_job(&job).await?;
        self.machine.submit(request).await?;
        tracing::debug!(step = %step.name, "step submitted");
        Ok(true)
    }

    /// Consumes a step completion callback.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StepNotFound`] for requests no chain owns; store
    /// and validation failures propagate.
    #[tracing::instrument(skip(self), fields(request_id = %request_id, status = %terminal_status))]
    pub async fn handle_step_completion(
        &self,
        request_id: &RequestId,
        terminal_status: RequestStatus,
    ) -> Result<()> {
        let mut step = self
            .store
            .get_step_by_request_id(request_id)
            .await?
            .ok_or(Error::StepNotFound {
                request_id: *request_id,
            })?;

        if matches!(
            step.execution_status,
            StepExecutionStatus::Completed | StepExecutionStatus::Failed
        ) {
            tracing::debug!("redelivered completion for terminal step ignored");
            return Ok(());
        }

        let chain_id = step.chain_id;
        let chain = self.load_chain(&chain_id).await?;

        step.execution_status = match terminal_status {
            RequestStatus::Completed => StepExecutionStatus::Completed,
            RequestStatus::Failed => StepExecutionStatus::Failed,
            RequestStatus::Processing => {
                return Err(Error::InvalidStateTransition {
                    from: step.execution_status.to_string(),
                    to: terminal_status.to_string(),
                    reason: "step completion must carry a terminal status".into(),
                })
            }
        };
        self.store.save_step(&step).await?;

        // Late arrivals against a closed chain are recorded but drive
        // nothing further.
        if chain.is_terminal() {
            tracing::debug!("completion for terminal chain recorded and ignored");
            return Ok(());
        }

        if terminal_status == RequestStatus::Failed {
            let cause = Error::StepExecutionFailed {
                message: self
                    .store
                    .get_request(request_id)
                    .await?
                    .and_then(|r| r.status_message)
                    .unwrap_or_else(|| format!("step '{}' failed", step.step_name)),
            };
            self.close_chain(&chain_id, ChainExecutionStatus::Failed, Some(cause.to_string()))
                .await?;
            return Ok(());
        }

        self.store
            .record_step_result(&chain_id, &step.step_name, request_id)
            .await?;

        if step.validation_instructions.is_some() {
            let terminated = self.run_validation(&chain, &mut step, request_id).await?;
            if terminated {
                return Ok(());
            }
        }

        if self.execute_next(&chain_id).await? == ExecutePass::Submitted(0) {
            self.close_if_quiesced(&chain_id).await?;
        }
        Ok(())
    }

    /// Runs a completed step's validation and applies the branch for the
    /// resulting polarity. Returns true when the branch terminated the
    /// chain.
    async fn run_validation(
        &self,
        chain: &Chain,
        step: &mut CoordinatedStep,
        request_id: &RequestId,
    ) -> Result<bool> {
        if step.validation_instructions.is_none() {
            return Ok(false);
        }

        let chain_job = match &chain.job {
            Some(job_ref) => self.tracker.get(job_ref).await?,
            None => {
                return Err(Error::ValidationExecution {
                    message: "chain has no job to attach the validation run to".into(),
                })
            }
        };
        let validation_job = self
            .tracker
            .create_child(&chain_job, job_types::VALIDATION)
            .await?;
        let mut scope = self.tracker.scoped_execution(
            validation_job,
            ScopeOptions::new().propagation(FailurePropagation::None),
        );
        scope.begin().await?;

        let outcome = self.classify_step_result(step, request_id).await;
        let status = match outcome {
            Ok(status) => {
                scope.complete().await?;
                status
            }
            Err(err) => {
                scope.fail(&err.to_string()).await?;
                // Malformed model output and missing content are runtime
                // failures of the validation step itself.
                self.close_chain(
                    &chain.chain_id,
                    ChainExecutionStatus::Failed,
                    Some(err.to_string()),
                )
                .await?;
                return Ok(true);
            }
        };

        step.validation_status = Some(status);
        self.store.save_step(step).await?;
        self.metrics.record_validation(match status {
            ValidationStatus::Success => "SUCCESS",
            ValidationStatus::Failure => "FAILURE",
        });

        let declared = chain.step(&step.step_name).and_then(|s| s.validation.as_ref());
        let branch = declared.and_then(|v| match status {
            ValidationStatus::Success => v.on_success.as_ref(),
            ValidationStatus::Failure => v.on_failure.as_ref(),
        });

        match branch {
            Some(BranchAction::TerminateChain) => {
                match status {
                    ValidationStatus::Failure => {
                        self.close_chain(
                            &chain.chain_id,
                            ChainExecutionStatus::Failed,
                            Some(format!(
                                "validation of step '{}' directed termination",
                                step.step_name
                            )),
                        )
                        .await?;
                    }
                    ValidationStatus::Success => {
                        self.carry_single_producer_result(&chain.chain_id).await?;
                        self.close_chain(
                            &chain.chain_id,
                            ChainExecutionStatus::Completed,
                            Some(format!(
                                "validation of step '{}' directed termination",
                                step.step_name
                            )),
                        )
                        .await?;
                    }
                }
                Ok(true)
            }
            Some(BranchAction::ExecuteStep(name)) => {
                self.store.add_condition_met(&chain.chain_id, name).await?;
                tracing::info!(step = %name, "condition met via validation branch");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn classify_step_result(
        &self,
        step: &CoordinatedStep,
        request_id: &RequestId,
    ) -> Result<ValidationStatus> {
        let instructions =
            step.validation_instructions
                .as_deref()
                .ok_or_else(|| Error::ValidationExecution {
                    message: "step has no validation instructions".into(),
                })?;
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or(Error::RequestNotFound {
                request_id: *request_id,
            })?;
        let content_id = request
            .result_content_id
            .ok_or_else(|| Error::ValidationExecution {
                message: format!("request {request_id} completed without a result entry"),
            })?;

        self.validator
            .validate(
                &content_id,
                instructions,
                step.validation_model_id.as_deref(),
                self.config.validation_max_tokens,
            )
            .await
    }

    /// When exactly one step has produced a result, records it as the
    /// chain's result ahead of a SUCCESS-polarity termination.
    async fn carry_single_producer_result(&self, chain_id: &ChainId) -> Result<()> {
        let chain = self.load_chain(chain_id).await?;
        let mut request_ids = chain.executed_requests.values();
        let (Some(only), None) = (request_ids.next(), request_ids.next()) else {
            return Ok(());
        };

        if let Some(result) = self
            .store
            .get_request(only)
            .await?
            .and_then(|r| r.result_content_id)
        {
            self.store.set_chain_result(chain_id, result).await?;
        }
        Ok(())
    }

    /// Closes the chain when nothing was submitted, every coordinated
    /// step is terminal, and no declared step is still runnable.
    ///
    /// The decision runs under the chain's coordination mutex so it
    /// cannot race a concurrent submission pass. Steps still RUNNING mean
    /// more callbacks are due; an uncoordinated step that is executable
    /// means a submission pass is owed, so the chain stays open for it.
    async fn close_if_quiesced(&self, chain_id: &ChainId) -> Result<()> {
        let key = format!("chain:{chain_id}");
        let holder = Ulid::new().to_string();
        if !self
            .store
            .try_acquire_mutex(&key, &holder, self.config.mutex_ttl)
            .await?
        {
            tracing::debug!("coordination mutex held elsewhere, deferring closure");
            return Ok(());
        }

        let outcome = self.close_if_quiesced_locked(chain_id).await;
        self.store.release_mutex(&key, &holder).await?;
        outcome
    }

    async fn close_if_quiesced_locked(&self, chain_id: &ChainId) -> Result<()> {
        let chain = self.load_chain(chain_id).await?;
        if chain.is_terminal() {
            return Ok(());
        }

        let steps = self.store.list_steps(chain_id).await?;
        let all_terminal = steps.iter().all(|s| {
            matches!(
                s.execution_status,
                StepExecutionStatus::Completed | StepExecutionStatus::Failed
            )
        });
        if !all_terminal {
            return Ok(());
        }

        let coordinated: BTreeSet<String> =
            steps.iter().map(|s| s.step_name.clone()).collect();
        let completed: BTreeSet<String> = chain.executed_requests.keys().cloned().collect();
        for step in &chain.steps {
            if !coordinated.contains(&step.name)
                && Self::is_executable(step, &chain, &completed)?
            {
                tracing::debug!(step = %step.name, "runnable step outstanding, leaving chain open");
                return Ok(());
            }
        }

        let any_failed = steps
            .iter()
            .any(|s| s.execution_status == StepExecutionStatus::Failed);
        let status = if any_failed {
            ChainExecutionStatus::Failed
        } else {
            ChainExecutionStatus::Completed
        };
        self.close_chain(chain_id, status, None).await
    }

    /// Closes the chain exactly once: records closure on the row, closes
    /// the chain's job, and publishes `ChainClosed`.
    async fn close_chain(
        &self,
        chain_id: &ChainId,
        status: ChainExecutionStatus,
        message: Option<String>,
    ) -> Result<()> {
        let mut chain = self.load_chain(chain_id).await?;
        if chain.is_terminal() {
            return Ok(());
        }

        chain.close(status, message.clone());
        self.store.save_chain(&chain).await?;
        self.metrics.record_chain_closed(&status.to_string());
        tracing::info!(chain_id = %chain_id, %status, "chain closed");

        if let Some(job_ref) = &chain.job {
            if let Some(mut job) = self.store.get_job(job_ref).await? {
                if !job.is_terminal() {
                    let job_status = match status {
                        ChainExecutionStatus::Failed => JobStatus::Failed,
                        _ => JobStatus::Completed,
                    };
                    if job.status == JobStatus::Pending {
                        job.transition_to(JobStatus::InProgress)?;
                    }
                    job.transition_to(job_status)?;
                    job.status_message = message.clone();
                    self.store.save_job(&job).await?;
                }
            }
        }

        self.publisher
            .publish(EventEnvelope::new(
                chain.tenant_id.clone(),
                FlowEventData::ChainClosed {
                    chain_id: *chain_id,
                    status,
                    reason: message,
                },
            ))
            .await?;
        Ok(())
    }

    async fn load_chain(&self, chain_id: &ChainId) -> Result<Chain> {
        self.store
            .get_chain(chain_id)
            .await?
            .ok_or(Error::ChainNotFound {
                chain_id: *chain_id,
            })
    }
}
