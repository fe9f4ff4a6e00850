//! Chain rows: declared steps, execution bookkeeping, and the per-step
//! coordination records.
//!
//! A chain is a declarative set of named steps with dependency edges
//! expressed as references inside step bodies. The chain row accumulates
//! execution state (which conditions fired, which steps produced which
//! requests, how many are still running); one [`CoordinatedStep`] row per
//! submitted step is the idempotency boundary for concurrent coordinator
//! passes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tarn_core::{ChainId, ContentId, RequestId};

use crate::job::JobRef;
use crate::request::RequestBody;

/// What a validation branch does when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BranchAction {
    /// Close the whole chain with this branch's polarity.
    TerminateChain,
    /// Mark the named conditional step's condition met.
    ExecuteStep(String),
}

/// Model-backed validation attached to a chain step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSpec {
    /// Operator-written instructions appended to the classification prompt.
    pub prompt: String,
    /// Model override; the validator's default is used when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    /// Branch taken on a SUCCESS classification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_success: Option<BranchAction>,
    /// Branch taken on a FAILURE classification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<BranchAction>,
}

/// One declared step in a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStep {
    /// Step name, unique within the chain.
    pub name: String,
    /// Conditional steps run only once some branch marks their condition met.
    #[serde(default)]
    pub conditional: bool,
    /// The request bodies this step submits, possibly containing references.
    #[serde(flatten)]
    pub body: RequestBody,
    /// Optional validation of this step's result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSpec>,
}

impl ChainStep {
    /// Creates an unconditional step with the given body.
    #[must_use]
    pub fn new(name: impl Into<String>, body: RequestBody) -> Self {
        Self {
            name: name.into(),
            conditional: false,
            body,
            validation: None,
        }
    }

    /// Marks the step conditional.
    #[must_use]
    pub const fn conditional(mut self) -> Self {
        self.conditional = true;
        self
    }

    /// Attaches a validation spec.
    #[must_use]
    pub fn with_validation(mut self, validation: ValidationSpec) -> Self {
        self.validation = Some(validation);
        self
    }
}

/// Chain execution lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainExecutionStatus {
    /// Validated but not yet started.
    Pending,
    /// Steps are being submitted and completed.
    Executing,
    /// All runnable steps finished successfully.
    Completed,
    /// A step failed, or a FAILURE-polarity termination fired.
    Failed,
}

impl ChainExecutionStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ChainExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Executing => write!(f, "EXECUTING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// A chain row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chain {
    /// Unique chain identifier.
    pub chain_id: ChainId,
    /// Tenant scope.
    pub tenant_id: String,
    /// The job tracking this chain's execution, set at initiation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobRef>,
    /// The declared steps, as submitted.
    pub steps: Vec<ChainStep>,
    /// Current lifecycle state.
    pub chain_execution_status: ChainExecutionStatus,
    /// Names of conditional steps whose conditions have been met.
    pub conditions_met: BTreeSet<String>,
    /// Step name to the request each submission produced.
    pub executed_requests: BTreeMap<String, RequestId>,
    /// Submitted steps not yet terminal.
    pub num_remaining_running_requests: i64,
    /// Steps never submitted, populated when the chain closes.
    pub unexecuted_request_names: BTreeSet<String>,
    /// Result carried out of a SUCCESS-polarity termination.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_content_id: Option<ContentId>,
    /// When the row was created.
    pub created_on: DateTime<Utc>,
    /// When execution started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    /// When the chain closed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
    /// Closure detail, set on failure or termination.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

impl Chain {
    /// Creates a new PENDING chain from declared steps.
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, steps: Vec<ChainStep>) -> Self {
        Self {
            chain_id: ChainId::generate(),
            tenant_id: tenant_id.into(),
            job: None,
            steps,
            chain_execution_status: ChainExecutionStatus::Pending,
            conditions_met: BTreeSet::new(),
            executed_requests: BTreeMap::new(),
            num_remaining_running_requests: 0,
            unexecuted_request_names: BTreeSet::new(),
            result_content_id: None,
            created_on: Utc::now(),
            started: None,
            ended: None,
            status_message: None,
        }
    }

    /// Returns true if the chain has closed, either way.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.chain_execution_status.is_terminal()
    }

    /// Looks up a declared step by name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&ChainStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Marks the chain EXECUTING and stamps `started`.
    pub fn start(&mut self) {
        self.chain_execution_status = ChainExecutionStatus::Executing;
        self.started = Some(Utc::now());
    }

    /// Closes the chain, stamping `ended` and recording which declared
    /// steps were never submitted.
    pub fn close(&mut self, status: ChainExecutionStatus, message: Option<String>) {
        self.chain_execution_status = status;
        self.ended = Some(Utc::now());
        self.status_message = message;
        self.unexecuted_request_names = self
            .steps
            .iter()
            .map(|s| s.name.clone())
            .filter(|name| !self.executed_requests.contains_key(name))
            .collect();
    }
}

/// Per-step execution states within a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepExecutionStatus {
    /// Row created but the request not yet submitted.
    Pending,
    /// The step's request is in flight.
    Running,
    /// The step's request completed.
    Completed,
    /// The step's request failed.
    Failed,
}

impl fmt::Display for StepExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Outcome of a model validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    /// The result met the validation instructions.
    Success,
    /// The result did not meet the validation instructions.
    Failure,
}

/// One submitted step, keyed `(chain_id, request_id)`.
///
/// Conditional insertion of this row by step name is what makes concurrent
/// coordinator passes submit each step at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatedStep {
    /// The owning chain.
    pub chain_id: ChainId,
    /// The request the step submission produced.
    pub request_id: RequestId,
    /// Tenant scope.
    pub tenant_id: String,
    /// The declared step name.
    pub step_name: String,
    /// The step's execution state.
    pub execution_status: StepExecutionStatus,
    /// Validation instructions, copied from the step declaration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_instructions: Option<String>,
    /// Validation model override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_model_id: Option<String>,
    /// Recorded validation outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_status: Option<ValidationStatus>,
    /// When the row was created.
    pub created_on: DateTime<Utc>,
}

impl CoordinatedStep {
    /// Creates a RUNNING step row for a freshly submitted request.
    #[must_use]
    pub fn running(chain: &Chain, step: &ChainStep, request_id: RequestId) -> Self {
        Self {
            chain_id: chain.chain_id,
            request_id,
            tenant_id: chain.tenant_id.clone(),
            step_name: step.name.clone(),
            execution_status: StepExecutionStatus::Running,
            validation_instructions: step.validation.as_ref().map(|v| v.prompt.clone()),
            validation_model_id: step.validation.as_ref().and_then(|v| v.model_id.clone()),
            validation_status: None,
            created_on: Utc::now(),
        }
    }
}
