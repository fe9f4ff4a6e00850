//! Error types for the orchestration domain.
//!
//! The taxonomy distinguishes three failure classes with different
//! propagation rules:
//!
//! - **Structural** (`CycleDetected`, `DuplicateStepName`,
//!   `UndefinedReference`, `Schema`, …): rejected synchronously before any
//!   mutation; a chain that fails these never starts executing.
//! - **Runtime** (`StepExecutionFailed`, `ValidationExecution`): fatal to
//!   the owning chain, but already-running sibling steps are not cancelled.
//! - **Invariant** (`UnresolvedReference`, `MalformedReference` reaching
//!   the coordinator at execution time): programmer errors that should
//!   abort loudly rather than be retried.

use tarn_core::{ChainId, JobId, RequestId};

/// The result type used throughout tarn-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A cycle was detected in the chain dependency graph.
    #[error("cycle detected in chain dependency graph: {path:?}")]
    CycleDetected {
        /// The step names along the cycle, ending at the revisited step.
        path: Vec<String>,
    },

    /// Two chain steps share the same name.
    #[error("duplicate chain step name: {name}")]
    DuplicateStepName {
        /// The repeated step name.
        name: String,
    },

    /// A reference targets a step that is not declared in the chain.
    #[error("step '{referrer}' references undefined step '{target}'")]
    UndefinedReference {
        /// The step containing the reference.
        referrer: String,
        /// The undeclared target name.
        target: String,
    },

    /// A reference string does not parse as `REF:<step>.<selector>`.
    #[error("malformed reference '{raw}': {message}")]
    MalformedReference {
        /// The raw reference string.
        raw: String,
        /// Description of the parse failure.
        message: String,
    },

    /// A reference was resolved before its target step completed.
    ///
    /// This indicates the coordinator submitted a step before its
    /// dependencies were satisfied - an internal invariant violation, not a
    /// user error.
    #[error("reference to step '{step}' resolved before the step executed")]
    UnresolvedReference {
        /// The referenced step name.
        step: String,
    },

    /// A step body failed its construct's schema.
    #[error("schema validation failed for construct '{construct}' in step '{step}': {message}")]
    Schema {
        /// The offending construct type name.
        construct: String,
        /// The step whose body failed.
        step: String,
        /// Description of the failure.
        message: String,
    },

    /// A construct does not declare the requested operation.
    #[error("operation '{operation}' is not supported by construct '{construct}' of type '{construct_type}'")]
    UnsupportedOperation {
        /// The requested operation.
        operation: String,
        /// The construct type name.
        construct: String,
        /// The construct category (archive, processor, responder).
        construct_type: String,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// An executing step's underlying work failed.
    #[error("step execution failed: {message}")]
    StepExecutionFailed {
        /// Description of the failure, copied from the failing job.
        message: String,
    },

    /// A validation step's model output could not be classified.
    #[error("validation execution failed: {message}")]
    ValidationExecution {
        /// Description of the failure.
        message: String,
    },

    /// A chain exceeded a configured bound.
    #[error("chain limit exceeded: {message}")]
    ChainLimitExceeded {
        /// Which bound was exceeded.
        message: String,
    },

    /// A job was not found.
    #[error("job not found: {job_type}/{job_id}")]
    JobNotFound {
        /// The job type.
        job_type: String,
        /// The job ID that was not found.
        job_id: JobId,
    },

    /// A request was not found.
    #[error("request not found: {request_id}")]
    RequestNotFound {
        /// The request ID that was not found.
        request_id: RequestId,
    },

    /// A chain was not found.
    #[error("chain not found: {chain_id}")]
    ChainNotFound {
        /// The chain ID that was not found.
        chain_id: ChainId,
    },

    /// No coordinated step row exists for a request.
    #[error("no coordinated step found for request {request_id}")]
    StepNotFound {
        /// The request ID with no coordinated step.
        request_id: RequestId,
    },

    /// No handler is registered for an event type.
    #[error("no handler registered for event type '{event_type}'")]
    UnknownEventType {
        /// The unrecognized event type.
        event_type: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from tarn-core.
    #[error("core error: {0}")]
    Core(#[from] tarn_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true if this error is structural - detectable before any
    /// step is submitted.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::CycleDetected { .. }
                | Self::DuplicateStepName { .. }
                | Self::UndefinedReference { .. }
                | Self::MalformedReference { .. }
                | Self::Schema { .. }
                | Self::UnsupportedOperation { .. }
                | Self::ChainLimitExceeded { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn cycle_error_display_includes_path() {
        let err = Error::CycleDetected {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("cycle detected"));
        assert!(msg.contains('b'));
    }

    #[test]
    fn structural_classification() {
        assert!(Error::DuplicateStepName { name: "a".into() }.is_structural());
        assert!(Error::Schema {
            construct: "VECTOR".into(),
            step: "a".into(),
            message: "missing attribute".into(),
        }
        .is_structural());
        assert!(!Error::StepExecutionFailed {
            message: "boom".into()
        }
        .is_structural());
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "row missing");
        let err = Error::storage_with_source("failed to load chain", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn state_transition_error_display() {
        let err = Error::InvalidStateTransition {
            from: "COMPLETED".into(),
            to: "IN_PROGRESS".into(),
            reason: "terminal states are final".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("COMPLETED"));
        assert!(msg.contains("terminal states are final"));
    }
}
