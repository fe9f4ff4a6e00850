//! Request rows and the three-stage pipeline states.
//!
//! A request is one unit of lake work: a lookup fan-out, a processing pass
//! over the aggregated lookup results, and a responding pass that reduces
//! to exactly one result entry. The stage machinery that drives these
//! transitions lives in [`crate::machine`]; this module holds the row
//! itself and its state enums.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tarn_core::{ContentId, RequestId};

use crate::error::{Error, Result};
use crate::job::JobRef;

/// The pipeline stage a request last entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStage {
    /// Fanning out lookup instructions to archives.
    Lookup,
    /// Processing the aggregated lookup results.
    Processing,
    /// Reducing processed entries to a single response.
    Responding,
}

impl RequestStage {
    /// Returns true if the transition from self to target is valid.
    ///
    /// Stages only move forward, one at a time.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Lookup, Self::Processing) | (Self::Processing, Self::Responding)
        )
    }
}

impl fmt::Display for RequestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lookup => write!(f, "LOOKUP"),
            Self::Processing => write!(f, "PROCESSING"),
            Self::Responding => write!(f, "RESPONDING"),
        }
    }
}

/// Overall request status, orthogonal to the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Still moving through the pipeline.
    Processing,
    /// Finished with a single result entry.
    Completed,
    /// Finished with an error.
    Failed,
}

impl RequestStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Processing => write!(f, "PROCESSING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// The three instruction bodies a request executes.
///
/// Bodies are schemaless JSON at this layer; the construct registry
/// validates them against the named construct's schema before submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBody {
    /// One instruction per archive lookup to fan out.
    pub lookup_instructions: Vec<Value>,
    /// Instruction for the processing pass.
    pub processing_instructions: Value,
    /// Configuration for the responding pass.
    pub response_config: Value,
}

/// A lake request row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Unique request identifier.
    pub request_id: RequestId,
    /// Tenant scope.
    pub tenant_id: String,
    /// The job tracking this request's execution.
    pub job: JobRef,
    /// Stage last entered.
    pub last_known_stage: RequestStage,
    /// Overall status.
    pub request_status: RequestStatus,
    /// The instruction bodies, dereferenced before submission.
    #[serde(flatten)]
    pub body: RequestBody,
    /// Lookup callbacks still outstanding.
    pub remaining_lookups: u32,
    /// Content entries accumulated from lookup callbacks.
    pub lookup_results: Vec<ContentId>,
    /// Lookup instruction indices whose callbacks have been recorded.
    pub completed_lookups: BTreeSet<usize>,
    /// The single result entry, set on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_content_id: Option<ContentId>,
    /// When the row was created.
    pub created_on: DateTime<Utc>,
    /// When the responding stage finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_completed_on: Option<DateTime<Utc>>,
    /// Failure detail, set when the status is FAILED.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

impl Request {
    /// Creates a new request in the LOOKUP stage.
    ///
    /// `remaining_lookups` starts at the lookup fan-out width.
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, job: JobRef, body: RequestBody) -> Self {
        let fanout = u32::try_from(body.lookup_instructions.len()).unwrap_or(u32::MAX);
        Self {
            request_id: RequestId::generate(),
            tenant_id: tenant_id.into(),
            job,
            last_known_stage: RequestStage::Lookup,
            request_status: RequestStatus::Processing,
            body,
            remaining_lookups: fanout,
            lookup_results: Vec::new(),
            completed_lookups: BTreeSet::new(),
            result_content_id: None,
            created_on: Utc::now(),
            response_completed_on: None,
            status_message: None,
        }
    }

    /// Returns true if the request has finished, either way.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.request_status.is_terminal()
    }

    /// Advances to the next pipeline stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is terminal or the stage transition
    /// is not forward by exactly one.
    pub fn advance_to(&mut self, target: RequestStage) -> Result<()> {
        if self.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: self.request_status.to_string(),
                to: target.to_string(),
                reason: "request already terminal".into(),
            });
        }
        if !self.last_known_stage.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.last_known_stage.to_string(),
                to: target.to_string(),
                reason: "stages move forward one at a time".into(),
            });
        }
        self.last_known_stage = target;
        Ok(())
    }

    /// Marks the request completed with its single result entry.
    pub fn complete(&mut self, result: ContentId) {
        self.request_status = RequestStatus::Completed;
        self.result_content_id = Some(result);
        self.response_completed_on = Some(Utc::now());
    }

    /// Marks the request failed with a message.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.request_status = RequestStatus::Failed;
        self.status_message = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tarn_core::JobId;

    fn sample_body() -> RequestBody {
        RequestBody {
            lookup_instructions: vec![
                json!({"archive": "VECTOR", "query": "alpha"}),
                json!({"archive": "BASIC", "archiveId": "docs"}),
            ],
            processing_instructions: json!({"processor": "SUMMARIZE"}),
            response_config: json!({"responder": "DIRECT"}),
        }
    }

    fn sample_request() -> Request {
        Request::new(
            "tenant",
            JobRef::new("LAKE_REQUEST", JobId::generate()),
            sample_body(),
        )
    }

    #[test]
    fn new_request_counts_lookup_fanout() {
        let request = sample_request();
        assert_eq!(request.last_known_stage, RequestStage::Lookup);
        assert_eq!(request.request_status, RequestStatus::Processing);
        assert_eq!(request.remaining_lookups, 2);
    }

    #[test]
    fn stages_advance_forward_only() {
        let mut request = sample_request();
        assert!(request.advance_to(RequestStage::Responding).is_err());
        request.advance_to(RequestStage::Processing).unwrap();
        request.advance_to(RequestStage::Responding).unwrap();
        assert!(request.advance_to(RequestStage::Processing).is_err());
    }

    #[test]
    fn terminal_request_rejects_stage_changes() {
        let mut request = sample_request();
        request.fail("lookup returned no entries");
        assert!(request.is_terminal());
        assert!(matches!(
            request.advance_to(RequestStage::Processing),
            Err(Error::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn complete_records_result_and_timestamp() {
        let mut request = sample_request();
        let result = ContentId::generate();
        request.complete(result);
        assert_eq!(request.request_status, RequestStatus::Completed);
        assert_eq!(request.result_content_id, Some(result));
        assert!(request.response_completed_on.is_some());
    }

    #[test]
    fn serializes_with_camel_case_and_screaming_enums() {
        let request = sample_request();
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["lastKnownStage"], "LOOKUP");
        assert_eq!(value["requestStatus"], "PROCESSING");
        assert!(value["lookupInstructions"].is_array());
    }
}
