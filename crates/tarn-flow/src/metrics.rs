//! Observability metrics for the orchestration core.
//!
//! Exposed via the `metrics` crate facade; install any compatible
//! recorder (e.g. a Prometheus exporter) in the host process to export
//! them.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tarn_flow_requests_total` | Counter | `status` | Requests reaching a terminal status |
//! | `tarn_flow_request_stage_transitions_total` | Counter | `from_stage`, `to_stage` | Request stage advances |
//! | `tarn_flow_chains_total` | Counter | `status` | Chains reaching a terminal status |
//! | `tarn_flow_steps_submitted_total` | Counter | - | Chain steps submitted |
//! | `tarn_flow_validations_total` | Counter | `status` | Validation classifications |
//! | `tarn_flow_events_handled_total` | Counter | `event_type`, `result` | Event handler invocations |
//! | `tarn_flow_handler_duration_seconds` | Histogram | `event_type` | Event handler latency |

use std::time::Duration;

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: requests reaching a terminal status.
    pub const REQUESTS_TOTAL: &str = "tarn_flow_requests_total";
    /// Counter: request stage advances.
    pub const REQUEST_STAGE_TRANSITIONS_TOTAL: &str = "tarn_flow_request_stage_transitions_total";
    /// Counter: chains reaching a terminal status.
    pub const CHAINS_TOTAL: &str = "tarn_flow_chains_total";
    /// Counter: chain steps submitted.
    pub const STEPS_SUBMITTED_TOTAL: &str = "tarn_flow_steps_submitted_total";
    /// Counter: validation classifications by outcome.
    pub const VALIDATIONS_TOTAL: &str = "tarn_flow_validations_total";
    /// Counter: event handler invocations by outcome.
    pub const EVENTS_HANDLED_TOTAL: &str = "tarn_flow_events_handled_total";
    /// Histogram: event handler latency in seconds.
    pub const HANDLER_DURATION_SECONDS: &str = "tarn_flow_handler_duration_seconds";
}

/// Label names.
pub mod labels {
    /// Terminal status of a request, chain, or validation.
    pub const STATUS: &str = "status";
    /// Stage a request left.
    pub const FROM_STAGE: &str = "from_stage";
    /// Stage a request entered.
    pub const TO_STAGE: &str = "to_stage";
    /// The envelope event type.
    pub const EVENT_TYPE: &str = "event_type";
    /// Handler outcome, `ok` or `error`.
    pub const RESULT: &str = "result";
}

/// Facade over the orchestration metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates the facade.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a request reaching a terminal status.
    pub fn record_request_terminal(&self, status: &str) {
        counter!(names::REQUESTS_TOTAL, labels::STATUS => status.to_string()).increment(1);
    }

    /// Records a request stage advance.
    pub fn record_stage_transition(&self, from_stage: &str, to_stage: &str) {
        counter!(
            names::REQUEST_STAGE_TRANSITIONS_TOTAL,
            labels::FROM_STAGE => from_stage.to_string(),
            labels::TO_STAGE => to_stage.to_string(),
        )
        .increment(1);
    }

    /// Records a chain closing.
    pub fn record_chain_closed(&self, status: &str) {
        counter!(names::CHAINS_TOTAL, labels::STATUS => status.to_string()).increment(1);
    }

    /// Records submitted chain steps.
    pub fn record_steps_submitted(&self, count: usize) {
        counter!(names::STEPS_SUBMITTED_TOTAL).increment(count as u64);
    }

    /// Records a validation classification.
    pub fn record_validation(&self, status: &str) {
        counter!(names::VALIDATIONS_TOTAL, labels::STATUS => status.to_string()).increment(1);
    }

    /// Records an event handler invocation and its latency.
    pub fn record_event_handled(&self, event_type: &str, ok: bool, duration: Duration) {
        let result = if ok { "ok" } else { "error" };
        counter!(
            names::EVENTS_HANDLED_TOTAL,
            labels::EVENT_TYPE => event_type.to_string(),
            labels::RESULT => result,
        )
        .increment(1);
        histogram!(
            names::HANDLER_DURATION_SECONDS,
            labels::EVENT_TYPE => event_type.to_string(),
        )
        .record(duration.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The facade is recorder-agnostic; with no recorder installed every
    // call is a no-op, which is all these exercise.
    #[test]
    fn facade_calls_do_not_panic_without_recorder() {
        let metrics = FlowMetrics::new();
        metrics.record_request_terminal("COMPLETED");
        metrics.record_stage_transition("LOOKUP", "PROCESSING");
        metrics.record_chain_closed("FAILED");
        metrics.record_steps_submitted(3);
        metrics.record_validation("SUCCESS");
        metrics.record_event_handled("tarn.flow.step_completion", true, Duration::from_millis(5));
    }
}
