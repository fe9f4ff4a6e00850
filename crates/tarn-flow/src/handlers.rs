//! Default handlers for coordinator-facing events.
//!
//! Each handler unpacks one payload shape and forwards to the runtime's
//! coordinator or stage machine. An envelope whose payload does not match
//! its event type is a serialization error, not a panic, because queue
//! contents are external input.

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::dispatch::{EventDispatcher, FlowRuntime};
use crate::error::{Error, Result};
use crate::events::{types, EventEnvelope, FlowEventData};

fn payload_mismatch(envelope: &EventEnvelope) -> Error {
    Error::Serialization {
        message: format!(
            "payload does not match event type '{}' (event {})",
            envelope.event_type, envelope.id
        ),
    }
}

/// Starts a persisted chain.
pub fn chain_initiate<'a>(
    runtime: &'a FlowRuntime,
    envelope: &'a EventEnvelope,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let FlowEventData::ChainInitiate { chain_id } = &envelope.data else {
            return Err(payload_mismatch(envelope));
        };
        runtime.coordinator.initiate(chain_id).await?;
        Ok(())
    }
    .boxed()
}

/// Applies a step's terminal status to its owning chain.
pub fn step_completion<'a>(
    runtime: &'a FlowRuntime,
    envelope: &'a EventEnvelope,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let FlowEventData::StepCompletion { request_id, status } = &envelope.data else {
            return Err(payload_mismatch(envelope));
        };
        runtime
            .coordinator
            .handle_step_completion(request_id, *status)
            .await
    }
    .boxed()
}

/// Records one lookup instruction's results.
pub fn lookup_completion<'a>(
    runtime: &'a FlowRuntime,
    envelope: &'a EventEnvelope,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let FlowEventData::LookupCompletion {
            request_id,
            instruction_index,
            content_ids,
        } = &envelope.data
        else {
            return Err(payload_mismatch(envelope));
        };
        runtime
            .machine
            .on_lookup_completion(request_id, *instruction_index, content_ids)
            .await
    }
    .boxed()
}

/// Advances a request past its processing pass.
pub fn processing_completion<'a>(
    runtime: &'a FlowRuntime,
    envelope: &'a EventEnvelope,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let FlowEventData::ProcessingCompletion {
            request_id,
            content_ids,
        } = &envelope.data
        else {
            return Err(payload_mismatch(envelope));
        };
        runtime
            .machine
            .on_processing_completion(request_id, content_ids)
            .await
    }
    .boxed()
}

/// Closes a request with its responder's single result.
pub fn responding_completion<'a>(
    runtime: &'a FlowRuntime,
    envelope: &'a EventEnvelope,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let FlowEventData::RespondingCompletion {
            request_id,
            content_ids,
        } = &envelope.data
        else {
            return Err(payload_mismatch(envelope));
        };
        runtime
            .machine
            .on_responding_completion(request_id, content_ids)
            .await
    }
    .boxed()
}

/// Fails a request on a construct's explicit failure report.
pub fn request_failure<'a>(
    runtime: &'a FlowRuntime,
    envelope: &'a EventEnvelope,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let FlowEventData::RequestFailure { request_id, reason } = &envelope.data else {
            return Err(payload_mismatch(envelope));
        };
        runtime.machine.on_request_failure(request_id, reason).await
    }
    .boxed()
}

/// Registers the default handler for every consumed event type.
pub fn register_defaults(dispatcher: &mut EventDispatcher) {
    dispatcher.register(types::CHAIN_INITIATE, chain_initiate);
    dispatcher.register(types::STEP_COMPLETION, step_completion);
    dispatcher.register(types::LOOKUP_COMPLETION, lookup_completion);
    dispatcher.register(types::PROCESSING_COMPLETION, processing_completion);
    dispatcher.register(types::RESPONDING_COMPLETION, responding_completion);
    dispatcher.register(types::REQUEST_FAILURE, request_failure);
}
