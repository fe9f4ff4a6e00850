//! End-to-end chain execution tests.
//!
//! These drive whole chains through the public event surface: the
//! coordinator and stage machine publish execute events, a simulated set
//! of construct workers answers them with completion callbacks, and the
//! dispatcher routes everything back in. No component is called below its
//! event-facing API except for assertions against the store.

#![allow(clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;

use tarn_core::{ContentId, ContentStore, JobId, MemoryContentStore, Provenance};
use tarn_flow::chain::{
    BranchAction, Chain, ChainExecutionStatus, ChainStep, StepExecutionStatus, ValidationSpec,
    ValidationStatus,
};
use tarn_flow::config::FlowConfig;
use tarn_flow::coordinator::ExecutePass;
use tarn_flow::dispatch::{EventDispatcher, FlowRuntime};
use tarn_flow::error::Result;
use tarn_flow::events::{types, EventEnvelope, FlowEventData, InMemoryEventPublisher};
use tarn_flow::registry::{
    ConstructOperation, ConstructSchema, ConstructType, InMemoryConstructRegistry,
    RegisteredConstruct,
};
use tarn_flow::request::{RequestBody, RequestStatus};
use tarn_flow::store::memory::InMemoryFlowStore;
use tarn_flow::store::FlowStore;
use tarn_flow::validation::StaticModelValidator;

const TENANT: &str = "acme";

struct Harness {
    store: Arc<InMemoryFlowStore>,
    content: Arc<MemoryContentStore>,
    publisher: Arc<InMemoryEventPublisher>,
    dispatcher: EventDispatcher,
    runtime: Arc<FlowRuntime>,
    /// Process each drained batch in reverse to exercise order independence.
    reverse_delivery: bool,
}

fn registry() -> Arc<InMemoryConstructRegistry> {
    let registry = InMemoryConstructRegistry::new();
    registry
        .register(
            RegisteredConstruct::new(ConstructType::Archive, "BASIC").with_schema(
                ConstructOperation::Lookup,
                ConstructSchema::requiring(["archive", "query"]),
            ),
        )
        .expect("register archive");
    registry
        .register(RegisteredConstruct::new(ConstructType::Processor, "SUMMARIZE"))
        .expect("register processor");
    registry
        .register(RegisteredConstruct::new(ConstructType::Responder, "DIRECT"))
        .expect("register responder");
    Arc::new(registry)
}

fn harness_with_model(model_response: &str) -> Harness {
    let store = Arc::new(InMemoryFlowStore::new());
    let content = Arc::new(MemoryContentStore::new());
    let publisher = Arc::new(InMemoryEventPublisher::new());

    let runtime = Arc::new(FlowRuntime::new(
        store.clone(),
        content.clone(),
        registry(),
        publisher.clone(),
        Arc::new(StaticModelValidator::new(model_response)),
        FlowConfig::default(),
    ));
    let dispatcher = EventDispatcher::new(runtime.clone());

    Harness {
        store,
        content,
        publisher,
        dispatcher,
        runtime,
        reverse_delivery: false,
    }
}

fn harness() -> Harness {
    harness_with_model("SUCCESS")
}

fn step_body(query: &str) -> RequestBody {
    RequestBody {
        lookup_instructions: vec![json!({"archive": "BASIC", "query": query})],
        processing_instructions: json!({"processor": "SUMMARIZE"}),
        response_config: json!({"responder": "DIRECT"}),
    }
}

impl Harness {
    async fn submit_chain(&self, steps: Vec<ChainStep>) -> Result<Chain> {
        let chain = Chain::new(TENANT, steps);
        self.store.save_chain(&chain).await?;
        self.runtime.coordinator.initiate(&chain.chain_id).await?;
        Ok(chain)
    }

    /// Plays simulated construct workers plus the dispatcher until the
    /// queue drains. Queries containing "empty" find nothing.
    async fn pump(&self) -> Result<()> {
        loop {
            let mut batch = self.publisher.drain()?;
            if batch.is_empty() {
                return Ok(());
            }
            if self.reverse_delivery {
                batch.reverse();
            }
            for envelope in batch {
                self.handle(envelope).await?;
            }
        }
    }

    async fn handle(&self, envelope: EventEnvelope) -> Result<()> {
        match &envelope.data {
            FlowEventData::ExecuteLookup {
                request_id,
                instruction_index,
                instruction,
                ..
            } => {
                let query = instruction["query"].as_str().unwrap_or_default();
                let content_ids = if query.contains("empty") {
                    vec![]
                } else {
                    let id = self
                        .content
                        .put(
                            Bytes::from(format!("found:{query}")),
                            Provenance::new(JobId::generate(), "BASIC"),
                        )
                        .await?;
                    vec![id]
                };
                self.dispatch(FlowEventData::LookupCompletion {
                    request_id: *request_id,
                    instruction_index: *instruction_index,
                    content_ids,
                })
                .await
            }
            FlowEventData::ExecuteProcessing {
                request_id,
                content_ids,
                ..
            } => {
                self.dispatch(FlowEventData::ProcessingCompletion {
                    request_id: *request_id,
                    content_ids: content_ids.clone(),
                })
                .await
            }
            FlowEventData::ExecuteResponding {
                request_id,
                content_ids,
                ..
            } => {
                let mut parts = Vec::new();
                for id in content_ids {
                    let bytes = self.content.get(id).await?;
                    parts.push(String::from_utf8_lossy(&bytes).into_owned());
                }
                let result = self
                    .content
                    .put(
                        Bytes::from(format!("answer:{}", parts.join("+"))),
                        Provenance::new(JobId::generate(), "DIRECT"),
                    )
                    .await?;
                self.dispatch(FlowEventData::RespondingCompletion {
                    request_id: *request_id,
                    content_ids: vec![result],
                })
                .await
            }
            // Terminal notification, no consumer in this harness.
            FlowEventData::ChainClosed { .. } => Ok(()),
            _ => self.dispatcher.dispatch(&envelope).await,
        }
    }

    async fn dispatch(&self, data: FlowEventData) -> Result<()> {
        self.dispatcher
            .dispatch(&EventEnvelope::new(TENANT, data))
            .await
    }

    async fn chain_state(&self, chain: &Chain) -> Chain {
        self.store
            .get_chain(&chain.chain_id)
            .await
            .expect("store")
            .expect("chain row")
    }

    async fn result_text(&self, content_id: ContentId) -> String {
        let bytes = self.content.get(&content_id).await.expect("content");
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[tokio::test]
async fn single_step_chain_executes_and_closes() -> Result<()> {
    let h = harness();
    let chain = h
        .submit_chain(vec![ChainStep::new("gather", step_body("revenue"))])
        .await?;
    h.pump().await?;

    let closed = h.chain_state(&chain).await;
    assert_eq!(
        closed.chain_execution_status,
        ChainExecutionStatus::Completed
    );
    assert!(closed.executed_requests.contains_key("gather"));
    assert!(closed.unexecuted_request_names.is_empty());
    assert_eq!(closed.num_remaining_running_requests, 0);

    let request_id = closed.executed_requests["gather"];
    let request = h.store.get_request(&request_id).await?.expect("request row");
    assert_eq!(request.request_status, RequestStatus::Completed);
    assert_eq!(
        h.result_text(request.result_content_id.expect("result")).await,
        "answer:found:revenue"
    );
    Ok(())
}

#[tokio::test]
async fn two_step_chain_dereferences_dependency_content() -> Result<()> {
    let h = harness();
    let chain = h
        .submit_chain(vec![
            ChainStep::new("gather", step_body("revenue")),
            ChainStep::new("refine", step_body("REF:gather.content")),
        ])
        .await?;
    h.pump().await?;

    let closed = h.chain_state(&chain).await;
    assert_eq!(
        closed.chain_execution_status,
        ChainExecutionStatus::Completed
    );
    assert_eq!(closed.executed_requests.len(), 2);

    // The dependent step's body was rewritten with the producer's content
    // before submission.
    let refine = h
        .store
        .get_request(&closed.executed_requests["refine"])
        .await?
        .expect("refine row");
    assert_eq!(
        refine.body.lookup_instructions[0]["query"],
        json!("answer:found:revenue")
    );
    Ok(())
}

#[tokio::test]
async fn empty_lookup_fails_step_and_chain() -> Result<()> {
    let h = harness();
    let chain = h
        .submit_chain(vec![
            ChainStep::new("gather", step_body("empty shelf")),
            ChainStep::new("refine", step_body("REF:gather.content")),
        ])
        .await?;
    h.pump().await?;

    let closed = h.chain_state(&chain).await;
    assert_eq!(closed.chain_execution_status, ChainExecutionStatus::Failed);
    let message = closed.status_message.as_deref().expect("message");
    assert!(message.contains("step execution failed"));
    assert!(message.contains("no entries"));
    // The dependent step never ran.
    assert!(closed.unexecuted_request_names.contains("refine"));

    let steps = h.store.list_steps(&chain.chain_id).await?;
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].execution_status, StepExecutionStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn repeated_execute_next_submits_each_step_once() -> Result<()> {
    let h = harness();
    let chain = h
        .submit_chain(vec![ChainStep::new("gather", step_body("revenue"))])
        .await?;

    // Redelivered coordination passes before any callback arrives.
    let second = h.runtime.coordinator.execute_next(&chain.chain_id).await?;
    let third = h.runtime.coordinator.execute_next(&chain.chain_id).await?;
    assert_eq!(second, ExecutePass::Submitted(0));
    assert_eq!(third, ExecutePass::Submitted(0));

    let lookups = h
        .publisher
        .published()?
        .iter()
        .filter(|e| matches!(e.data, FlowEventData::ExecuteLookup { .. }))
        .count();
    assert_eq!(lookups, 1);
    assert_eq!(h.store.list_steps(&chain.chain_id).await?.len(), 1);

    h.pump().await?;
    let closed = h.chain_state(&chain).await;
    assert_eq!(
        closed.chain_execution_status,
        ChainExecutionStatus::Completed
    );
    Ok(())
}

#[tokio::test]
async fn diamond_fan_in_joins_once_regardless_of_delivery_order() -> Result<()> {
    for reverse in [false, true] {
        let mut h = harness();
        h.reverse_delivery = reverse;

        let join_body = RequestBody {
            lookup_instructions: vec![
                json!({"archive": "BASIC", "query": "REF:left.content"}),
                json!({"archive": "BASIC", "query": "REF:right.content"}),
            ],
            processing_instructions: json!({"processor": "SUMMARIZE"}),
            response_config: json!({"responder": "DIRECT"}),
        };
        let chain = h
            .submit_chain(vec![
                ChainStep::new("root", step_body("base")),
                ChainStep::new("left", step_body("REF:root.content")),
                ChainStep::new("right", step_body("REF:root.content")),
                ChainStep::new("join", join_body),
            ])
            .await?;
        h.pump().await?;

        let closed = h.chain_state(&chain).await;
        assert_eq!(
            closed.chain_execution_status,
            ChainExecutionStatus::Completed,
            "reverse={reverse}"
        );
        assert_eq!(closed.executed_requests.len(), 4);
        assert_eq!(h.store.list_steps(&chain.chain_id).await?.len(), 4);
    }
    Ok(())
}

#[tokio::test]
async fn validation_success_termination_completes_chain_with_result() -> Result<()> {
    let h = harness_with_model("SUCCESS");
    let gather = ChainStep::new("gather", step_body("revenue")).with_validation(ValidationSpec {
        prompt: "must mention revenue".into(),
        model_id: None,
        on_success: Some(BranchAction::TerminateChain),
        on_failure: None,
    });
    let followup = ChainStep::new("followup", step_body("REF:gather.content"));
    let chain = h.submit_chain(vec![gather, followup]).await?;
    h.pump().await?;

    let closed = h.chain_state(&chain).await;
    assert_eq!(
        closed.chain_execution_status,
        ChainExecutionStatus::Completed
    );
    // Single producing step: its result is carried as the chain's.
    assert_eq!(
        h.result_text(closed.result_content_id.expect("chain result"))
            .await,
        "answer:found:revenue"
    );
    assert!(closed.unexecuted_request_names.contains("followup"));

    let steps = h.store.list_steps(&chain.chain_id).await?;
    assert_eq!(steps[0].validation_status, Some(ValidationStatus::Success));
    Ok(())
}

#[tokio::test]
async fn validation_failure_termination_fails_chain() -> Result<()> {
    let h = harness_with_model("FAILURE");
    let gather = ChainStep::new("gather", step_body("revenue")).with_validation(ValidationSpec {
        prompt: "must mention revenue".into(),
        model_id: None,
        on_success: None,
        on_failure: Some(BranchAction::TerminateChain),
    });
    let chain = h.submit_chain(vec![gather]).await?;
    h.pump().await?;

    let closed = h.chain_state(&chain).await;
    assert_eq!(closed.chain_execution_status, ChainExecutionStatus::Failed);
    assert!(closed
        .status_message
        .as_deref()
        .expect("message")
        .contains("directed termination"));
    Ok(())
}

#[tokio::test]
async fn validation_failure_branch_unlocks_conditional_step() -> Result<()> {
    let h = harness_with_model("FAILURE");
    let gather = ChainStep::new("gather", step_body("revenue")).with_validation(ValidationSpec {
        prompt: "must mention profit".into(),
        model_id: None,
        on_success: None,
        on_failure: Some(BranchAction::ExecuteStep("escalate".into())),
    });
    let escalate = ChainStep::new("escalate", step_body("profit deep dive")).conditional();
    let chain = h.submit_chain(vec![gather, escalate]).await?;
    h.pump().await?;

    let closed = h.chain_state(&chain).await;
    assert_eq!(
        closed.chain_execution_status,
        ChainExecutionStatus::Completed
    );
    assert!(closed.conditions_met.contains("escalate"));
    assert_eq!(closed.executed_requests.len(), 2);
    assert!(closed.unexecuted_request_names.is_empty());
    Ok(())
}

#[tokio::test]
async fn conditional_step_without_met_condition_never_runs() -> Result<()> {
    let h = harness_with_model("SUCCESS");
    let gather = ChainStep::new("gather", step_body("revenue")).with_validation(ValidationSpec {
        prompt: "must mention revenue".into(),
        model_id: None,
        on_success: None,
        on_failure: Some(BranchAction::ExecuteStep("escalate".into())),
    });
    let escalate = ChainStep::new("escalate", step_body("deep dive")).conditional();
    let chain = h.submit_chain(vec![gather, escalate]).await?;
    h.pump().await?;

    let closed = h.chain_state(&chain).await;
    assert_eq!(
        closed.chain_execution_status,
        ChainExecutionStatus::Completed
    );
    assert!(closed.conditions_met.is_empty());
    assert!(closed.unexecuted_request_names.contains("escalate"));
    Ok(())
}

#[tokio::test]
async fn unclassifiable_model_output_fails_chain() -> Result<()> {
    let h = harness_with_model("it looks plausible to me");
    let gather = ChainStep::new("gather", step_body("revenue")).with_validation(ValidationSpec {
        prompt: "must mention revenue".into(),
        model_id: None,
        on_success: Some(BranchAction::TerminateChain),
        on_failure: None,
    });
    let chain = h.submit_chain(vec![gather]).await?;
    h.pump().await?;

    let closed = h.chain_state(&chain).await;
    assert_eq!(closed.chain_execution_status, ChainExecutionStatus::Failed);
    assert!(closed
        .status_message
        .as_deref()
        .expect("message")
        .contains("SUCCESS or FAILURE"));
    Ok(())
}

#[tokio::test]
async fn structural_failure_rejects_before_any_submission() -> Result<()> {
    let h = harness();
    let chain = Chain::new(
        TENANT,
        vec![
            ChainStep::new("a", step_body("REF:b.content")),
            ChainStep::new("b", step_body("REF:a.content")),
        ],
    );
    h.store.save_chain(&chain).await?;

    let result = h.runtime.coordinator.initiate(&chain.chain_id).await;
    assert!(result.is_err());

    let closed = h.chain_state(&chain).await;
    assert_eq!(closed.chain_execution_status, ChainExecutionStatus::Failed);
    assert!(h.store.list_steps(&chain.chain_id).await?.is_empty());
    // Only the closure notification went out; no step was submitted.
    let published = h.publisher.published()?;
    assert!(published
        .iter()
        .all(|e| e.event_type == types::CHAIN_CLOSED));
    Ok(())
}

#[tokio::test]
async fn redelivered_step_completion_is_ignored() -> Result<()> {
    let h = harness();
    let chain = h
        .submit_chain(vec![ChainStep::new("gather", step_body("revenue"))])
        .await?;
    h.pump().await?;

    let closed = h.chain_state(&chain).await;
    let request_id = closed.executed_requests["gather"];

    // The queue redelivers the terminal callback after closure.
    h.dispatch(FlowEventData::StepCompletion {
        request_id,
        status: RequestStatus::Completed,
    })
    .await?;

    let after = h.chain_state(&chain).await;
    assert_eq!(
        after.chain_execution_status,
        ChainExecutionStatus::Completed
    );
    assert_eq!(after.num_remaining_running_requests, 0);
    Ok(())
}

#[tokio::test]
async fn chain_closed_event_is_published_once() -> Result<()> {
    let h = harness();
    let chain = h
        .submit_chain(vec![ChainStep::new("gather", step_body("revenue"))])
        .await?;

    // Collect everything, including the closure notification the pump
    // normally swallows.
    let mut closed_events = 0;
    loop {
        let batch = h.publisher.drain()?;
        if batch.is_empty() {
            break;
        }
        for envelope in batch {
            if envelope.event_type == types::CHAIN_CLOSED {
                closed_events += 1;
                assert!(matches!(
                    envelope.data,
                    FlowEventData::ChainClosed {
                        status: ChainExecutionStatus::Completed,
                        ..
                    }
                ));
            } else {
                h.handle(envelope).await?;
            }
        }
    }
    assert_eq!(closed_events, 1);
    let _ = chain;
    Ok(())
}

#[tokio::test]
async fn held_coordination_mutex_defers_closure_instead_of_closing_early() -> Result<()> {
    let h = harness();
    let chain = h
        .submit_chain(vec![
            ChainStep::new("gather", step_body("revenue")),
            ChainStep::new("refine", step_body("REF:gather.content")),
        ])
        .await?;

    // Work the queue until gather's terminal callback appears, then hold
    // the chain's coordination mutex while that callback is delivered.
    let mut completion = None;
    'drain: loop {
        let batch = h.publisher.drain()?;
        assert!(!batch.is_empty(), "expected a step completion");
        for envelope in batch {
            if matches!(envelope.data, FlowEventData::StepCompletion { .. }) {
                completion = Some(envelope);
                break 'drain;
            }
            h.handle(envelope).await?;
        }
    }
    let key = format!("chain:{}", chain.chain_id);
    assert!(
        h.store
            .try_acquire_mutex(&key, "another-worker", Duration::from_secs(30))
            .await?
    );
    h.dispatcher
        .dispatch(&completion.expect("step completion"))
        .await?;

    // The coordination pass was skipped, so the chain must stay open with
    // the dependent step still runnable.
    let open = h.chain_state(&chain).await;
    assert_eq!(open.chain_execution_status, ChainExecutionStatus::Executing);
    assert!(!open.executed_requests.is_empty());

    h.store.release_mutex(&key, "another-worker").await?;
    let pass = h.runtime.coordinator.execute_next(&chain.chain_id).await?;
    assert_eq!(pass, ExecutePass::Submitted(1));
    h.pump().await?;

    let closed = h.chain_state(&chain).await;
    assert_eq!(
        closed.chain_execution_status,
        ChainExecutionStatus::Completed
    );
    assert_eq!(closed.executed_requests.len(), 2);
    Ok(())
}
