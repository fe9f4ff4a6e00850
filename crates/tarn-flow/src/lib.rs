//! # tarn-flow
//!
//! Request and chain orchestration engine for the Tarn data lake.
//!
//! This crate implements the orchestration domain, providing:
//!
//! - **Job Tracking**: Hierarchical units of work with guarded
//!   begin/commit/fail execution scopes and failure propagation
//! - **Stage Machine**: One request driven through
//!   `LOOKUP -> PROCESSING -> RESPONDING` against pluggable constructs
//! - **Chain Validation**: Duplicate, undefined-reference, and
//!   path-relative cycle detection before anything executes
//! - **Chain Coordination**: Declarative multi-step chains with dependency
//!   references, conditional steps, and model-validated branching
//!
//! ## Core Concepts
//!
//! - **Request**: one unit of lake work - a lookup fan-out, a processing
//!   pass, and a responding pass reducing to a single result entry
//! - **Chain**: a declarative set of named steps whose bodies reference
//!   earlier steps' results (`REF:<step>.<selector>`)
//! - **Construct**: a registered archive, processor, or responder that
//!   serves execute events at its own event target
//!
//! ## Guarantees
//!
//! - **At-least-once safe**: every callback may be redelivered; terminal
//!   rows absorb duplicates and the coordinated-step conditional insert
//!   keeps each step submitted at most once
//! - **Order-independent**: sibling completions commute; chain closure is
//!   decided from stored state, never from arrival order
//! - **Fail-fast structure**: structural chain errors reject before any
//!   submission, atomically
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use tarn_core::MemoryContentStore;
//! use tarn_flow::chain::{Chain, ChainStep};
//! use tarn_flow::config::FlowConfig;
//! use tarn_flow::coordinator::ChainCoordinator;
//! use tarn_flow::error::Result;
//! use tarn_flow::events::InMemoryEventPublisher;
//! use tarn_flow::registry::InMemoryConstructRegistry;
//! use tarn_flow::request::RequestBody;
//! use tarn_flow::store::memory::InMemoryFlowStore;
//! use tarn_flow::store::FlowStore;
//! use tarn_flow::validation::StaticModelValidator;
//!
//! # async fn example() -> Result<()> {
//! let store = Arc::new(InMemoryFlowStore::new());
//! let coordinator = ChainCoordinator::new(
//!     store.clone(),
//!     Arc::new(MemoryContentStore::new()),
//!     Arc::new(InMemoryConstructRegistry::new()),
//!     Arc::new(InMemoryEventPublisher::new()),
//!     Arc::new(StaticModelValidator::new("SUCCESS")),
//!     FlowConfig::default(),
//! );
//!
//! let chain = Chain::new(
//!     "tenant",
//!     vec![ChainStep::new(
//!         "gather",
//!         RequestBody {
//!             lookup_instructions: vec![json!({"archive": "BASIC", "query": "revenue"})],
//!             processing_instructions: json!({"processor": "SUMMARIZE"}),
//!             response_config: json!({"responder": "DIRECT"}),
//!         },
//!     )],
//! );
//! store.save_chain(&chain).await?;
//! coordinator.initiate(&chain.chain_id).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod chain;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod graph;
pub mod handlers;
pub mod job;
pub mod machine;
pub mod metrics;
pub mod reference;
pub mod registry;
pub mod request;
pub mod store;
pub mod validation;

pub use chain::{Chain, ChainExecutionStatus, ChainStep, CoordinatedStep};
pub use config::FlowConfig;
pub use coordinator::{ChainCoordinator, ExecutePass};
pub use dispatch::{EventDispatcher, FlowRuntime};
pub use error::{Error, Result};
pub use events::{EventEnvelope, EventPublisher, FlowEventData};
pub use job::{Job, JobRef, JobStatus, JobTracker};
pub use machine::RequestStageMachine;
pub use request::{Request, RequestStage, RequestStatus};
pub use store::FlowStore;
