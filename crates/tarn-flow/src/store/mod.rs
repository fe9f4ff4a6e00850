//! Durable state shared by all workers.
//!
//! [`FlowStore`] is the persistence seam: jobs, requests, chains, and
//! coordinated steps live in a shared store every stateless worker can
//! reach. Mutations come in two shapes, and implementations must honor
//! the distinction:
//!
//! - **Full-row writes** (`save_*`): idempotent overwrites guarded by a
//!   prior read.
//! - **Atomic updates** (`append_lookup_results`, `record_step_result`,
//!   `add_remaining_running`, `add_condition_met`, `set_chain_result`,
//!   `insert_step_if_new_name`,
//!   `try_acquire_mutex`): commutative or conditional operations that are
//!   safe under concurrent application by multiple workers. These carry
//!   the coordinator's correctness under at-least-once delivery; a
//!   backend that implements them read-modify-write without atomicity is
//!   incorrect.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use tarn_core::{ChainId, ContentId, RequestId};

use crate::chain::{Chain, CoordinatedStep};
use crate::error::Result;
use crate::job::{Job, JobRef};
use crate::request::Request;

/// Persistence for orchestration state.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Loads a job by `(job_type, job_id)`.
    async fn get_job(&self, job_ref: &JobRef) -> Result<Option<Job>>;

    /// Writes a job row.
    async fn save_job(&self, job: &Job) -> Result<()>;

    /// Loads a request.
    async fn get_request(&self, request_id: &RequestId) -> Result<Option<Request>>;

    /// Writes a request row.
    async fn save_request(&self, request: &Request) -> Result<()>;

    /// Loads a chain.
    async fn get_chain(&self, chain_id: &ChainId) -> Result<Option<Chain>>;

    /// Writes a chain row.
    async fn save_chain(&self, chain: &Chain) -> Result<()>;

    /// Writes a coordinated-step row, keyed `(chain_id, request_id)`.
    async fn save_step(&self, step: &CoordinatedStep) -> Result<()>;

    /// Inserts a coordinated-step row only if no row for its
    /// `(chain_id, step_name)` exists yet. Returns whether the insert won.
    ///
    /// This conditional insert is the idempotency boundary that keeps
    /// concurrent coordinator passes from submitting a step twice.
    async fn insert_step_if_new_name(&self, step: &CoordinatedStep) -> Result<bool>;

    /// Loads the coordinated step that owns a request (secondary index).
    async fn get_step_by_request_id(&self, request_id: &RequestId)
        -> Result<Option<CoordinatedStep>>;

    /// Lists all coordinated steps of a chain.
    async fn list_steps(&self, chain_id: &ChainId) -> Result<Vec<CoordinatedStep>>;

    /// Atomically records one lookup instruction's completion: unions the
    /// content entries into the request's lookup results and, when
    /// `instruction_index` has not been recorded before, decrements
    /// `remaining_lookups` by one. Returns the remaining count.
    ///
    /// The instruction index keys idempotency here the way the step name
    /// does for `insert_step_if_new_name`: a redelivered callback for an
    /// already-recorded index must leave the count untouched.
    ///
    /// Returns [`crate::error::Error::RequestNotFound`] if no row exists.
    async fn append_lookup_results(
        &self,
        request_id: &RequestId,
        instruction_index: usize,
        content_ids: &[ContentId],
    ) -> Result<u32>;

    /// Atomically records `executed_requests[step_name] = request_id` on a
    /// chain and decrements `num_remaining_running_requests` by one,
    /// returning the remaining count.
    ///
    /// Backends whose map-attribute update fails when the map does not
    /// exist yet must fall back to creating the map with the single entry;
    /// the fallback is internal and never surfaces to callers.
    async fn record_step_result(
        &self,
        chain_id: &ChainId,
        step_name: &str,
        request_id: &RequestId,
    ) -> Result<i64>;

    /// Atomically adds `delta` to a chain's
    /// `num_remaining_running_requests`, returning the new value.
    async fn add_remaining_running(&self, chain_id: &ChainId, delta: i64) -> Result<i64>;

    /// Atomically inserts a step name into a chain's `conditions_met` set.
    ///
    /// A full-row write here would race `record_step_result` from sibling
    /// workers and lose their updates.
    async fn add_condition_met(&self, chain_id: &ChainId, step_name: &str) -> Result<()>;

    /// Atomically sets a chain's result content entry.
    async fn set_chain_result(&self, chain_id: &ChainId, content_id: ContentId) -> Result<()>;

    /// Attempts to acquire a named mutex via conditional insert.
    ///
    /// Succeeds when no live row exists or the existing row's TTL has
    /// expired; a crashed holder is fenced out only by that expiry.
    /// Returns whether the caller now holds the mutex.
    async fn try_acquire_mutex(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Releases a mutex if the caller still holds it. Releasing a mutex
    /// held by someone else (after expiry takeover) is a no-op.
    async fn release_mutex(&self, key: &str, holder: &str) -> Result<()>;
}
