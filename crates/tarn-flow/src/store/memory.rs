//! In-memory [`FlowStore`] implementation.
//!
//! Backs tests and single-process deployments. Each atomic trait
//! operation holds the relevant table's write lock for the whole
//! read-modify-write, which gives the same effective atomicity a
//! conditional-write backend provides.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use tarn_core::{ChainId, ContentId, RequestId};

use crate::chain::{Chain, CoordinatedStep};
use crate::error::{Error, Result};
use crate::job::{Job, JobRef};
use crate::request::Request;
use crate::store::FlowStore;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

#[derive(Debug, Clone)]
struct MutexRow {
    holder: String,
    expires_at: Instant,
}

/// In-memory flow store.
#[derive(Debug, Default)]
pub struct InMemoryFlowStore {
    jobs: RwLock<HashMap<(String, tarn_core::JobId), Job>>,
    requests: RwLock<HashMap<RequestId, Request>>,
    chains: RwLock<HashMap<ChainId, Chain>>,
    steps: RwLock<HashMap<(ChainId, RequestId), CoordinatedStep>>,
    mutexes: RwLock<HashMap<String, MutexRow>>,
}

impl InMemoryFlowStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn get_job(&self, job_ref: &JobRef) -> Result<Option<Job>> {
        let jobs = self.jobs.read().map_err(poison_err)?;
        Ok(jobs
            .get(&(job_ref.job_type.clone(), job_ref.job_id))
            .cloned())
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().map_err(poison_err)?;
        jobs.insert((job.job_type.clone(), job.job_id), job.clone());
        Ok(())
    }

    async fn get_request(&self, request_id: &RequestId) -> Result<Option<Request>> {
        let requests = self.requests.read().map_err(poison_err)?;
        Ok(requests.get(request_id).cloned())
    }

    async fn save_request(&self, request: &Request) -> Result<()> {
        let mut requests = self.requests.write().map_err(poison_err)?;
        requests.insert(request.request_id, request.clone());
        Ok(())
    }

    async fn get_chain(&self, chain_id: &ChainId) -> Result<Option<Chain>> {
        let chains = self.chains.read().map_err(poison_err)?;
        Ok(chains.get(chain_id).cloned())
    }

    async fn save_chain(&self, chain: &Chain) -> Result<()> {
        let mut chains = self.chains.write().map_err(poison_err)?;
        chains.insert(chain.chain_id, chain.clone());
        Ok(())
    }

    async fn save_step(&self, step: &CoordinatedStep) -> Result<()> {
        let mut steps = self.steps.write().map_err(poison_err)?;
        steps.insert((step.chain_id, step.request_id), step.clone());
        Ok(())
    }

    async fn insert_step_if_new_name(&self, step: &CoordinatedStep) -> Result<bool> {
        let mut steps = self.steps.write().map_err(poison_err)?;
        let name_taken = steps
            .values()
            .any(|s| s.chain_id == step.chain_id && s.step_name == step.step_name);
        if name_taken {
            return Ok(false);
        }
        steps.insert((step.chain_id, step.request_id), step.clone());
        Ok(true)
    }

    async fn get_step_by_request_id(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<CoordinatedStep>> {
        let steps = self.steps.read().map_err(poison_err)?;
        Ok(steps
            .values()
            .find(|s| s.request_id == *request_id)
            .cloned())
    }

    async fn list_steps(&self, chain_id: &ChainId) -> Result<Vec<CoordinatedStep>> {
        let steps = self.steps.read().map_err(poison_err)?;
        Ok(steps
            .values()
            .filter(|s| s.chain_id == *chain_id)
            .cloned()
            .collect())
    }

    async fn append_lookup_results(
        &self,
        request_id: &RequestId,
        instruction_index: usize,
        content_ids: &[ContentId],
    ) -> Result<u32> {
        let mut requests = self.requests.write().map_err(poison_err)?;
        let request = requests
            .get_mut(request_id)
            .ok_or(Error::RequestNotFound {
                request_id: *request_id,
            })?;

        if request.completed_lookups.insert(instruction_index) {
            for content_id in content_ids {
                if !request.lookup_results.contains(content_id) {
                    request.lookup_results.push(*content_id);
                }
            }
            request.remaining_lookups = request.remaining_lookups.saturating_sub(1);
        }
        Ok(request.remaining_lookups)
    }

    async fn record_step_result(
        &self,
        chain_id: &ChainId,
        step_name: &str,
        request_id: &RequestId,
    ) -> Result<i64> {
        let mut chains = self.chains.write().map_err(poison_err)?;
        let chain = chains
            .get_mut(chain_id)
            .ok_or(Error::ChainNotFound { chain_id: *chain_id })?;

        chain
            .executed_requests
            .insert(step_name.to_string(), *request_id);
        chain.num_remaining_running_requests -= 1;
        Ok(chain.num_remaining_running_requests)
    }

    async fn add_remaining_running(&self, chain_id: &ChainId, delta: i64) -> Result<i64> {
        let mut chains = self.chains.write().map_err(poison_err)?;
        let chain = chains
            .get_mut(chain_id)
            .ok_or(Error::ChainNotFound { chain_id: *chain_id })?;
        chain.num_remaining_running_requests += delta;
        Ok(chain.num_remaining_running_requests)
    }

    async fn add_condition_met(&self, chain_id: &ChainId, step_name: &str) -> Result<()> {
        let mut chains = self.chains.write().map_err(poison_err)?;
        let chain = chains
            .get_mut(chain_id)
            .ok_or(Error::ChainNotFound { chain_id: *chain_id })?;
        chain.conditions_met.insert(step_name.to_string());
        Ok(())
    }

    async fn set_chain_result(&self, chain_id: &ChainId, content_id: ContentId) -> Result<()> {
        let mut chains = self.chains.write().map_err(poison_err)?;
        let chain = chains
            .get_mut(chain_id)
            .ok_or(Error::ChainNotFound { chain_id: *chain_id })?;
        chain.result_content_id = Some(content_id);
        Ok(())
    }

    async fn try_acquire_mutex(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut mutexes = self.mutexes.write().map_err(poison_err)?;
        let now = Instant::now();

        if let Some(row) = mutexes.get(key) {
            if row.expires_at > now && row.holder != holder {
                return Ok(false);
            }
        }

        mutexes.insert(
            key.to_string(),
            MutexRow {
                holder: holder.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release_mutex(&self, key: &str, holder: &str) -> Result<()> {
        let mut mutexes = self.mutexes.write().map_err(poison_err)?;
        if let Some(row) = mutexes.get(key) {
            if row.holder == holder {
                mutexes.remove(key);
            }
        }
        Ok(())
    }
}
