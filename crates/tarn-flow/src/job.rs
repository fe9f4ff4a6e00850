//! Hierarchical job tracking.
//!
//! A [`Job`] is the generic unit-of-work record every other component
//! anchors to: chains, requests, and validation passes each run under one.
//! Jobs form a tree via parent references, and status only ever moves
//! forward (`PENDING → IN_PROGRESS → {COMPLETED, FAILED}`); terminal states
//! are final.
//!
//! [`JobTracker::scoped_execution`] provides the guarded begin/commit/fail
//! pattern workers wrap their handler bodies in, including best-effort
//! failure propagation to ancestors.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tarn_core::JobId;

use crate::error::{Error, Result};
use crate::store::FlowStore;

/// Job state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Created, work not yet started.
    Pending,
    /// Actively executing.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl JobStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if the transition from self to target is valid.
    ///
    /// Status only moves forward; terminal states accept nothing.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::InProgress | Self::Completed | Self::Failed),
            Self::InProgress => matches!(target, Self::Completed | Self::Failed),
            Self::Completed | Self::Failed => false,
        }
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// A `(job_type, job_id)` pair identifying one job.
///
/// Job IDs are only unique within a type, so every cross-reference carries
/// both halves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRef {
    /// The job type.
    pub job_type: String,
    /// The job identifier.
    pub job_id: JobId,
}

impl JobRef {
    /// Creates a new job reference.
    #[must_use]
    pub fn new(job_type: impl Into<String>, job_id: JobId) -> Self {
        Self {
            job_type: job_type.into(),
            job_id,
        }
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job_type, self.job_id)
    }
}

/// A unit-of-work record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// The job type (e.g. `CHAIN_REQUEST`, `LAKE_REQUEST`).
    pub job_type: String,
    /// Unique identifier within the type.
    pub job_id: JobId,
    /// Tenant scope.
    pub tenant_id: String,
    /// Parent job, if this job was created as a child.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<JobRef>,
    /// Current status.
    pub status: JobStatus,
    /// When the job record was created.
    pub created_on: DateTime<Utc>,
    /// When execution started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    /// When execution ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
    /// Human-readable status detail, set on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

impl Job {
    /// Creates a new root job in PENDING state.
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            job_id: JobId::generate(),
            tenant_id: tenant_id.into(),
            parent: None,
            status: JobStatus::Pending,
            created_on: Utc::now(),
            started: None,
            ended: None,
            status_message: None,
        }
    }

    /// Creates a child job whose parent reference points at this job.
    #[must_use]
    pub fn create_child(&self, job_type: impl Into<String>) -> Self {
        let mut child = Self::new(self.tenant_id.clone(), job_type);
        child.parent = Some(self.job_ref());
        child
    }

    /// Returns the `(job_type, job_id)` reference for this job.
    #[must_use]
    pub fn job_ref(&self) -> JobRef {
        JobRef::new(self.job_type.clone(), self.job_id)
    }

    /// Returns true if the job is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transitions to a new status, stamping `started`/`ended`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    #[tracing::instrument(skip(self), fields(job = %self.job_ref(), from = %self.status, to = %target))]
    pub fn transition_to(&mut self, target: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: "job status only moves forward".into(),
            });
        }

        let now = Utc::now();
        match target {
            JobStatus::InProgress => self.started = Some(now),
            JobStatus::Completed | JobStatus::Failed => self.ended = Some(now),
            JobStatus::Pending => {}
        }

        self.status = target;
        Ok(())
    }
}

/// How a job failure propagates up the ancestor tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePropagation {
    /// Fail only this job.
    #[default]
    None,
    /// Also mark the direct parent FAILED, best-effort.
    Parent,
    /// Walk the ancestor chain marking each FAILED until a job has no
    /// parent or a parent row cannot be found.
    AllAncestors,
}

/// Options for [`JobTracker::scoped_execution`].
#[derive(Debug, Clone, Default)]
pub struct ScopeOptions {
    /// Do not mark the job IN_PROGRESS on begin.
    pub skip_initialization: bool,
    /// Do not mark the job COMPLETED on commit.
    pub skip_completion: bool,
    /// Failure propagation mode.
    pub propagation: FailurePropagation,
    /// Overrides the error text as the failure status message.
    pub failure_message: Option<String>,
}

impl ScopeOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Skips initialization on begin.
    #[must_use]
    pub const fn skip_initialization(mut self) -> Self {
        self.skip_initialization = true;
        self
    }

    /// Skips completion on commit.
    #[must_use]
    pub const fn skip_completion(mut self) -> Self {
        self.skip_completion = true;
        self
    }

    /// Sets the failure propagation mode.
    #[must_use]
    pub const fn propagation(mut self, mode: FailurePropagation) -> Self {
        self.propagation = mode;
        self
    }

    /// Sets an explicit failure status message.
    #[must_use]
    pub fn failure_message(mut self, message: impl Into<String>) -> Self {
        self.failure_message = Some(message.into());
        self
    }
}

/// Creates, loads, and guards jobs against a durable store.
#[derive(Clone)]
pub struct JobTracker {
    store: Arc<dyn FlowStore>,
}

impl JobTracker {
    /// Creates a tracker over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn FlowStore>) -> Self {
        Self { store }
    }

    /// Creates and persists a new root job.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn create(
        &self,
        tenant_id: impl Into<String> + Send,
        job_type: impl Into<String> + Send,
    ) -> Result<Job> {
        let job = Job::new(tenant_id, job_type);
        self.store.save_job(&job).await?;
        Ok(job)
    }

    /// Creates and persists a child job under the given parent.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn create_child(
        &self,
        parent: &Job,
        job_type: impl Into<String> + Send,
    ) -> Result<Job> {
        let job = parent.create_child(job_type);
        self.store.save_job(&job).await?;
        Ok(job)
    }

    /// Loads a job by reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobNotFound`] if no row exists.
    pub async fn get(&self, job_ref: &JobRef) -> Result<Job> {
        self.store
            .get_job(job_ref)
            .await?
            .ok_or_else(|| Error::JobNotFound {
                job_type: job_ref.job_type.clone(),
                job_id: job_ref.job_id,
            })
    }

    /// Opens an execution scope guarding the given job.
    #[must_use]
    pub fn scoped_execution(&self, job: Job, options: ScopeOptions) -> ExecutionScope {
        ExecutionScope {
            store: Arc::clone(&self.store),
            job,
            options,
        }
    }

    /// Marks the direct parent of `job` FAILED with the given message.
    ///
    /// Returns true if a parent reference existed and its row was found.
    /// A missing parent row is logged and swallowed: propagation is
    /// best-effort bookkeeping and must not mask the original failure.
    async fn fail_parent(&self, job: &Job, message: &str) -> Result<bool> {
        let Some(parent_ref) = &job.parent else {
            return Ok(false);
        };

        let Some(mut parent) = self.store.get_job(parent_ref).await? else {
            tracing::warn!(parent = %parent_ref, "parent job row missing, stopping failure propagation");
            return Ok(false);
        };

        if !parent.is_terminal() {
            parent.status = JobStatus::Failed;
            parent.ended = Some(Utc::now());
            parent.status_message = Some(message.to_string());
            self.store.save_job(&parent).await?;
        }

        Ok(true)
    }
}

/// A guarded execution block over one job.
///
/// The Rust rendition of a scoped-execution context manager: call
/// [`begin`](Self::begin) on entry, then exactly one of
/// [`complete`](Self::complete) or [`fail`](Self::fail) on exit.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use tarn_flow::job::{JobTracker, ScopeOptions};
/// # use tarn_flow::store::memory::InMemoryFlowStore;
/// # async fn example() -> tarn_flow::error::Result<()> {
/// let tracker = JobTracker::new(Arc::new(InMemoryFlowStore::new()));
/// let job = tracker.create("tenant", "CHAIN_REQUEST").await?;
///
/// let mut scope = tracker.scoped_execution(job, ScopeOptions::new());
/// scope.begin().await?;
/// match do_work().await {
///     Ok(()) => {
///         scope.complete().await?;
///     }
///     Err(err) => {
///         scope.fail(&err.to_string()).await?;
///         return Err(err);
///     }
/// }
/// # Ok(())
/// # }
/// # async fn do_work() -> tarn_flow::error::Result<()> { Ok(()) }
/// ```
pub struct ExecutionScope {
    store: Arc<dyn FlowStore>,
    job: Job,
    options: ScopeOptions,
}

impl ExecutionScope {
    /// Returns the guarded job.
    #[must_use]
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Marks the job IN_PROGRESS and stamps `started`, unless it already is
    /// or `skip_initialization` is set.
    ///
    /// Re-entering an already-IN_PROGRESS job never resets `started`.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is terminal or the store write fails.
    pub async fn begin(&mut self) -> Result<()> {
        if self.options.skip_initialization || self.job.status == JobStatus::InProgress {
            return Ok(());
        }

        self.job.transition_to(JobStatus::InProgress)?;
        self.store.save_job(&self.job).await?;
        Ok(())
    }

    /// Marks the job COMPLETED and stamps `ended`, unless `skip_completion`
    /// is set. Consumes the scope and returns the final job state.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is terminal or the store write fails.
    pub async fn complete(mut self) -> Result<Job> {
        if !self.options.skip_completion {
            self.job.transition_to(JobStatus::Completed)?;
            self.store.save_job(&self.job).await?;
        }
        Ok(self.job)
    }

    /// Marks the job FAILED with a status message and propagates per the
    /// configured mode. Consumes the scope and returns the final job state.
    ///
    /// The explicit `failure_message` option wins over `error_text`.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is terminal or a store write for this
    /// job fails. Missing ancestor rows during propagation are not errors.
    #[tracing::instrument(skip(self, error_text), fields(job = %self.job.job_ref()))]
    pub async fn fail(mut self, error_text: &str) -> Result<Job> {
        let message = self
            .options
            .failure_message
            .clone()
            .unwrap_or_else(|| error_text.to_string());

        self.job.transition_to(JobStatus::Failed)?;
        self.job.status_message = Some(message.clone());
        self.store.save_job(&self.job).await?;

        let tracker = JobTracker {
            store: Arc::clone(&self.store),
        };

        match self.options.propagation {
            FailurePropagation::None => {}
            FailurePropagation::Parent => {
                tracker.fail_parent(&self.job, &message).await?;
            }
            FailurePropagation::AllAncestors => {
                let mut current = self.job.clone();
                loop {
                    if !tracker.fail_parent(&current, &message).await? {
                        break;
                    }
                    // fail_parent returned true, so the parent row existed.
                    let Some(parent_ref) = &current.parent else {
                        break;
                    };
                    let Some(parent) = self.store.get_job(parent_ref).await? else {
                        break;
                    };
                    current = parent;
                }
            }
        }

        Ok(self.job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryFlowStore;

    fn tracker() -> (JobTracker, Arc<InMemoryFlowStore>) {
        let store = Arc::new(InMemoryFlowStore::new());
        (JobTracker::new(store.clone()), store)
    }

    #[test]
    fn status_transitions_are_forward_only() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::InProgress));
        assert!(JobStatus::InProgress.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::InProgress.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::InProgress));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn child_job_carries_parent_ref() {
        let parent = Job::new("tenant", "CHAIN_REQUEST");
        let child = parent.create_child("LAKE_REQUEST");

        assert_eq!(child.parent, Some(parent.job_ref()));
        assert_eq!(child.tenant_id, "tenant");
        assert_eq!(child.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn scope_begin_complete_lifecycle() -> Result<()> {
        let (tracker, _) = tracker();
        let job = tracker.create("tenant", "TEST").await?;
        let job_ref = job.job_ref();

        let mut scope = tracker.scoped_execution(job, ScopeOptions::new());
        scope.begin().await?;
        assert_eq!(scope.job().status, JobStatus::InProgress);
        assert!(scope.job().started.is_some());

        let finished = scope.complete().await?;
        assert_eq!(finished.status, JobStatus::Completed);
        assert!(finished.ended.is_some());

        let stored = tracker.get(&job_ref).await?;
        assert_eq!(stored.status, JobStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn begin_does_not_reset_started() -> Result<()> {
        let (tracker, _) = tracker();
        let mut job = tracker.create("tenant", "TEST").await?;
        job.transition_to(JobStatus::InProgress)?;
        let original_started = job.started;

        let mut scope = tracker.scoped_execution(job, ScopeOptions::new());
        scope.begin().await?;

        assert_eq!(scope.job().started, original_started);
        Ok(())
    }

    #[tokio::test]
    async fn fail_records_message_and_is_terminal() -> Result<()> {
        let (tracker, _) = tracker();
        let job = tracker.create("tenant", "TEST").await?;
        let job_ref = job.job_ref();

        let mut scope = tracker.scoped_execution(job, ScopeOptions::new());
        scope.begin().await?;
        let failed = scope.fail("lookup returned no entries").await?;

        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(
            failed.status_message.as_deref(),
            Some("lookup returned no entries")
        );

        // Terminal jobs cannot be reopened.
        let mut stored = tracker.get(&job_ref).await?;
        assert!(stored.transition_to(JobStatus::InProgress).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn explicit_failure_message_wins() -> Result<()> {
        let (tracker, _) = tracker();
        let job = tracker.create("tenant", "TEST").await?;

        let mut scope = tracker.scoped_execution(
            job,
            ScopeOptions::new().failure_message("operator-facing detail"),
        );
        scope.begin().await?;
        let failed = scope.fail("raw error text").await?;

        assert_eq!(
            failed.status_message.as_deref(),
            Some("operator-facing detail")
        );
        Ok(())
    }

    #[tokio::test]
    async fn fail_parent_marks_direct_parent() -> Result<()> {
        let (tracker, _) = tracker();
        let parent = tracker.create("tenant", "CHAIN_REQUEST").await?;
        let child = tracker.create_child(&parent, "LAKE_REQUEST").await?;

        let mut scope = tracker.scoped_execution(
            child,
            ScopeOptions::new().propagation(FailurePropagation::Parent),
        );
        scope.begin().await?;
        scope.fail("step failed").await?;

        let stored_parent = tracker.get(&parent.job_ref()).await?;
        assert_eq!(stored_parent.status, JobStatus::Failed);
        assert_eq!(stored_parent.status_message.as_deref(), Some("step failed"));
        Ok(())
    }

    #[tokio::test]
    async fn fail_all_ancestors_walks_to_root() -> Result<()> {
        let (tracker, _) = tracker();
        let root = tracker.create("tenant", "CHAIN_REQUEST").await?;
        let mid = tracker.create_child(&root, "LAKE_REQUEST").await?;
        let leaf = tracker.create_child(&mid, "LAKE_REQUEST_VALIDATION").await?;

        let mut scope = tracker.scoped_execution(
            leaf,
            ScopeOptions::new().propagation(FailurePropagation::AllAncestors),
        );
        scope.begin().await?;
        scope.fail("validation blew up").await?;

        assert_eq!(tracker.get(&mid.job_ref()).await?.status, JobStatus::Failed);
        assert_eq!(
            tracker.get(&root.job_ref()).await?.status,
            JobStatus::Failed
        );
        Ok(())
    }

    #[tokio::test]
    async fn fail_all_ancestors_stops_at_missing_row() -> Result<()> {
        let store = Arc::new(InMemoryFlowStore::new());
        let tracker = JobTracker::new(store.clone());

        // A child whose parent reference was never persisted.
        let phantom_parent = Job::new("tenant", "CHAIN_REQUEST");
        let child = phantom_parent.create_child("LAKE_REQUEST");
        store.save_job(&child).await?;

        let mut scope = tracker.scoped_execution(
            child.clone(),
            ScopeOptions::new().propagation(FailurePropagation::AllAncestors),
        );
        scope.begin().await?;

        // The walk stops silently; the child's own failure still lands.
        scope.fail("boom").await?;
        let stored = tracker.get(&child.job_ref()).await?;
        assert_eq!(stored.status, JobStatus::Failed);
        Ok(())
    }
}
