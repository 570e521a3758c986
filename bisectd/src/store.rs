//! The storage seam between instances.
//!
//! The job table is the only cross-instance shared state: it is both the
//! queue and the source of truth. Every mutation goes through [`JobStore`],
//! and every implementation must make [`JobStore::claim`] atomic against
//! concurrent claimers: two instances may never both win the same row.

use std::ops::Deref;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::job::{Job, JobId, JobOutcome, JobSpec, WorkerId};

pub mod memory;

/// Windows governing claim eligibility and webhook deduplication.
#[derive(Debug, Clone, Copy)]
pub struct ClaimTimings {
    /// A pending row becomes claimable this long after creation.
    pub pending_grace: Duration,
    /// A running row becomes an orphan once its heartbeat is older than this.
    pub heartbeat_stale: Duration,
    /// Replayed deliveries with an identical identifying tuple inside this
    /// window do not insert a second row.
    pub dedup_window: Duration,
}

impl Default for ClaimTimings {
    fn default() -> Self {
        Self {
            pending_grace: Duration::from_secs(30),
            heartbeat_stale: Duration::from_secs(300),
            dedup_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("job store in a bad state")]
    BadState,
    #[error("job store unavailable: {0}")]
    Unavailable(String),
}

/// Counts by status, plus how many rows the asking instance currently owns.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a `pending` row, or returns the id of an identical row created
    /// inside the deduplication window.
    async fn create(&self, spec: JobSpec) -> Result<JobId, StoreError>;

    /// Atomically claims up to `limit` eligible rows for `worker`: pending
    /// rows past the grace window and running rows whose heartbeat has gone
    /// stale, lowest id first. Claimed rows come back already transitioned to
    /// `running`, owned, with the attempt count incremented.
    ///
    /// This is the central concurrency primitive; a contested row is won by
    /// exactly one caller.
    async fn claim(&self, worker: &WorkerId, limit: u32) -> Result<Vec<Job>, StoreError>;

    /// Advances `heartbeat_at`, but only while the row is still `running` and
    /// still owned by `worker`. Returns `false` when ownership has been lost;
    /// the caller must abandon the job.
    async fn heartbeat(&self, id: JobId, worker: &WorkerId) -> Result<bool, StoreError>;

    /// Writes the terminal state, ownership-guarded. Returns `false` when the
    /// row was no longer owned and nothing was written.
    async fn finish(
        &self,
        id: JobId,
        worker: &WorkerId,
        outcome: JobOutcome,
    ) -> Result<bool, StoreError>;

    /// Graceful-shutdown handoff: reverts `running` to `pending`, clears
    /// ownership, and refunds the attempt so a cooperative release is not
    /// charged as a retry. Ownership-guarded.
    async fn release(&self, id: JobId, worker: &WorkerId) -> Result<bool, StoreError>;

    /// Transitions a job whose claim increment pushed it past the retry
    /// budget straight to `failed` with reason "retry limit exceeded",
    /// clamping the attempt count back to the cap. Returns whether the
    /// transition happened.
    async fn fail_if_exhausted(&self, id: JobId) -> Result<bool, StoreError>;

    /// Appends one line to the job's progress log, ownership-guarded.
    async fn append_progress(
        &self,
        id: JobId,
        worker: &WorkerId,
        line: &str,
    ) -> Result<bool, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    async fn counts(&self) -> Result<StatusCounts, StoreError>;

    /// How many running rows `worker` currently owns, for the stats surface.
    async fn owned_running(&self, worker: &WorkerId) -> Result<i64, StoreError>;

    /// Trivial reachability probe for the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl<T, S> JobStore for S
where
    T: JobStore,
    S: Deref<Target = T> + Send + Sync,
{
    async fn create(&self, spec: JobSpec) -> Result<JobId, StoreError> {
        self.deref().create(spec).await
    }
    async fn claim(&self, worker: &WorkerId, limit: u32) -> Result<Vec<Job>, StoreError> {
        self.deref().claim(worker, limit).await
    }
    async fn heartbeat(&self, id: JobId, worker: &WorkerId) -> Result<bool, StoreError> {
        self.deref().heartbeat(id, worker).await
    }
    async fn finish(
        &self,
        id: JobId,
        worker: &WorkerId,
        outcome: JobOutcome,
    ) -> Result<bool, StoreError> {
        self.deref().finish(id, worker, outcome).await
    }
    async fn release(&self, id: JobId, worker: &WorkerId) -> Result<bool, StoreError> {
        self.deref().release(id, worker).await
    }
    async fn fail_if_exhausted(&self, id: JobId) -> Result<bool, StoreError> {
        self.deref().fail_if_exhausted(id).await
    }
    async fn append_progress(
        &self,
        id: JobId,
        worker: &WorkerId,
        line: &str,
    ) -> Result<bool, StoreError> {
        self.deref().append_progress(id, worker, line).await
    }
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.deref().get(id).await
    }
    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        self.deref().counts().await
    }
    async fn owned_running(&self, worker: &WorkerId) -> Result<i64, StoreError> {
        self.deref().owned_running(worker).await
    }
    async fn ping(&self) -> Result<(), StoreError> {
        self.deref().ping().await
    }
}

/// The reason recorded when the retry budget is exhausted.
pub const RETRY_LIMIT_REASON: &str = "retry limit exceeded";
