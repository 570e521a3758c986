//! An in-memory implementation of [`JobStore`].
//!
//! Provided as a correct (but not optimized) implementation for tests and
//! single-instance local runs. All operations take one write lock, which is
//! what makes claims trivially atomic here; the Postgres store is the one
//! that earns that property with row locks.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, RwLock,
};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};

use super::{ClaimTimings, JobStore, StatusCounts, StoreError, RETRY_LIMIT_REASON};
use crate::job::{Job, JobId, JobOutcome, JobSpec, JobStatus, WorkerId, MAX_ATTEMPTS};

#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<Vec<Job>>>,
    id_counter: Arc<AtomicI64>,
    timings: ClaimTimings,
}

impl InMemoryJobStore {
    pub fn new(timings: ClaimTimings) -> Self {
        Self {
            jobs: Default::default(),
            id_counter: Default::default(),
            timings,
        }
    }

    /// Rewinds a row's heartbeat, for tests exercising orphan recovery
    /// without waiting out the staleness window.
    pub fn backdate_heartbeat(&self, id: JobId, by: TimeDelta) {
        if let Ok(mut jobs) = self.jobs.write() {
            if let Some(job) = jobs.iter_mut().find(|job| job.id == id) {
                job.heartbeat_at = job.heartbeat_at.map(|t| t - by);
            }
        }
    }

    /// Rewinds a row's creation time, for tests exercising the pending grace
    /// window.
    pub fn backdate_created(&self, id: JobId, by: TimeDelta) {
        if let Ok(mut jobs) = self.jobs.write() {
            if let Some(job) = jobs.iter_mut().find(|job| job.id == id) {
                job.created_at -= by;
            }
        }
    }
}

impl Job {
    fn mark_claimed(&mut self, worker: &WorkerId) {
        let now = Utc::now();
        self.status = JobStatus::Running;
        self.worker_id = Some(worker.clone());
        self.attempt_count += 1;
        self.started_at = self.started_at.or(Some(now));
        self.heartbeat_at = Some(now);
    }

    fn mark_finished(&mut self, outcome: JobOutcome) {
        self.status = outcome.status();
        self.finished_at = Some(Utc::now());
        match outcome {
            JobOutcome::Completed { culprit_sha } => self.culprit_sha = Some(culprit_sha),
            JobOutcome::Failed { reason } => self.error_message = Some(reason),
            JobOutcome::Cancelled => {}
        }
    }

    fn mark_released(&mut self) {
        self.status = JobStatus::Pending;
        self.worker_id = None;
        self.started_at = None;
        self.heartbeat_at = None;
        self.attempt_count -= 1;
    }

    fn owned_running(&self, worker: &WorkerId) -> bool {
        self.status == JobStatus::Running && self.worker_id.as_ref() == Some(worker)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, spec: JobSpec) -> Result<JobId, StoreError> {
        let window = TimeDelta::from_std(self.timings.dedup_window)
            .map_err(|_| StoreError::BadState)?;
        let horizon = Utc::now() - window;
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;

        if let Some(existing) = jobs
            .iter()
            .find(|job| job.created_at > horizon && job_matches_spec(job, &spec))
        {
            return Ok(existing.id);
        }

        let id = self.id_counter.fetch_add(1, Ordering::SeqCst) + 1;
        jobs.push(spec_into_job(spec, id));
        Ok(id.into())
    }

    async fn claim(&self, worker: &WorkerId, limit: u32) -> Result<Vec<Job>, StoreError> {
        let now = Utc::now();
        let grace = TimeDelta::from_std(self.timings.pending_grace)
            .map_err(|_| StoreError::BadState)?;
        let stale = TimeDelta::from_std(self.timings.heartbeat_stale)
            .map_err(|_| StoreError::BadState)?;

        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut eligible: Vec<&mut Job> = jobs
            .iter_mut()
            .filter(|job| match job.status {
                JobStatus::Pending => job.created_at + grace <= now,
                JobStatus::Running => {
                    job.heartbeat_at.is_some_and(|beat| beat + stale < now)
                }
                _ => false,
            })
            .collect();
        eligible.sort_by_key(|job| job.id);

        Ok(eligible
            .into_iter()
            .take(limit as usize)
            .map(|job| {
                job.mark_claimed(worker);
                job.clone()
            })
            .collect())
    }

    async fn heartbeat(&self, id: JobId, worker: &WorkerId) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        match jobs.iter_mut().find(|job| job.id == id) {
            None => Err(StoreError::JobNotFound(id)),
            Some(job) if job.owned_running(worker) => {
                job.heartbeat_at = Some(Utc::now());
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn finish(
        &self,
        id: JobId,
        worker: &WorkerId,
        outcome: JobOutcome,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        match jobs.iter_mut().find(|job| job.id == id) {
            None => Err(StoreError::JobNotFound(id)),
            Some(job) if job.owned_running(worker) => {
                job.mark_finished(outcome);
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn release(&self, id: JobId, worker: &WorkerId) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        match jobs.iter_mut().find(|job| job.id == id) {
            None => Err(StoreError::JobNotFound(id)),
            Some(job) if job.owned_running(worker) => {
                job.mark_released();
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn fail_if_exhausted(&self, id: JobId) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        match jobs.iter_mut().find(|job| job.id == id) {
            None => Err(StoreError::JobNotFound(id)),
            Some(job) if job.attempt_count > MAX_ATTEMPTS && !job.status.is_terminal() => {
                job.attempt_count = MAX_ATTEMPTS;
                job.mark_finished(JobOutcome::Failed {
                    reason: RETRY_LIMIT_REASON.to_owned(),
                });
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn append_progress(
        &self,
        id: JobId,
        worker: &WorkerId,
        line: &str,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        match jobs.iter_mut().find(|job| job.id == id) {
            None => Err(StoreError::JobNotFound(id)),
            Some(job) if job.owned_running(worker) => {
                job.progress_log.push_str(line);
                job.progress_log.push('\n');
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .find(|job| job.id == id)
            .cloned())
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        let mut counts = StatusCounts::default();
        for job in jobs.iter() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        Ok(counts)
    }

    async fn owned_running(&self, worker: &WorkerId) -> Result<i64, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|job| job.owned_running(worker))
            .count() as i64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.jobs.read().map_err(|_| StoreError::BadState)?;
        Ok(())
    }
}

fn job_matches_spec(job: &Job, spec: &JobSpec) -> bool {
    job.installation_id == spec.installation_id
        && job.issue_number == spec.issue_number
        && job.good_sha == spec.good_sha
        && job.bad_sha == spec.bad_sha
        && job.test_command == spec.test_command
        && job.requester == spec.requester
}

pub(crate) fn spec_into_job(spec: JobSpec, id: i64) -> Job {
    Job {
        id: id.into(),
        status: JobStatus::Pending,
        repo_owner: spec.repo_owner,
        repo_name: spec.repo_name,
        installation_id: spec.installation_id,
        issue_number: spec.issue_number,
        requester: spec.requester,
        good_sha: spec.good_sha,
        bad_sha: spec.bad_sha,
        test_command: spec.test_command,
        worker_id: None,
        attempt_count: 0,
        created_at: Utc::now(),
        started_at: None,
        heartbeat_at: None,
        finished_at: None,
        culprit_sha: None,
        error_message: None,
        progress_log: String::new(),
    }
}
