//! The per-instance control loop.
//!
//! One scheduler per process: it claims eligible jobs up to the concurrency
//! cap, spawns an executor task per claim, and heartbeats every in-flight
//! job on a timer. Orphan recovery is not a separate code path; the ordinary
//! claim already targets stale running rows.
//!
//! Heartbeats deliberately live here rather than in the executors: an
//! executor blocked inside a subprocess wait cannot starve a timer it does
//! not own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executor::{Executor, JobControl};
use crate::job::{JobId, WorkerId};
use crate::store::JobStore;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_jobs: u32,
    pub heartbeat_interval: Duration,
    /// How often claims run when nothing wakes us earlier. Doubles as the
    /// recovery cadence, since recovery is folded into the claim.
    pub claim_interval: Duration,
    /// Wall-clock budget for one job.
    pub job_budget: Duration,
    /// How long draining waits for in-flight jobs to complete before telling
    /// them to release.
    pub drain_deadline: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            heartbeat_interval: Duration::from_secs(60),
            claim_interval: Duration::from_secs(30),
            job_budget: Duration::from_secs(1800),
            drain_deadline: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to gracefully shut down")]
    GracefulShutdownFailed,
}

/// Handle the ingress uses to trigger an early claim tick after inserting a
/// job, instead of waiting out the claim interval.
#[derive(Clone)]
pub struct Waker(mpsc::UnboundedSender<()>);

impl Waker {
    pub fn wake(&self) {
        let _ = self.0.send(());
    }

    /// A waker with no scheduler attached; wakes go nowhere. For tests.
    pub fn disconnected() -> Self {
        let (sender, _receiver) = mpsc::unbounded_channel();
        Self(sender)
    }
}

pub struct Scheduler<S, E> {
    store: S,
    executor: Arc<E>,
    worker: WorkerId,
    config: SchedulerConfig,
}

struct InFlight {
    abandon: CancellationToken,
    handle: JoinHandle<()>,
}

impl<S, E> Scheduler<S, E>
where
    S: JobStore + Clone + Send + Sync + 'static,
    E: Executor,
{
    pub fn new(store: S, executor: Arc<E>, worker: WorkerId, config: SchedulerConfig) -> Self {
        Self {
            store,
            executor,
            worker,
            config,
        }
    }

    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();
        let (waker_sender, waker_receiver) = mpsc::unbounded_channel();

        let handle = tokio::spawn(self.run(shutdown_receiver, waker_receiver));

        SchedulerHandle {
            shutdown: Some(shutdown_sender),
            waker: Waker(waker_sender),
            handle: Some(handle),
        }
    }

    async fn run(
        self,
        mut shutdown: oneshot::Receiver<()>,
        mut waker: mpsc::UnboundedReceiver<()>,
    ) {
        info!(worker = %self.worker, "scheduler starting");
        let shutdown_token = CancellationToken::new();
        let mut in_flight: HashMap<JobId, InFlight> = HashMap::new();
        let mut claim_tick = tokio::time::interval(self.config.claim_interval);
        let mut heartbeat_tick = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            in_flight.retain(|_, flight| !flight.handle.is_finished());

            tokio::select! {
                _ = &mut shutdown => {
                    self.drain(in_flight, shutdown_token).await;
                    break;
                }
                Some(()) = waker.recv() => {
                    self.claim_and_spawn(&mut in_flight, &shutdown_token).await;
                }
                _ = claim_tick.tick() => {
                    self.claim_and_spawn(&mut in_flight, &shutdown_token).await;
                }
                _ = heartbeat_tick.tick() => {
                    self.heartbeat_all(&in_flight).await;
                }
            }
        }
        info!(worker = %self.worker, "scheduler stopped");
    }

    async fn claim_and_spawn(
        &self,
        in_flight: &mut HashMap<JobId, InFlight>,
        shutdown_token: &CancellationToken,
    ) {
        let capacity = (self.config.max_concurrent_jobs as usize).saturating_sub(in_flight.len());
        if capacity == 0 {
            return;
        }

        let claimed = match self.store.claim(&self.worker, capacity as u32).await {
            Ok(claimed) => claimed,
            Err(err) => {
                error!(error = %err, "claim failed");
                return;
            }
        };

        for job in claimed {
            if in_flight.contains_key(&job.id) {
                // Our own heartbeat went stale and we re-claimed a job we are
                // still running; the existing task keeps it.
                warn!(job_id = %job.id, "re-claimed a job already in flight here");
                continue;
            }

            if job.retries_exhausted() {
                match self.store.fail_if_exhausted(job.id).await {
                    Ok(true) => {
                        warn!(job_id = %job.id, attempts = job.attempt_count - 1, "retry budget exhausted");
                        self.executor.report_retries_exhausted(&job).await;
                    }
                    Ok(false) => debug!(job_id = %job.id, "exhaustion already handled elsewhere"),
                    Err(err) => error!(job_id = %job.id, error = %err, "exhaustion transition failed"),
                }
                continue;
            }

            let control = JobControl {
                shutdown: shutdown_token.child_token(),
                abandon: CancellationToken::new(),
                deadline: Instant::now() + self.config.job_budget,
            };
            let abandon = control.abandon.clone();
            let job_id = job.id;
            let handle = tokio::spawn({
                let executor = Arc::clone(&self.executor);
                async move { executor.execute(job, control).await }
            });
            in_flight.insert(job_id, InFlight { abandon, handle });
        }
    }

    async fn heartbeat_all(&self, in_flight: &HashMap<JobId, InFlight>) {
        for (&job_id, flight) in in_flight {
            if flight.handle.is_finished() || flight.abandon.is_cancelled() {
                continue;
            }
            match self.store.heartbeat(job_id, &self.worker).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(%job_id, "ownership lost; telling executor to abandon");
                    flight.abandon.cancel();
                }
                // A transient store failure is not loss of ownership; keep
                // running and let the next tick decide.
                Err(err) => error!(%job_id, error = %err, "heartbeat failed"),
            }
        }
    }

    /// Stops claiming, gives in-flight jobs a completion window, then tells
    /// the stragglers to release and waits for them.
    async fn drain(&self, in_flight: HashMap<JobId, InFlight>, shutdown_token: CancellationToken) {
        if in_flight.is_empty() {
            return;
        }
        info!(jobs = in_flight.len(), "draining");

        let handles: Vec<_> = in_flight.into_values().map(|flight| flight.handle).collect();
        let mut all = Box::pin(futures::future::join_all(handles));

        if tokio::time::timeout(self.config.drain_deadline, &mut all)
            .await
            .is_ok()
        {
            return;
        }

        shutdown_token.cancel();
        if tokio::time::timeout(self.config.drain_deadline, &mut all)
            .await
            .is_err()
        {
            warn!("some executors did not release before the drain deadline; their rows will be recovered by heartbeat staleness");
        }
    }
}

pub struct SchedulerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    waker: Waker,
    handle: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    pub async fn graceful_shutdown(&mut self) -> Result<(), SchedulerError> {
        if let Some(sender) = self.shutdown.take() {
            sender
                .send(())
                .map_err(|_| SchedulerError::GracefulShutdownFailed)?;
        }
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|_| SchedulerError::GracefulShutdownFailed)?;
        }
        Ok(())
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        if let Some(sender) = self.shutdown.take() {
            let _ = sender.send(());
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::job::{Job, JobOutcome, JobSpec, JobStatus, MAX_ATTEMPTS};
    use crate::store::memory::InMemoryJobStore;
    use crate::store::ClaimTimings;

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_jobs: 4,
            heartbeat_interval: Duration::from_millis(50),
            claim_interval: Duration::from_millis(50),
            job_budget: Duration::from_secs(60),
            drain_deadline: Duration::from_millis(200),
        }
    }

    fn immediate_store() -> InMemoryJobStore {
        InMemoryJobStore::new(ClaimTimings {
            pending_grace: Duration::ZERO,
            heartbeat_stale: Duration::from_secs(300),
            dedup_window: Duration::from_secs(60),
        })
    }

    fn spec(issue: i64) -> JobSpec {
        JobSpec {
            repo_owner: "octocat".to_owned(),
            repo_name: "spoon-knife".to_owned(),
            installation_id: 1,
            issue_number: issue,
            requester: "octocat".to_owned(),
            good_sha: "a".repeat(40),
            bad_sha: "b".repeat(40),
            test_command: "true".to_owned(),
        }
    }

    /// Completes every job after a configurable hold, releasing on shutdown
    /// and halting on abandonment, the way the real executor does.
    struct StubExecutor {
        store: InMemoryJobStore,
        worker: WorkerId,
        hold: Duration,
        running: AtomicU32,
        peak_running: AtomicU32,
        abandoned: Mutex<Vec<JobId>>,
        exhausted_reports: AtomicUsize,
    }

    impl StubExecutor {
        fn new(store: InMemoryJobStore, worker: WorkerId, hold: Duration) -> Self {
            Self {
                store,
                worker,
                hold,
                running: AtomicU32::new(0),
                peak_running: AtomicU32::new(0),
                abandoned: Mutex::new(Vec::new()),
                exhausted_reports: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Executor for StubExecutor {
        async fn execute(&self, job: Job, control: JobControl) {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_running.fetch_max(now, Ordering::SeqCst);

            tokio::select! {
                _ = tokio::time::sleep(self.hold) => {
                    let _ = self
                        .store
                        .finish(job.id, &self.worker, JobOutcome::Completed {
                            culprit_sha: "c".repeat(40),
                        })
                        .await;
                }
                _ = control.shutdown.cancelled() => {
                    let _ = self.store.release(job.id, &self.worker).await;
                }
                _ = control.abandon.cancelled() => {
                    self.abandoned.lock().unwrap().push(job.id);
                }
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
        }

        async fn report_retries_exhausted(&self, _job: &Job) {
            self.exhausted_reports.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn never_runs_more_than_the_cap() {
        let store = immediate_store();
        let worker = WorkerId::from("test-worker".to_owned());
        for issue in 1..=10 {
            store.create(spec(issue)).await.unwrap();
        }

        let executor = Arc::new(StubExecutor::new(
            store.clone(),
            worker.clone(),
            Duration::from_millis(80),
        ));
        let mut handle =
            Scheduler::new(store.clone(), Arc::clone(&executor), worker, fast_config()).spawn();

        tokio::time::sleep(Duration::from_millis(1200)).await;
        handle.graceful_shutdown().await.unwrap();

        assert!(executor.peak_running.load(Ordering::SeqCst) <= 4);
        assert_eq!(store.counts().await.unwrap().completed, 10);
    }

    #[tokio::test]
    async fn lost_ownership_cancels_the_executor() {
        let store = immediate_store();
        let worker = WorkerId::from("original-worker".to_owned());
        let id = store.create(spec(1)).await.unwrap();

        let executor = Arc::new(StubExecutor::new(
            store.clone(),
            worker.clone(),
            Duration::from_secs(30),
        ));
        let mut handle = Scheduler::new(
            store.clone(),
            Arc::clone(&executor),
            worker,
            fast_config(),
        )
        .spawn();

        // Wait for the claim, then steal the row as a different instance.
        tokio::time::sleep(Duration::from_millis(150)).await;
        store.backdate_heartbeat(id, chrono::TimeDelta::minutes(6));
        let thief = WorkerId::from("thief".to_owned());
        assert_eq!(store.claim(&thief, 1).await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(executor.abandoned.lock().unwrap().as_slice(), &[id]);

        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn drain_releases_jobs_that_cannot_finish_in_time() {
        let store = immediate_store();
        let worker = WorkerId::from("test-worker".to_owned());
        let id = store.create(spec(1)).await.unwrap();

        let executor = Arc::new(StubExecutor::new(
            store.clone(),
            worker.clone(),
            Duration::from_secs(600),
        ));
        let mut handle = Scheduler::new(
            store.clone(),
            Arc::clone(&executor),
            worker,
            fast_config(),
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Running);

        handle.graceful_shutdown().await.unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        // A cooperative handoff is not charged as an attempt.
        assert_eq!(job.attempt_count, 0);
    }

    #[tokio::test]
    async fn exhausted_jobs_are_failed_and_reported_not_executed() {
        let store = immediate_store();
        let id = store.create(spec(1)).await.unwrap();

        // Burn the whole retry budget with crashed-looking attempts.
        for attempt in 0..MAX_ATTEMPTS {
            let ghost = WorkerId::from(format!("ghost-{attempt}"));
            assert_eq!(store.claim(&ghost, 1).await.unwrap().len(), 1);
            store.backdate_heartbeat(id, chrono::TimeDelta::minutes(6));
        }

        let worker = WorkerId::from("test-worker".to_owned());
        let executor = Arc::new(StubExecutor::new(
            store.clone(),
            worker.clone(),
            Duration::from_millis(10),
        ));
        let mut handle = Scheduler::new(
            store.clone(),
            Arc::clone(&executor),
            worker,
            fast_config(),
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.graceful_shutdown().await.unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, MAX_ATTEMPTS);
        assert_eq!(job.error_message.as_deref(), Some("retry limit exceeded"));
        assert_eq!(executor.exhausted_reports.load(Ordering::SeqCst), 1);
        assert!(executor.abandoned.lock().unwrap().is_empty());
        assert_eq!(executor.peak_running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn waker_triggers_an_early_claim() {
        let store = immediate_store();
        let worker = WorkerId::from("test-worker".to_owned());

        let executor = Arc::new(StubExecutor::new(
            store.clone(),
            worker.clone(),
            Duration::from_millis(10),
        ));
        let config = SchedulerConfig {
            claim_interval: Duration::from_secs(3600),
            ..fast_config()
        };
        let mut handle =
            Scheduler::new(store.clone(), Arc::clone(&executor), worker, config).spawn();

        // Let the startup tick pass with an empty queue first.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let id = store.create(spec(1)).await.unwrap();
        handle.waker().wake();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );

        handle.graceful_shutdown().await.unwrap();
    }
}
