//! Execution of one claimed bisect job.
//!
//! The executor owns every terminal store write for its job; the scheduler
//! owns claims and heartbeats. Between any two slow operations the executor
//! passes a checkpoint where the three abort signals are observed: process
//! shutdown (release the job), lost ownership (abandon silently), and budget
//! expiry (fail with "wall-clock timeout").

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::forge::{CommentId, Forge, ForgeError};
use crate::git::{BisectMark, BisectStep, CommitSummary, GitRepo};
use crate::job::{Job, JobOutcome, WorkerId, MAX_ATTEMPTS};
use crate::sandbox::{Sandbox, SandboxError, SandboxLimits, Verdict};
use crate::security::redact;
use crate::store::JobStore;

pub const ENDPOINTS_INCONSISTENT_REASON: &str = "endpoints inconsistent";
pub const UNTESTABLE_RANGE_REASON: &str = "untestable range";
pub const TIMEOUT_REASON: &str = "wall-clock timeout";

/// Abort signals threaded from the scheduler into a running executor.
#[derive(Clone)]
pub struct JobControl {
    /// Process shutdown: release the job for another instance.
    pub shutdown: CancellationToken,
    /// Ownership lost: stop touching the store and the forge.
    pub abandon: CancellationToken,
    /// The job's wall-clock deadline.
    pub deadline: Instant,
}

impl JobControl {
    /// An unconstrained control, for tests.
    pub fn unbounded(budget: Duration) -> Self {
        Self {
            shutdown: CancellationToken::new(),
            abandon: CancellationToken::new(),
            deadline: Instant::now() + budget,
        }
    }

    fn check(&self) -> Option<Abort> {
        if self.abandon.is_cancelled() {
            Some(Abort::Abandoned)
        } else if self.shutdown.is_cancelled() {
            Some(Abort::Shutdown)
        } else if Instant::now() >= self.deadline {
            Some(Abort::BudgetExpired)
        } else {
            None
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Abort {
    Shutdown,
    Abandoned,
    BudgetExpired,
}

/// How one job's execution ended, before terminal handling.
enum ExecutionEnd {
    Completed { culprit: CommitSummary },
    Failed { reason: String },
    Released,
    Abandoned,
    /// No terminal row is written; the job stays `running` and a later claim
    /// recovers it here or elsewhere.
    Infrastructure { detail: String },
}

impl From<Abort> for ExecutionEnd {
    fn from(abort: Abort) -> Self {
        match abort {
            Abort::Shutdown => ExecutionEnd::Released,
            Abort::Abandoned => ExecutionEnd::Abandoned,
            Abort::BudgetExpired => ExecutionEnd::Failed {
                reason: TIMEOUT_REASON.to_owned(),
            },
        }
    }
}

/// The seam between the scheduler and whatever runs a claimed job. The
/// scheduler drives this trait; [`BisectExecutor`] is the real
/// implementation.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(&self, job: Job, control: JobControl);

    /// Called once when a claim pushed `job` past the retry budget and the
    /// store transitioned it to failed. Posts the last-word comment when
    /// credentials are available.
    async fn report_retries_exhausted(&self, _job: &Job) {}
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub workspace_root: PathBuf,
    /// Refresh the progress comment at most this often.
    pub progress_min_interval: Duration,
    /// Upper bound for a single probe, independent of the remaining budget.
    pub probe_cap: Duration,
    /// Extra probes granted at a commit whose first probe said skip.
    pub skip_probe_retries: u32,
    pub limits: SandboxLimits,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("bisectd-workspaces"),
            progress_min_interval: Duration::from_secs(5),
            probe_cap: Duration::from_secs(600),
            skip_probe_retries: 1,
            limits: SandboxLimits::default(),
        }
    }
}

pub struct BisectExecutor<S, F, B> {
    store: S,
    forge: Arc<F>,
    sandbox: B,
    worker: WorkerId,
    config: ExecutorConfig,
}

impl<S, F, B> BisectExecutor<S, F, B>
where
    S: JobStore,
    F: Forge,
    B: Sandbox,
{
    pub fn new(
        store: S,
        forge: Arc<F>,
        sandbox: B,
        worker: WorkerId,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            forge,
            sandbox,
            worker,
            config,
        }
    }

    /// Posts a comment with the body redacted first; nothing user-visible
    /// leaves this module unredacted.
    async fn post_comment(&self, job: &Job, body: &str) -> Result<CommentId, ForgeError> {
        self.forge
            .create_comment(
                job.installation_id,
                &job.repo_owner,
                &job.repo_name,
                job.issue_number,
                &redact(body),
            )
            .await
    }

    async fn edit_comment(
        &self,
        job: &Job,
        comment_id: CommentId,
        body: &str,
    ) -> Result<(), ForgeError> {
        self.forge
            .update_comment(
                job.installation_id,
                &job.repo_owner,
                &job.repo_name,
                comment_id,
                &redact(body),
            )
            .await
    }

    async fn run_job(&self, job: &Job, control: &JobControl, workspace: &Path) -> ExecutionEnd {
        if let Some(abort) = control.check() {
            return abort.into();
        }

        // Equal endpoints cannot bracket a transition; reject before spending
        // a clone on them.
        if job.good_sha == job.bad_sha {
            return ExecutionEnd::Failed {
                reason: ENDPOINTS_INCONSISTENT_REASON.to_owned(),
            };
        }

        let clone_url = match self
            .forge
            .clone_url(&job.repo_owner, &job.repo_name, job.installation_id)
            .await
        {
            Ok(url) => url,
            Err(err) => {
                return ExecutionEnd::Failed {
                    reason: format!("could not obtain repository access: {err}"),
                }
            }
        };

        let repo = match GitRepo::clone(&clone_url, &workspace.join("repo")).await {
            Ok(repo) => repo,
            Err(err) => {
                return ExecutionEnd::Failed {
                    reason: format!("clone failed: {err}"),
                }
            }
        };
        if let Some(abort) = control.check() {
            return abort.into();
        }

        let (good, bad) = match self.resolve_endpoints(&repo, job).await {
            Ok(endpoints) => endpoints,
            Err(end) => return end,
        };

        let start_comment = match self
            .post_comment(
                job,
                &comment::starting(job, &good, &bad),
            )
            .await
        {
            Ok(id) => Some(id),
            Err(err) => {
                // The starting comment is cosmetic; a transport blip here
                // should not burn an attempt.
                warn!(job_id = %job.id, error = %err, "could not post starting comment");
                None
            }
        };

        match self.check_endpoints(&repo, job, control, &good, &bad).await {
            Ok(()) => {}
            Err(end) => return end,
        }

        self.bisect_loop(&repo, job, control, &bad, &good, start_comment)
            .await
    }

    /// Resolves both endpoints to full commit ids, proving they exist in the
    /// clone.
    async fn resolve_endpoints(
        &self,
        repo: &GitRepo,
        job: &Job,
    ) -> Result<(String, String), ExecutionEnd> {
        let mut resolved = Vec::with_capacity(2);
        for (field, sha) in [("good_sha", &job.good_sha), ("bad_sha", &job.bad_sha)] {
            match repo.rev_parse(sha).await {
                Ok(full) => resolved.push(full),
                Err(_) => {
                    return Err(ExecutionEnd::Failed {
                        reason: format!("{field} {sha} does not exist in the repository"),
                    })
                }
            }
        }
        let good = resolved.remove(0);
        let bad = resolved.remove(0);
        if good == bad {
            return Err(ExecutionEnd::Failed {
                reason: ENDPOINTS_INCONSISTENT_REASON.to_owned(),
            });
        }
        Ok((good, bad))
    }

    /// Confirms the bad endpoint fails and the good endpoint passes before
    /// any narrowing happens.
    async fn check_endpoints(
        &self,
        repo: &GitRepo,
        job: &Job,
        control: &JobControl,
        good: &str,
        bad: &str,
    ) -> Result<(), ExecutionEnd> {
        for (sha, expect_good) in [(bad, false), (good, true)] {
            if let Some(abort) = control.check() {
                return Err(abort.into());
            }
            if let Err(end) = self.checkout(repo, sha).await {
                return Err(end);
            }
            let verdict = match self.probe(repo, job, control).await {
                Ok(verdict) => verdict,
                Err(end) => return Err(end),
            };
            let confirmed = match verdict {
                Verdict::Good => expect_good,
                Verdict::Bad { .. } => !expect_good,
                Verdict::Skip { .. } => false,
            };
            if !confirmed {
                return Err(ExecutionEnd::Failed {
                    reason: ENDPOINTS_INCONSISTENT_REASON.to_owned(),
                });
            }
        }
        Ok(())
    }

    async fn checkout(&self, repo: &GitRepo, sha: &str) -> Result<(), ExecutionEnd> {
        repo.checkout(sha).await.map_err(|err| ExecutionEnd::Failed {
            reason: format!("checkout of {sha} failed: {err}"),
        })
    }

    /// One sandbox invocation with the wall clock derived from the remaining
    /// job budget.
    async fn probe(
        &self,
        repo: &GitRepo,
        job: &Job,
        control: &JobControl,
    ) -> Result<Verdict, ExecutionEnd> {
        let remaining = control.remaining();
        if remaining.is_zero() {
            return Err(Abort::BudgetExpired.into());
        }
        let limits = SandboxLimits {
            wall_clock: remaining.min(self.config.probe_cap),
            ..self.config.limits.clone()
        };

        tokio::select! {
            verdict = self.sandbox.run(repo.dir(), &job.test_command, &limits) => {
                verdict.map_err(|err: SandboxError| ExecutionEnd::Failed {
                    reason: err.to_string(),
                })
            }
            _ = control.shutdown.cancelled() => Err(Abort::Shutdown.into()),
            _ = control.abandon.cancelled() => Err(Abort::Abandoned.into()),
        }
    }

    /// A probe plus the bounded skip retry.
    async fn decided_probe(
        &self,
        repo: &GitRepo,
        job: &Job,
        control: &JobControl,
    ) -> Result<(BisectMark, String), ExecutionEnd> {
        let mut skips = 0;
        loop {
            let started = Instant::now();
            let verdict = self.probe(repo, job, control).await?;
            let elapsed = started.elapsed().as_secs_f64();
            match verdict {
                Verdict::Good => return Ok((BisectMark::Good, format!("good ({elapsed:.1}s)"))),
                Verdict::Bad { exit_code } => {
                    return Ok((
                        BisectMark::Bad,
                        format!("bad, exit code {exit_code} ({elapsed:.1}s)"),
                    ))
                }
                Verdict::Skip { reason } => {
                    if skips < self.config.skip_probe_retries {
                        skips += 1;
                        continue;
                    }
                    return Ok((BisectMark::Skip, format!("skip: {reason}")));
                }
            }
        }
    }

    async fn bisect_loop(
        &self,
        repo: &GitRepo,
        job: &Job,
        control: &JobControl,
        bad: &str,
        good: &str,
        start_comment: Option<CommentId>,
    ) -> ExecutionEnd {
        let mut step = match repo.bisect_start(bad, good).await {
            Ok(step) => step,
            Err(err) => {
                return ExecutionEnd::Failed {
                    reason: format!("bisect start failed: {err}"),
                }
            }
        };

        let mut progress: Vec<String> = Vec::new();
        let mut last_refresh: Option<Instant> = None;

        loop {
            match step {
                BisectStep::Culprit { sha } => {
                    return match repo.commit_summary(&sha).await {
                        Ok(culprit) => ExecutionEnd::Completed { culprit },
                        Err(err) => ExecutionEnd::Failed {
                            reason: format!("could not describe culprit {sha}: {err}"),
                        },
                    };
                }
                BisectStep::Exhausted => {
                    return ExecutionEnd::Failed {
                        reason: UNTESTABLE_RANGE_REASON.to_owned(),
                    };
                }
                BisectStep::Candidate { sha } => {
                    if let Some(abort) = control.check() {
                        return abort.into();
                    }
                    let (mark, summary) = match self.decided_probe(repo, job, control).await {
                        Ok(decided) => decided,
                        Err(end) => return end,
                    };

                    let line = format!("{}: {summary}", &sha[..7]);
                    match self.store.append_progress(job.id, &self.worker, &line).await {
                        Ok(true) => {}
                        // The row is owned elsewhere now; stop immediately.
                        Ok(false) => return ExecutionEnd::Abandoned,
                        Err(err) => {
                            return ExecutionEnd::Infrastructure {
                                detail: err.to_string(),
                            }
                        }
                    }
                    progress.push(line);

                    let refresh_due = last_refresh
                        .map_or(true, |at| at.elapsed() >= self.config.progress_min_interval);
                    if let (Some(comment_id), true) = (start_comment, refresh_due) {
                        let body = comment::progress(job, &progress);
                        if let Err(err) = self.edit_comment(job, comment_id, &body).await {
                            warn!(job_id = %job.id, error = %err, "progress refresh failed");
                        }
                        last_refresh = Some(Instant::now());
                    }

                    step = match repo.bisect_mark(mark).await {
                        Ok(step) => step,
                        Err(err) => {
                            return ExecutionEnd::Failed {
                                reason: format!("bisect step failed: {err}"),
                            }
                        }
                    };
                }
            }
        }
    }
}

#[async_trait]
impl<S, F, B> Executor for BisectExecutor<S, F, B>
where
    S: JobStore + 'static,
    F: Forge + 'static,
    B: Sandbox + 'static,
{
    async fn execute(&self, job: Job, control: JobControl) {
        info!(
            job_id = %job.id,
            repo = %job.repo_slug(),
            attempt = job.attempt_count,
            "starting bisect job"
        );

        let workspace = match Workspace::create(&self.config.workspace_root, &job) {
            Ok(workspace) => workspace,
            Err(err) => {
                // Leave the row running; the next claim retries on an
                // instance whose disk cooperates.
                error!(job_id = %job.id, error = %err, "workspace creation failed");
                return;
            }
        };

        let end = self.run_job(&job, &control, workspace.dir()).await;

        match end {
            ExecutionEnd::Completed { culprit } => {
                if let Err(err) = self.post_comment(&job, &comment::completed(&job, &culprit)).await
                {
                    warn!(job_id = %job.id, error = %err, "result comment failed; leaving job running for re-claim");
                    return;
                }
                let outcome = JobOutcome::Completed {
                    culprit_sha: culprit.sha.clone(),
                };
                match self.store.finish(job.id, &self.worker, outcome).await {
                    Ok(true) => info!(job_id = %job.id, culprit = %culprit.sha, "bisect complete"),
                    Ok(false) => warn!(job_id = %job.id, "finished but ownership was lost"),
                    Err(err) => error!(job_id = %job.id, error = %err, "terminal write failed"),
                }
            }
            ExecutionEnd::Failed { reason } => {
                let reason = redact(&reason);
                if let Err(err) = self.post_comment(&job, &comment::failed(&job, &reason)).await {
                    warn!(job_id = %job.id, error = %err, "failure comment failed; leaving job running for re-claim");
                    return;
                }
                let outcome = JobOutcome::Failed {
                    reason: reason.clone(),
                };
                match self.store.finish(job.id, &self.worker, outcome).await {
                    Ok(true) => warn!(job_id = %job.id, %reason, "bisect failed"),
                    Ok(false) => warn!(job_id = %job.id, "failed but ownership was lost"),
                    Err(err) => error!(job_id = %job.id, error = %err, "terminal write failed"),
                }
            }
            ExecutionEnd::Released => {
                match self.store.release(job.id, &self.worker).await {
                    Ok(true) => info!(job_id = %job.id, "released for another instance"),
                    Ok(false) => warn!(job_id = %job.id, "release refused; ownership already lost"),
                    Err(err) => error!(job_id = %job.id, error = %err, "release failed"),
                }
            }
            ExecutionEnd::Abandoned => {
                info!(job_id = %job.id, "abandoned after losing ownership");
            }
            ExecutionEnd::Infrastructure { detail } => {
                error!(job_id = %job.id, %detail, "infrastructure failure; job left running for re-claim");
            }
        }
    }

    async fn report_retries_exhausted(&self, job: &Job) {
        let body = comment::retries_exhausted(job);
        if let Err(err) = self.post_comment(job, &body).await {
            warn!(job_id = %job.id, error = %err, "could not post retry-exhaustion comment");
        }
    }
}

/// The per-job scratch directory: `{workspace_root}/{job_id}/`. One executor
/// is the sole writer; the directory is deleted on every exit path.
struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    fn create(root: &Path, job: &Job) -> std::io::Result<Self> {
        let dir = root.join(job.id.to_string());
        if dir.exists() {
            // Leftover from a crashed attempt on this same path.
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %err, "workspace cleanup failed");
        }
    }
}

/// Comment bodies. Kept together so the whole user-visible surface is
/// testable in one place; every body still passes through redaction at the
/// send boundary.
mod comment {
    use super::*;

    pub(super) fn starting(job: &Job, good: &str, bad: &str) -> String {
        format!(
            "🔍 Bisecting `{}..{}` for @{}\n\nTest command: `{}`\n\nProgress will appear here.",
            &good[..7],
            &bad[..7],
            job.requester,
            job.test_command,
        )
    }

    pub(super) fn progress(job: &Job, lines: &[String]) -> String {
        format!(
            "🔍 Bisecting `{}..{}`\n\n```\n{}\n```",
            &job.good_sha[..7],
            &job.bad_sha[..7],
            lines.join("\n"),
        )
    }

    pub(super) fn completed(job: &Job, culprit: &CommitSummary) -> String {
        format!(
            "🎯 Found the first bad commit for @{}:\n\n\
             `{}`: {} (by {})",
            job.requester, culprit.sha, culprit.subject, culprit.author,
        )
    }

    pub(super) fn failed(job: &Job, reason: &str) -> String {
        format!(
            "❌ Bisect of `{}..{}` failed: {reason}",
            &job.good_sha[..7],
            &job.bad_sha[..7],
        )
    }

    pub(super) fn retries_exhausted(job: &Job) -> String {
        format!(
            "❌ Giving up on bisecting `{}..{}` after {MAX_ATTEMPTS} attempts: retry limit exceeded.",
            &job.good_sha[..7],
            &job.bad_sha[..7],
        )
    }
}
