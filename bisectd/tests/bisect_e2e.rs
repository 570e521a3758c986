//! End-to-end bisect tests against throwaway git repositories with
//! controlled histories: the full executor, the in-memory store, the process
//! sandbox, and a recording forge.

use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tempfile::TempDir;

use bisectd::executor::{BisectExecutor, Executor, ExecutorConfig, JobControl};
use bisectd::forge::{CommentId, Forge, ForgeError};
use bisectd::job::{Job, JobSpec, JobStatus, WorkerId};
use bisectd::sandbox::ProcessSandbox;
use bisectd::store::memory::InMemoryJobStore;
use bisectd::store::{ClaimTimings, JobStore};

/// Builds git repositories with a controlled commit history, the way a
/// maintainer would reproduce a regression: a `test.sh` at every commit and
/// a deliberate break partway through.
struct GitRepoBuilder {
    dir: TempDir,
    shas: Vec<String>,
}

impl GitRepoBuilder {
    fn init() -> Self {
        let dir = TempDir::new().unwrap();
        run_git(dir.path(), &["init", "--quiet", "--initial-branch=main"]);
        Self { dir, shas: Vec::new() }
    }

    fn write(&self, name: &str, content: &str) -> &Self {
        std::fs::write(self.dir.path().join(name), content).unwrap();
        self
    }

    fn commit(&mut self, message: &str) -> String {
        run_git(self.dir.path(), &["add", "-A"]);
        run_git(
            self.dir.path(),
            &[
                "-c",
                "user.name=Maintainer",
                "-c",
                "user.email=maintainer@example.com",
                "commit",
                "--quiet",
                "-m",
                message,
            ],
        );
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(self.dir.path())
            .output()
            .unwrap();
        let sha = String::from_utf8(output.stdout).unwrap().trim().to_owned();
        self.shas.push(sha.clone());
        sha
    }

    fn path_url(&self) -> String {
        self.dir.path().display().to_string()
    }
}

fn run_git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("git should be runnable in tests");
    assert!(status.success(), "git {args:?} failed");
}

/// A forge that clones from a local path and records every comment.
struct RecordingForge {
    clone_from: String,
    created: Mutex<Vec<String>>,
    updated: Mutex<Vec<String>>,
    next_comment_id: AtomicI64,
}

impl RecordingForge {
    fn new(clone_from: String) -> Self {
        Self {
            clone_from,
            created: Mutex::new(Vec::new()),
            updated: Mutex::new(Vec::new()),
            next_comment_id: AtomicI64::new(1),
        }
    }

    fn created_bodies(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl Forge for RecordingForge {
    async fn clone_url(
        &self,
        _owner: &str,
        _repo: &str,
        _installation_id: i64,
    ) -> Result<SecretString, ForgeError> {
        Ok(SecretString::from(self.clone_from.clone()))
    }

    async fn create_comment(
        &self,
        _installation_id: i64,
        _owner: &str,
        _repo: &str,
        _issue_number: i64,
        body: &str,
    ) -> Result<CommentId, ForgeError> {
        self.created.lock().unwrap().push(body.to_owned());
        Ok(CommentId::from(self.next_comment_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn update_comment(
        &self,
        _installation_id: i64,
        _owner: &str,
        _repo: &str,
        _comment_id: CommentId,
        body: &str,
    ) -> Result<(), ForgeError> {
        self.updated.lock().unwrap().push(body.to_owned());
        Ok(())
    }
}

struct Harness {
    store: InMemoryJobStore,
    forge: Arc<RecordingForge>,
    worker: WorkerId,
    executor: BisectExecutor<InMemoryJobStore, RecordingForge, ProcessSandbox>,
    _workspace_root: TempDir,
}

fn harness(clone_from: String) -> Harness {
    let store = InMemoryJobStore::new(ClaimTimings {
        pending_grace: Duration::ZERO,
        heartbeat_stale: Duration::from_secs(300),
        dedup_window: Duration::from_secs(60),
    });
    let forge = Arc::new(RecordingForge::new(clone_from));
    let worker = WorkerId::from("e2e-worker".to_owned());
    let workspace_root = TempDir::new().unwrap();
    let config = ExecutorConfig {
        workspace_root: workspace_root.path().to_owned(),
        progress_min_interval: Duration::from_millis(10),
        probe_cap: Duration::from_secs(30),
        skip_probe_retries: 1,
        ..ExecutorConfig::default()
    };
    let executor = BisectExecutor::new(
        store.clone(),
        Arc::clone(&forge),
        ProcessSandbox,
        worker.clone(),
        config,
    );
    Harness {
        store,
        forge,
        worker,
        executor,
        _workspace_root: workspace_root,
    }
}

impl Harness {
    async fn submit_and_claim(&self, good_sha: &str, bad_sha: &str, test_command: &str) -> Job {
        let spec = JobSpec {
            repo_owner: "octocat".to_owned(),
            repo_name: "spoon-knife".to_owned(),
            installation_id: 42,
            issue_number: 7,
            requester: "octocat".to_owned(),
            good_sha: good_sha.to_owned(),
            bad_sha: bad_sha.to_owned(),
            test_command: test_command.to_owned(),
        };
        self.store.create(spec).await.unwrap();
        let mut claimed = self.store.claim(&self.worker, 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        claimed.remove(0)
    }

    async fn run(&self, job: Job, budget: Duration) -> Job {
        let id = job.id;
        self.executor
            .execute(job, JobControl::unbounded(budget))
            .await;
        self.store.get(id).await.unwrap().unwrap()
    }
}

/// Six commits; the test starts failing at index 3.
fn breaking_history() -> GitRepoBuilder {
    let mut builder = GitRepoBuilder::init();
    builder.write("test.sh", "#!/bin/sh\ngrep -q PASS status.txt\n");
    builder.write("status.txt", "PASS");
    builder.commit("Initial commit with passing test");

    builder.write("feature_a.txt", "feature a");
    builder.commit("Add feature A");
    builder.write("feature_b.txt", "feature b");
    builder.commit("Add feature B");

    builder.write("status.txt", "FAIL");
    builder.commit("Update status handling - breaks test");

    builder.write("feature_c.txt", "feature c");
    builder.commit("Add feature C");
    builder.write("feature_d.txt", "feature d");
    builder.commit("Add feature D");
    builder
}

#[tokio::test]
async fn happy_path_finds_the_culprit_and_posts_two_comments() {
    let repo = breaking_history();
    let h = harness(repo.path_url());

    let job = h
        .submit_and_claim(&repo.shas[2], &repo.shas[5], "sh test.sh")
        .await;
    let finished = h.run(job, Duration::from_secs(120)).await;

    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.culprit_sha.as_deref(), Some(repo.shas[3].as_str()));
    assert!(finished.finished_at.is_some());
    assert!(finished.progress_log.contains("good") || finished.progress_log.contains("bad"));

    let created = h.forge.created_bodies();
    assert_eq!(created.len(), 2, "start and result comments: {created:?}");
    assert!(created[0].contains("Bisecting"));
    assert!(created[1].contains(&repo.shas[3]));
    assert!(created[1].contains("breaks test"));
    assert!(created[1].contains("Maintainer"));
}

#[tokio::test]
async fn culprit_is_found_regardless_of_where_it_sits_in_the_range() {
    for breaks_at in [1, 2, 4, 5] {
        let mut builder = GitRepoBuilder::init();
        builder.write("test.sh", "#!/bin/sh\ngrep -q PASS status.txt\n");
        for index in 0..6 {
            let marker = if index >= breaks_at { "FAIL" } else { "PASS" };
            builder.write("status.txt", marker);
            builder.write(&format!("file_{index}.txt"), "content");
            builder.commit(&format!("commit {index}"));
        }

        let h = harness(builder.path_url());
        let job = h
            .submit_and_claim(&builder.shas[0], &builder.shas[5], "sh test.sh")
            .await;
        let finished = h.run(job, Duration::from_secs(120)).await;

        assert_eq!(finished.status, JobStatus::Completed, "breaks_at={breaks_at}");
        assert_eq!(
            finished.culprit_sha.as_deref(),
            Some(builder.shas[breaks_at].as_str()),
            "breaks_at={breaks_at}"
        );
    }
}

#[tokio::test]
async fn equal_endpoints_are_inconsistent() {
    let repo = breaking_history();
    let h = harness(repo.path_url());

    let job = h
        .submit_and_claim(&repo.shas[2], &repo.shas[2], "sh test.sh")
        .await;
    let finished = h.run(job, Duration::from_secs(60)).await;

    assert_eq!(finished.status, JobStatus::Failed);
    assert_eq!(
        finished.error_message.as_deref(),
        Some("endpoints inconsistent")
    );
}

#[tokio::test]
async fn passing_bad_endpoint_is_inconsistent() {
    let repo = breaking_history();
    let h = harness(repo.path_url());

    // Both endpoints sit before the break, so the "bad" one still passes.
    let job = h
        .submit_and_claim(&repo.shas[0], &repo.shas[2], "sh test.sh")
        .await;
    let finished = h.run(job, Duration::from_secs(60)).await;

    assert_eq!(finished.status, JobStatus::Failed);
    assert_eq!(
        finished.error_message.as_deref(),
        Some("endpoints inconsistent")
    );
}

#[tokio::test]
async fn failing_good_endpoint_is_inconsistent() {
    let repo = breaking_history();
    let h = harness(repo.path_url());

    let job = h
        .submit_and_claim(&repo.shas[3], &repo.shas[5], "sh test.sh")
        .await;
    let finished = h.run(job, Duration::from_secs(60)).await;

    assert_eq!(finished.status, JobStatus::Failed);
    assert_eq!(
        finished.error_message.as_deref(),
        Some("endpoints inconsistent")
    );
}

#[tokio::test]
async fn all_skip_middles_are_an_untestable_range() {
    let mut builder = GitRepoBuilder::init();
    // Good endpoint passes.
    builder.write("test.sh", "#!/bin/sh\nexit 0\n");
    builder.commit("known good");
    // Every intermediate commit refuses to be tested.
    for index in 1..=4 {
        builder.write("test.sh", "#!/bin/sh\nexit 125\n");
        builder.write(&format!("file_{index}.txt"), "content");
        builder.commit(&format!("untestable {index}"));
    }
    // Bad endpoint fails.
    builder.write("test.sh", "#!/bin/sh\nexit 1\n");
    builder.commit("known bad");

    let h = harness(builder.path_url());
    let job = h
        .submit_and_claim(&builder.shas[0], &builder.shas[5], "sh test.sh")
        .await;
    let finished = h.run(job, Duration::from_secs(120)).await;

    assert_eq!(finished.status, JobStatus::Failed);
    assert_eq!(finished.error_message.as_deref(), Some("untestable range"));
    assert!(finished.progress_log.contains("skip"));
}

#[tokio::test]
async fn budget_expiry_fails_with_wall_clock_timeout() {
    let mut builder = GitRepoBuilder::init();
    builder.write("test.sh", "#!/bin/sh\nexit 0\n");
    builder.commit("fast good");
    for index in 1..=4 {
        // Middles hang far beyond the budget.
        builder.write("test.sh", "#!/bin/sh\nsleep 30\nexit 0\n");
        builder.write(&format!("file_{index}.txt"), "content");
        builder.commit(&format!("slow {index}"));
    }
    builder.write("test.sh", "#!/bin/sh\nexit 1\n");
    builder.commit("fast bad");

    let h = harness(builder.path_url());
    let job = h
        .submit_and_claim(&builder.shas[0], &builder.shas[5], "sh test.sh")
        .await;
    let finished = h.run(job, Duration::from_secs(2)).await;

    assert_eq!(finished.status, JobStatus::Failed);
    assert_eq!(finished.error_message.as_deref(), Some("wall-clock timeout"));
}

#[tokio::test]
async fn reclaimed_job_completes_on_its_second_attempt() {
    let repo = breaking_history();
    let h = harness(repo.path_url());

    let spec = JobSpec {
        repo_owner: "octocat".to_owned(),
        repo_name: "spoon-knife".to_owned(),
        installation_id: 42,
        issue_number: 7,
        requester: "octocat".to_owned(),
        good_sha: repo.shas[2].clone(),
        bad_sha: repo.shas[5].clone(),
        test_command: "sh test.sh".to_owned(),
    };
    let id = h.store.create(spec).await.unwrap();

    // First attempt dies without a trace (a crashed instance).
    let ghost = WorkerId::from("ghost".to_owned());
    assert_eq!(h.store.claim(&ghost, 1).await.unwrap().len(), 1);
    h.store.backdate_heartbeat(id, chrono::TimeDelta::minutes(6));

    let mut reclaimed = h.store.claim(&h.worker, 1).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    let job = reclaimed.remove(0);
    assert_eq!(job.attempt_count, 2);

    let finished = h.run(job, Duration::from_secs(120)).await;
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.culprit_sha.as_deref(), Some(repo.shas[3].as_str()));
    assert_eq!(finished.attempt_count, 2);
}

#[tokio::test]
async fn shutdown_mid_job_releases_instead_of_finishing() {
    let mut builder = GitRepoBuilder::init();
    builder.write("test.sh", "#!/bin/sh\nexit 0\n");
    builder.commit("good");
    for index in 1..=4 {
        builder.write("test.sh", "#!/bin/sh\nsleep 30\nexit 0\n");
        builder.write(&format!("file_{index}.txt"), "content");
        builder.commit(&format!("slow {index}"));
    }
    builder.write("test.sh", "#!/bin/sh\nexit 1\n");
    builder.commit("bad");

    let h = harness(builder.path_url());
    let job = h
        .submit_and_claim(&builder.shas[0], &builder.shas[5], "sh test.sh")
        .await;
    let id = job.id;

    let control = JobControl::unbounded(Duration::from_secs(600));
    let shutdown = control.shutdown.clone();
    let store = h.store.clone();
    let handle = tokio::spawn(async move { h.executor.execute(job, control).await });

    // Let it get into the slow middle probe, then drain.
    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("executor should release promptly on shutdown")
        .unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    // The cooperative handoff refunded the attempt.
    assert_eq!(job.attempt_count, 0);
    assert!(job.worker_id.is_none());
}
