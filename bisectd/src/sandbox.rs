//! Isolated execution of one test command against one worktree.
//!
//! The executor only ever sees the [`Sandbox`] trait and the tri-valued
//! [`Verdict`]; which backend provides the isolation is wiring. The docker
//! backend is the production one. The process backend runs the command
//! directly with no isolation at all and exists for tests and trusted local
//! use only.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

/// Exit code reserved by the git bisect protocol for "this commit cannot be
/// tested".
pub const SKIP_EXIT_CODE: i32 = 125;

/// The out-of-memory kill shows up as SIGKILL through the container runtime.
const OOM_EXIT_CODE: i32 = 137;

/// Resource limits applied to every probe.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub cpus: u32,
    pub memory: String,
    pub pids: u32,
    /// Wall-clock limit for this probe, derived from the remaining job
    /// budget.
    pub wall_clock: Duration,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory: "2g".to_owned(),
            pids: 256,
            wall_clock: Duration::from_secs(600),
        }
    }
}

/// What one probe told us about one commit.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Verdict {
    Good,
    Bad { exit_code: i32 },
    Skip { reason: String },
}

impl Verdict {
    /// Maps a clean process exit to a verdict, honoring the reserved skip
    /// code and the container runtime's OOM kill.
    fn from_exit(code: Option<i32>, elapsed: Duration) -> Self {
        match code {
            Some(0) => Verdict::Good,
            Some(SKIP_EXIT_CODE) => Verdict::Skip {
                reason: format!("exit code {SKIP_EXIT_CODE} after {:.1}s", elapsed.as_secs_f64()),
            },
            Some(OOM_EXIT_CODE) => Verdict::Skip {
                reason: "killed (possibly out of memory)".to_owned(),
            },
            Some(code) => Verdict::Bad { exit_code: code },
            None => Verdict::Skip {
                reason: "terminated by signal".to_owned(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The runtime itself is unusable; this fails the job rather than the
    /// probe.
    #[error("sandbox runtime unavailable: {0}")]
    RuntimeUnavailable(String),
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Runs `command` against `worktree` under `limits` and classifies the
    /// result. Resource release is guaranteed on every exit path, including
    /// cancellation of the returned future.
    async fn run(
        &self,
        worktree: &Path,
        command: &str,
        limits: &SandboxLimits,
    ) -> Result<Verdict, SandboxError>;

    /// Cheap probe used by the health endpoint.
    async fn available(&self) -> bool;
}

/// Runs probes in hardened throwaway containers.
#[derive(Debug, Clone)]
pub struct DockerSandbox {
    runtime: String,
    image: String,
}

impl DockerSandbox {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            runtime: "docker".to_owned(),
            image: image.into(),
        }
    }

    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }
}

/// The full `run` argument vector, kept as a pure function so the hardening
/// flag set is testable.
fn docker_run_args(
    name: &str,
    worktree: &Path,
    image: &str,
    command: &str,
    limits: &SandboxLimits,
) -> Vec<String> {
    vec![
        "run".to_owned(),
        "--rm".to_owned(),
        format!("--name={name}"),
        "--network=none".to_owned(),
        format!("--cpus={}", limits.cpus),
        format!("--memory={}", limits.memory),
        format!("--pids-limit={}", limits.pids),
        "--read-only".to_owned(),
        "--tmpfs=/tmp:rw,noexec,nosuid,size=512m".to_owned(),
        "--security-opt=no-new-privileges".to_owned(),
        "--cap-drop=ALL".to_owned(),
        "--user=1000:1000".to_owned(),
        format!("-v={}:/workspace:rw", worktree.display()),
        "-w=/workspace".to_owned(),
        "-e=GIT_TERMINAL_PROMPT=0".to_owned(),
        image.to_owned(),
        "sh".to_owned(),
        "-c".to_owned(),
        command.to_owned(),
    ]
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn run(
        &self,
        worktree: &Path,
        command: &str,
        limits: &SandboxLimits,
    ) -> Result<Verdict, SandboxError> {
        let name = format!("bisectd-probe-{}", uuid::Uuid::new_v4().simple());
        let args = docker_run_args(&name, worktree, &self.image, command, limits);

        let started = Instant::now();
        let child = Command::new(&self.runtime)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| SandboxError::RuntimeUnavailable(err.to_string()))?;

        match tokio::time::timeout(limits.wall_clock, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(Verdict::from_exit(output.status.code(), started.elapsed())),
            Ok(Err(err)) => Err(SandboxError::RuntimeUnavailable(err.to_string())),
            Err(_elapsed) => {
                // The client process dies with the dropped future; the
                // container needs an explicit kill.
                let _ = Command::new(&self.runtime)
                    .args(["kill", &name])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                Ok(Verdict::Skip {
                    reason: format!(
                        "probe timed out after {:.0}s",
                        limits.wall_clock.as_secs_f64()
                    ),
                })
            }
        }
    }

    async fn available(&self) -> bool {
        Command::new(&self.runtime)
            .arg("info")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

/// Runs probes directly on the host with no isolation.
///
/// **Not a sandbox.** Only suitable for tests and for operators who trust
/// every test command they will ever receive.
#[derive(Debug, Clone, Default)]
pub struct ProcessSandbox;

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn run(
        &self,
        worktree: &Path,
        command: &str,
        limits: &SandboxLimits,
    ) -> Result<Verdict, SandboxError> {
        let started = Instant::now();
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(worktree)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| SandboxError::RuntimeUnavailable(err.to_string()))?;

        match tokio::time::timeout(limits.wall_clock, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(Verdict::from_exit(output.status.code(), started.elapsed())),
            Ok(Err(err)) => Err(SandboxError::RuntimeUnavailable(err.to_string())),
            Err(_elapsed) => Ok(Verdict::Skip {
                reason: format!(
                    "probe timed out after {:.0}s",
                    limits.wall_clock.as_secs_f64()
                ),
            }),
        }
    }

    async fn available(&self) -> bool {
        true
    }
}
