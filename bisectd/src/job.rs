use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of times a job may be claimed before it is failed with
/// "retry limit exceeded".
pub const MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one instance-lifetime, used for ownership checks on running
/// jobs. Derived once at startup and never reused across restarts, so rows
/// left behind by a crashed process are unambiguously stale.
#[derive(Debug, Eq, PartialEq, Clone, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Builds the `{hostname}-{pid}-{start time}` identity for this process.
    pub fn for_this_process() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_owned());
        Self(format!(
            "{host}-{}-{}",
            std::process::id(),
            Utc::now().timestamp()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to create a job row. Fields arrive validated from the
/// ingress (see [`crate::command`] and [`crate::security`]).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct JobSpec {
    pub repo_owner: String,
    pub repo_name: String,
    pub installation_id: i64,
    pub issue_number: i64,
    pub requester: String,
    pub good_sha: String,
    pub bad_sha: String,
    pub test_command: String,
}

impl JobSpec {
    /// The tuple that identifies a delivery for deduplication purposes.
    pub fn dedup_key(&self) -> (i64, i64, &str, &str, &str, &str) {
        (
            self.installation_id,
            self.issue_number,
            &self.good_sha,
            &self.bad_sha,
            &self.test_command,
            &self.requester,
        )
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub repo_owner: String,
    pub repo_name: String,
    pub installation_id: i64,
    pub issue_number: i64,
    pub requester: String,
    pub good_sha: String,
    pub bad_sha: String,
    pub test_command: String,
    pub worker_id: Option<WorkerId>,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub culprit_sha: Option<String>,
    pub error_message: Option<String>,
    pub progress_log: String,
}

impl Job {
    pub fn repo_slug(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_name)
    }

    /// True once the claim increment has pushed this job past its retry
    /// budget; such a job must be failed, never executed.
    pub fn retries_exhausted(&self) -> bool {
        self.attempt_count > MAX_ATTEMPTS
    }
}

/// Terminal state written through [`crate::store::JobStore::finish`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum JobOutcome {
    Completed { culprit_sha: String },
    Failed { reason: String },
    Cancelled,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed { .. } => JobStatus::Completed,
            JobOutcome::Failed { .. } => JobStatus::Failed,
            JobOutcome::Cancelled => JobStatus::Cancelled,
        }
    }
}
