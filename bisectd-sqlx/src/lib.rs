//! Postgres implementation of [`bisectd::store::JobStore`].
//!
//! The claim is the part that earns its keep: an `UPDATE ... WHERE id IN
//! (SELECT ... FOR UPDATE SKIP LOCKED) RETURNING` so that concurrent claimers
//! on other instances skip each other's rows instead of serializing on them,
//! and a contested row is won by exactly one caller.
//!
//! Queries use sqlx's runtime API rather than the compile-time macros so the
//! workspace builds without a live database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;

use bisectd::job::{Job, JobId, JobOutcome, JobSpec, JobStatus, WorkerId, MAX_ATTEMPTS};
use bisectd::store::{
    ClaimTimings, JobStore, StatusCounts, StoreError, RETRY_LIMIT_REASON,
};

const JOB_COLUMNS: &str = "id, status, repo_owner, repo_name, installation_id, issue_number, \
     requester, good_sha, bad_sha, test_command, worker_id, attempt_count, \
     created_at, started_at, heartbeat_at, finished_at, culprit_sha, \
     error_message, progress_log";

/// Idempotent schema bootstrap, run once at connect. The store owns its
/// schema; nothing else writes this table.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS bisect_jobs (
        id BIGSERIAL PRIMARY KEY,
        status TEXT NOT NULL DEFAULT 'pending',
        repo_owner TEXT NOT NULL,
        repo_name TEXT NOT NULL,
        installation_id BIGINT NOT NULL,
        issue_number BIGINT NOT NULL,
        requester TEXT NOT NULL,
        good_sha TEXT NOT NULL,
        bad_sha TEXT NOT NULL,
        test_command TEXT NOT NULL,
        worker_id TEXT,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        started_at TIMESTAMPTZ,
        heartbeat_at TIMESTAMPTZ,
        finished_at TIMESTAMPTZ,
        culprit_sha TEXT,
        error_message TEXT,
        progress_log TEXT NOT NULL DEFAULT ''
    )",
    "CREATE INDEX IF NOT EXISTS bisect_jobs_claim_idx
        ON bisect_jobs (status, id)",
    "CREATE INDEX IF NOT EXISTS bisect_jobs_dedup_idx
        ON bisect_jobs (installation_id, issue_number, created_at)",
];

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    timings: ClaimTimings,
}

#[derive(FromRow)]
struct JobRow {
    id: i64,
    status: String,
    repo_owner: String,
    repo_name: String,
    installation_id: i64,
    issue_number: i64,
    requester: String,
    good_sha: String,
    bad_sha: String,
    test_command: String,
    worker_id: Option<String>,
    attempt_count: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    culprit_sha: Option<String>,
    error_message: Option<String>,
    progress_log: String,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status).ok_or(StoreError::BadState)?;
        Ok(Job {
            id: row.id.into(),
            status,
            repo_owner: row.repo_owner,
            repo_name: row.repo_name,
            installation_id: row.installation_id,
            issue_number: row.issue_number,
            requester: row.requester,
            good_sha: row.good_sha,
            bad_sha: row.bad_sha,
            test_command: row.test_command,
            worker_id: row.worker_id.map(WorkerId::from),
            attempt_count: row.attempt_count,
            created_at: row.created_at,
            started_at: row.started_at,
            heartbeat_at: row.heartbeat_at,
            finished_at: row.finished_at,
            culprit_sha: row.culprit_sha,
            error_message: row.error_message,
            progress_log: row.progress_log,
        })
    }
}

fn map_err(error: sqlx::Error) -> StoreError {
    StoreError::Unavailable(error.to_string())
}

impl PgJobStore {
    /// Connects, bounds the pool, and runs the schema bootstrap.
    pub async fn connect(database_url: &str, timings: ClaimTimings) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(map_err)?;
        let store = Self::new(pool, timings);
        store.migrate().await?;
        Ok(store)
    }

    pub fn new(pool: PgPool, timings: ClaimTimings) -> Self {
        Self { pool, timings }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }

    /// `true` when exactly one row changed, `false` when the guard refused;
    /// distinguishes a missing row so callers can report it.
    async fn guarded_update(
        &self,
        id: JobId,
        result: sqlx::Result<sqlx::postgres::PgQueryResult>,
    ) -> Result<bool, StoreError> {
        match result.map_err(map_err)?.rows_affected() {
            1 => Ok(true),
            0 => {
                let exists: bool =
                    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM bisect_jobs WHERE id = $1)")
                        .bind(i64::from(id))
                        .fetch_one(&self.pool)
                        .await
                        .map_err(map_err)?;
                if exists {
                    Ok(false)
                } else {
                    Err(StoreError::JobNotFound(id))
                }
            }
            _ => Err(StoreError::BadState),
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, spec: JobSpec) -> Result<JobId, StoreError> {
        // One statement so a replayed delivery cannot race its original
        // between a select and an insert on the same connection.
        let sql = "WITH existing AS (
                SELECT id FROM bisect_jobs
                WHERE installation_id = $1 AND issue_number = $2
                  AND good_sha = $3 AND bad_sha = $4
                  AND test_command = $5 AND requester = $6
                  AND created_at > now() - ($7::float8 * interval '1 second')
                ORDER BY id
                LIMIT 1
            ), inserted AS (
                INSERT INTO bisect_jobs (
                    installation_id, issue_number, good_sha, bad_sha,
                    test_command, requester, repo_owner, repo_name
                )
                SELECT $1, $2, $3, $4, $5, $6, $8, $9
                WHERE NOT EXISTS (SELECT 1 FROM existing)
                RETURNING id
            )
            SELECT id FROM existing UNION ALL SELECT id FROM inserted";
        let id: i64 = sqlx::query_scalar(sql)
            .bind(spec.installation_id)
            .bind(spec.issue_number)
            .bind(&spec.good_sha)
            .bind(&spec.bad_sha)
            .bind(&spec.test_command)
            .bind(&spec.requester)
            .bind(self.timings.dedup_window.as_secs_f64())
            .bind(&spec.repo_owner)
            .bind(&spec.repo_name)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(id.into())
    }

    async fn claim(&self, worker: &WorkerId, limit: u32) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "UPDATE bisect_jobs SET
                status = 'running',
                worker_id = $1,
                attempt_count = attempt_count + 1,
                started_at = COALESCE(started_at, now()),
                heartbeat_at = now()
            WHERE id IN (
                SELECT id FROM bisect_jobs
                WHERE (status = 'pending'
                       AND created_at <= now() - ($3::float8 * interval '1 second'))
                   OR (status = 'running'
                       AND heartbeat_at < now() - ($4::float8 * interval '1 second'))
                ORDER BY id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(worker.as_str())
            .bind(limit as i64)
            .bind(self.timings.pending_grace.as_secs_f64())
            .bind(self.timings.heartbeat_stale.as_secs_f64())
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;

        let mut jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING order is unspecified; claims are FIFO by id.
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }

    async fn heartbeat(&self, id: JobId, worker: &WorkerId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE bisect_jobs SET heartbeat_at = now()
             WHERE id = $1 AND status = 'running' AND worker_id = $2",
        )
        .bind(i64::from(id))
        .bind(worker.as_str())
        .execute(&self.pool)
        .await;
        self.guarded_update(id, result).await
    }

    async fn finish(
        &self,
        id: JobId,
        worker: &WorkerId,
        outcome: JobOutcome,
    ) -> Result<bool, StoreError> {
        let status = outcome.status();
        let (culprit_sha, error_message) = match outcome {
            JobOutcome::Completed { culprit_sha } => (Some(culprit_sha), None),
            JobOutcome::Failed { reason } => (None, Some(reason)),
            JobOutcome::Cancelled => (None, None),
        };
        let result = sqlx::query(
            "UPDATE bisect_jobs SET
                status = $3,
                finished_at = now(),
                culprit_sha = $4,
                error_message = $5
             WHERE id = $1 AND status = 'running' AND worker_id = $2",
        )
        .bind(i64::from(id))
        .bind(worker.as_str())
        .bind(status.as_str())
        .bind(culprit_sha)
        .bind(error_message)
        .execute(&self.pool)
        .await;
        self.guarded_update(id, result).await
    }

    async fn release(&self, id: JobId, worker: &WorkerId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE bisect_jobs SET
                status = 'pending',
                worker_id = NULL,
                started_at = NULL,
                heartbeat_at = NULL,
                attempt_count = attempt_count - 1
             WHERE id = $1 AND status = 'running' AND worker_id = $2",
        )
        .bind(i64::from(id))
        .bind(worker.as_str())
        .execute(&self.pool)
        .await;
        self.guarded_update(id, result).await
    }

    async fn fail_if_exhausted(&self, id: JobId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE bisect_jobs SET
                status = 'failed',
                error_message = $2,
                finished_at = now(),
                attempt_count = $3
             WHERE id = $1 AND attempt_count > $3
               AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(i64::from(id))
        .bind(RETRY_LIMIT_REASON)
        .bind(MAX_ATTEMPTS)
        .execute(&self.pool)
        .await;
        self.guarded_update(id, result).await
    }

    async fn append_progress(
        &self,
        id: JobId,
        worker: &WorkerId,
        line: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE bisect_jobs
             SET progress_log = progress_log || $3 || E'\\n'
             WHERE id = $1 AND status = 'running' AND worker_id = $2",
        )
        .bind(i64::from(id))
        .bind(worker.as_str())
        .bind(line)
        .execute(&self.pool)
        .await;
        self.guarded_update(id, result).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM bisect_jobs WHERE id = $1");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(i64::from(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        row.map(Job::try_from).transpose()
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM bisect_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(map_err)?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => counts.pending = count,
                Some(JobStatus::Running) => counts.running = count,
                Some(JobStatus::Completed) => counts.completed = count,
                Some(JobStatus::Failed) => counts.failed = count,
                Some(JobStatus::Cancelled) => counts.cancelled = count,
                None => return Err(StoreError::BadState),
            }
        }
        Ok(counts)
    }

    async fn owned_running(&self, worker: &WorkerId) -> Result<i64, StoreError> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM bisect_jobs WHERE status = 'running' AND worker_id = $1",
        )
        .bind(worker.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }
}
