//! PostgreSQL-backed implementations of `jobforge_core`'s storage traits.
//!
//! # Database schema
//!
//! See `schema.sql` (embedded and applied by [`run_schema`]): a `jobs` table
//! with `FOR UPDATE SKIP LOCKED` claiming, a `dead_letters` archive, and a
//! `process_trackers` mirror with a database-level conservation check.
//!
//! # Usage
//!
//! ```rust,ignore
//! use jobforge_postgres::{run_schema, PgJobStore, PgDeadLetterStore, PgTrackerStore};
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/jobforge").await?;
//! run_schema(&pool).await?;
//! let store = PgJobStore::new(pool.clone());
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jobforge_core::dead_letter::{DeadLetter, DeadLetterStore, Page};
use jobforge_core::error::{QueueError, QueueResult};
use jobforge_core::job::{Job, JobStatus};
use jobforge_core::store::{HeartbeatOutcome, JobStore, NewJob, QueueStats};
use jobforge_core::tracker::{ProcessTracker, TrackerStatus, TrackerStore};
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

fn internal(err: sqlx::Error) -> QueueError {
    QueueError::Internal(err.into())
}

/// Applies `schema.sql` (idempotent: every statement is `IF NOT EXISTS` or
/// guards against `duplicate_object`). Safe to call on every process start.
pub async fn run_schema(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::raw_sql(include_str!("../schema.sql")).execute(pool).await?;
    info!("applied jobforge schema");
    Ok(())
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    Ok(Job {
        id: row.try_get("id")?,
        job_type: row.try_get("job_type")?,
        correlation_id: row.try_get("correlation_id")?,
        status: parse_job_status(&status_str),
        priority: row.try_get("priority")?,
        payload_blob: row.try_get("payload_blob")?,
        metadata: row.try_get("metadata")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        error_message: row.try_get("error_message")?,
        error_detail: row.try_get("error_detail")?,
        created_at: row.try_get("created_at")?,
        scheduled_for: row.try_get("scheduled_for")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        updated_at: row.try_get("updated_at")?,
        assigned_to: row.try_get("assigned_to")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        version: row.try_get("version")?,
        cancel_requested: row.try_get("cancel_requested")?,
    })
}

fn job_status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Processing => "processing",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

fn parse_job_status(s: &str) -> JobStatus {
    match s {
        "pending" => JobStatus::Pending,
        "processing" => JobStatus::Processing,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        other => unreachable!("unknown job_status in database row: {other:?}"),
    }
}

/// A `JobStore` backed by a Postgres `jobs` table. Every optimistic-locking
/// transition is a single `UPDATE ... WHERE version = $expected` statement;
/// an unmatched row count means the caller lost the race, not an error.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> QueueResult<Job> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, job_type, correlation_id, status, priority, payload_blob,
                metadata, retry_count, max_retries, created_at, scheduled_for,
                updated_at, version, cancel_requested
            )
            VALUES ($1, $2, $3, 'pending', $4, $5, $6, 0, $7, $8, $9, $8, 1, false)
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(&job.correlation_id)
        .bind(job.priority)
        .bind(&job.payload_blob)
        .bind(&job.metadata)
        .bind(job.max_retries)
        .bind(now)
        .bind(job.scheduled_for)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => QueueError::Conflict,
            _ => internal(err),
        })?;

        row_to_job(&row).map_err(internal)
    }

    async fn insert_batch(&self, jobs: Vec<NewJob>, now: DateTime<Utc>) -> QueueResult<Vec<Job>> {
        let mut tx = self.pool.begin().await.map_err(internal)?;
        let mut inserted = Vec::with_capacity(jobs.len());
        for job in jobs {
            let row = sqlx::query(
                r#"
                INSERT INTO jobs (
                    id, job_type, correlation_id, status, priority, payload_blob,
                    metadata, retry_count, max_retries, created_at, scheduled_for,
                    updated_at, version, cancel_requested
                )
                VALUES ($1, $2, $3, 'pending', $4, $5, $6, 0, $7, $8, $9, $8, 1, false)
                RETURNING *
                "#,
            )
            .bind(job.id)
            .bind(&job.job_type)
            .bind(&job.correlation_id)
            .bind(job.priority)
            .bind(&job.payload_blob)
            .bind(&job.metadata)
            .bind(job.max_retries)
            .bind(now)
            .bind(job.scheduled_for)
            .fetch_one(&mut *tx)
            .await
            .map_err(|err| match &err {
                sqlx::Error::Database(db_err) if db_err.is_unique_violation() => QueueError::Conflict,
                _ => internal(err),
            })?;
            inserted.push(row_to_job(&row).map_err(internal)?);
        }
        tx.commit().await.map_err(internal)?;
        Ok(inserted)
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: i64) -> QueueResult<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE status = 'pending' AND scheduled_for <= $1
            ORDER BY priority DESC, created_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;

        rows.iter().map(|r| row_to_job(r).map_err(internal)).collect()
    }

    async fn claim(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        expected_version: i64,
    ) -> QueueResult<Option<Job>> {
        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id FROM jobs
                WHERE id = $1 AND status = 'pending' AND version = $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'processing',
                assigned_to = $3,
                started_at = $4,
                heartbeat_at = $4,
                updated_at = $4,
                version = version + 1
            WHERE id IN (SELECT id FROM claimable)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;

        if row.is_none() {
            debug!(job_id = %id, worker_id, "claim lost the race");
        }
        row.as_ref().map(row_to_job).transpose().map_err(internal)
    }

    async fn heartbeat(&self, id: Uuid, worker_id: &str, now: DateTime<Utc>) -> QueueResult<HeartbeatOutcome> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET heartbeat_at = $3, updated_at = $3, version = version + 1
            WHERE id = $1 AND status = 'processing' AND assigned_to = $2
            RETURNING version, cancel_requested
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;

        match row {
            Some(row) => Ok(HeartbeatOutcome {
                accepted: true,
                cancel_requested: row.try_get("cancel_requested").map_err(internal)?,
                version: row.try_get("version").map_err(internal)?,
            }),
            None => {
                let current = sqlx::query("SELECT version, cancel_requested FROM jobs WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(internal)?;
                match current {
                    Some(row) => Ok(HeartbeatOutcome {
                        accepted: false,
                        cancel_requested: row.try_get("cancel_requested").map_err(internal)?,
                        version: row.try_get("version").map_err(internal)?,
                    }),
                    None => Ok(HeartbeatOutcome {
                        accepted: false,
                        cancel_requested: false,
                        version: 0,
                    }),
                }
            }
        }
    }

    async fn complete(
        &self,
        id: Uuid,
        expected_version: i64,
        now: DateTime<Utc>,
        result_metadata: Option<serde_json::Value>,
    ) -> QueueResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', completed_at = $3, updated_at = $3,
                heartbeat_at = NULL, version = version + 1,
                metadata = metadata || COALESCE($4, '{}'::jsonb)
            WHERE id = $1 AND status = 'processing' AND version = $2
            "#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(now)
        .bind(result_metadata)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_terminal(
        &self,
        id: Uuid,
        expected_version: i64,
        reason: &str,
        detail: Option<&str>,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let status = if reason == "cancelled" { "cancelled" } else { "failed" };
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $4::job_status, error_message = $5, error_detail = $6,
                completed_at = $3, updated_at = $3, version = version + 1
            WHERE id = $1 AND status = 'processing' AND version = $2
            "#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(now)
        .bind(status)
        .bind(reason)
        .bind(detail)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected() == 1)
    }

    async fn retry(
        &self,
        id: Uuid,
        expected_version: i64,
        next_schedule: DateTime<Utc>,
        reason: &str,
        detail: Option<&str>,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', assigned_to = NULL, started_at = NULL,
                heartbeat_at = NULL, retry_count = retry_count + 1,
                scheduled_for = $3, error_message = $4, error_detail = $5,
                updated_at = $6, version = version + 1
            WHERE id = $1 AND status = 'processing' AND version = $2
            "#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(next_schedule)
        .bind(reason)
        .bind(detail)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected() == 1)
    }

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> QueueResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = CASE WHEN status = 'pending' THEN 'cancelled'::job_status ELSE status END,
                cancel_requested = CASE WHEN status = 'processing' THEN true ELSE cancel_requested END,
                completed_at = CASE WHEN status = 'pending' THEN $2 ELSE completed_at END,
                updated_at = $2,
                version = version + 1
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> QueueResult<Vec<Job>> {
        let threshold = now - stale_after;
        let rows = sqlx::query("SELECT * FROM jobs WHERE status = 'processing' AND heartbeat_at < $1")
            .bind(threshold)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        rows.iter().map(|r| row_to_job(r).map_err(internal)).collect()
    }

    async fn get(&self, id: Uuid) -> QueueResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        row.as_ref().map(row_to_job).transpose().map_err(internal)
    }

    async fn list_by_status(&self, status: JobStatus, page: Page) -> QueueResult<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs WHERE status = $1::job_status
            ORDER BY created_at DESC
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(job_status_str(status))
        .bind(page.offset)
        .bind(page.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.iter().map(|r| row_to_job(r).map_err(internal)).collect()
    }

    async fn list_by_correlation(&self, correlation_id: &str) -> QueueResult<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE correlation_id = $1 ORDER BY created_at ASC")
            .bind(correlation_id)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        rows.iter().map(|r| row_to_job(r).map_err(internal)).collect()
    }

    async fn oldest_pending(&self) -> QueueResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        row.as_ref().map(row_to_job).transpose().map_err(internal)
    }

    async fn stats(&self, job_type: Option<&str>) -> QueueResult<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled,
                AVG(EXTRACT(EPOCH FROM (completed_at - started_at)) * 1000.0)
                    FILTER (WHERE status = 'completed') AS avg_duration_ms
            FROM jobs
            WHERE $1::text IS NULL OR job_type = $1
            "#,
        )
        .bind(job_type)
        .fetch_one(&self.pool)
        .await
        .map_err(internal)?;

        Ok(QueueStats {
            pending: row.try_get("pending").map_err(internal)?,
            processing: row.try_get("processing").map_err(internal)?,
            completed: row.try_get("completed").map_err(internal)?,
            failed: row.try_get("failed").map_err(internal)?,
            cancelled: row.try_get("cancelled").map_err(internal)?,
            avg_duration_ms: row.try_get("avg_duration_ms").map_err(internal)?,
        })
    }

    async fn cleanup(&self, before: DateTime<Utc>) -> QueueResult<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE status = 'completed' AND completed_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, "cleaned up completed jobs");
        }
        Ok(deleted)
    }
}

/// A `DeadLetterStore` backed by Postgres.
#[derive(Clone)]
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_dead_letter(row: &sqlx::postgres::PgRow) -> Result<DeadLetter, sqlx::Error> {
    Ok(DeadLetter {
        id: row.try_get("id")?,
        original_job_id: row.try_get("original_job_id")?,
        job_type: row.try_get("job_type")?,
        failed_at: row.try_get("failed_at")?,
        failure_reason: row.try_get("failure_reason")?,
        job_snapshot: row.try_get("job_snapshot")?,
        retry_attempts: row.try_get("retry_attempts")?,
        resolved: row.try_get("resolved")?,
        resolved_at: row.try_get("resolved_at")?,
        resolved_by: row.try_get("resolved_by")?,
        resolution_notes: row.try_get("resolution_notes")?,
    })
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn insert(&self, record: &DeadLetter) -> QueueResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters (
                id, original_job_id, job_type, failed_at, failure_reason,
                job_snapshot, retry_attempts, resolved
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, false)
            "#,
        )
        .bind(record.id)
        .bind(record.original_job_id)
        .bind(&record.job_type)
        .bind(record.failed_at)
        .bind(&record.failure_reason)
        .bind(&record.job_snapshot)
        .bind(record.retry_attempts)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> QueueResult<Option<DeadLetter>> {
        let row = sqlx::query("SELECT * FROM dead_letters WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        row.as_ref().map(row_to_dead_letter).transpose().map_err(internal)
    }

    async fn list_unresolved(&self, page: Page) -> QueueResult<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT * FROM dead_letters WHERE NOT resolved ORDER BY failed_at DESC OFFSET $1 LIMIT $2",
        )
        .bind(page.offset)
        .bind(page.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.iter().map(|r| row_to_dead_letter(r).map_err(internal)).collect()
    }
}

/// A `TrackerStore` backed by Postgres. `record_success`/`record_failure`
/// use a single `UPDATE ... RETURNING` so the increment-then-reconcile
/// sequence is atomic even under concurrent writers for the same tracker.
#[derive(Clone)]
pub struct PgTrackerStore {
    pool: PgPool,
}

impl PgTrackerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_tracker(row: &sqlx::postgres::PgRow) -> Result<ProcessTracker, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    Ok(ProcessTracker {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        correlation_id: row.try_get("correlation_id")?,
        status: parse_tracker_status(&status_str),
        total_files: row.try_get("total_files")?,
        processed_files: row.try_get("processed_files")?,
        failed_files: row.try_get("failed_files")?,
        message: row.try_get("message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn tracker_status_str(status: TrackerStatus) -> &'static str {
    match status {
        TrackerStatus::Initiated => "initiated",
        TrackerStatus::InProgress => "in_progress",
        TrackerStatus::Completed => "completed",
        TrackerStatus::Failed => "failed",
    }
}

fn parse_tracker_status(s: &str) -> TrackerStatus {
    match s {
        "initiated" => TrackerStatus::Initiated,
        "in_progress" => TrackerStatus::InProgress,
        "completed" => TrackerStatus::Completed,
        "failed" => TrackerStatus::Failed,
        other => unreachable!("unknown tracker_status in database row: {other:?}"),
    }
}

#[async_trait]
impl TrackerStore for PgTrackerStore {
    async fn get(&self, id: Uuid) -> QueueResult<Option<ProcessTracker>> {
        let row = sqlx::query("SELECT * FROM process_trackers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        row.as_ref().map(row_to_tracker).transpose().map_err(internal)
    }

    async fn upsert(&self, tracker: &ProcessTracker) -> QueueResult<()> {
        sqlx::query(
            r#"
            INSERT INTO process_trackers (
                id, job_id, correlation_id, status, total_files, processed_files,
                failed_files, message, created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4::tracker_status, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                total_files = EXCLUDED.total_files,
                processed_files = EXCLUDED.processed_files,
                failed_files = EXCLUDED.failed_files,
                message = EXCLUDED.message,
                updated_at = EXCLUDED.updated_at,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(tracker.id)
        .bind(tracker.job_id)
        .bind(&tracker.correlation_id)
        .bind(tracker_status_str(tracker.status))
        .bind(tracker.total_files)
        .bind(tracker.processed_files)
        .bind(tracker.failed_files)
        .bind(&tracker.message)
        .bind(tracker.created_at)
        .bind(tracker.updated_at)
        .bind(tracker.completed_at)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn record_success(&self, id: Uuid, now: DateTime<Utc>) -> QueueResult<Option<ProcessTracker>> {
        self.record_outcome(id, now, true, "processed one more file").await
    }

    async fn record_failure(&self, id: Uuid, now: DateTime<Utc>) -> QueueResult<Option<ProcessTracker>> {
        self.record_outcome(id, now, false, "one file failed").await
    }
}

impl PgTrackerStore {
    async fn record_outcome(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        success: bool,
        message: &str,
    ) -> QueueResult<Option<ProcessTracker>> {
        let row = sqlx::query(
            r#"
            UPDATE process_trackers
            SET processed_files = processed_files + CASE WHEN $2 THEN 1 ELSE 0 END,
                failed_files = failed_files + CASE WHEN $2 THEN 0 ELSE 1 END,
                updated_at = $3,
                message = $4,
                status = CASE
                    WHEN (processed_files + CASE WHEN $2 THEN 1 ELSE 0 END
                          + failed_files + CASE WHEN $2 THEN 0 ELSE 1 END) >= total_files
                    THEN CASE WHEN (failed_files + CASE WHEN $2 THEN 0 ELSE 1 END) > 0
                              THEN 'failed'::tracker_status
                              ELSE 'completed'::tracker_status
                         END
                    ELSE 'in_progress'::tracker_status
                END,
                completed_at = CASE
                    WHEN (processed_files + CASE WHEN $2 THEN 1 ELSE 0 END
                          + failed_files + CASE WHEN $2 THEN 0 ELSE 1 END) >= total_files
                    THEN $3
                    ELSE completed_at
                END
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(success)
        .bind(now)
        .bind(message)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;

        row.as_ref().map(row_to_tracker).transpose().map_err(internal)
    }
}
