//! The durable `Job` persistence contract.
//!
//! Every method here runs inside a single transaction in a real
//! implementation. `claim`/`heartbeat`/`complete`/`fail_terminal`/`retry`
//! all take the caller's last-observed `version` as an optimistic-locking
//! precondition and return [`QueueError::Conflict`] (or `Ok(false)` for the
//! boolean-returning ones) when another worker already won the race.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::QueueResult;
use crate::job::Job;

/// A freshly-inserted job, not yet claimable until its caller commits.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub job_type: String,
    pub correlation_id: Option<String>,
    pub priority: i32,
    pub payload_blob: Option<Vec<u8>>,
    pub metadata: serde_json::Value,
    pub max_retries: i32,
    pub scheduled_for: DateTime<Utc>,
}

/// Aggregate counts used by `stats()` and the admin health check.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    /// Average wall-clock duration of completed jobs in the rolling window
    /// the store chooses to sample, in milliseconds. `None` if no completed
    /// jobs are in the window.
    pub avg_duration_ms: Option<f64>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Appends a new row. Returns [`crate::error::QueueError::Conflict`]
    /// only if the store rejects a duplicate of the caller-supplied id.
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> QueueResult<Job>;

    /// Bulk variant of [`JobStore::insert`]: all rows commit in a single
    /// transaction or none do.
    async fn insert_batch(&self, jobs: Vec<NewJob>, now: DateTime<Utc>) -> QueueResult<Vec<Job>>;

    /// Read-only shortlist of candidate jobs:
    /// `status = Pending AND scheduled_for <= now`, ordered by
    /// `(priority DESC, created_at ASC)`, limited to `limit` rows. Must not
    /// lock or mutate rows; callers follow up with [`JobStore::claim`].
    async fn find_due(&self, now: DateTime<Utc>, limit: i64) -> QueueResult<Vec<Job>>;

    /// Atomically claims one job if it is still `Pending` at `expected_version`.
    /// Returns `Ok(None)` if another worker already won (lost the race).
    async fn claim(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        expected_version: i64,
    ) -> QueueResult<Option<Job>>;

    /// Refreshes `heartbeat_at` only if the job is still `Processing` and
    /// assigned to `worker_id`. Returns whether the row was owned by the
    /// caller and the refresh applied; also returns whether cancellation
    /// was requested, so the worker can observe it at the same round-trip.
    async fn heartbeat(&self, id: Uuid, worker_id: &str, now: DateTime<Utc>) -> QueueResult<HeartbeatOutcome>;

    /// `Processing -> Completed`. `result_metadata`, if given, is merged
    /// (shallow, key-by-key) into the job's existing `metadata` object.
    async fn complete(
        &self,
        id: Uuid,
        expected_version: i64,
        now: DateTime<Utc>,
        result_metadata: Option<serde_json::Value>,
    ) -> QueueResult<bool>;

    /// `Processing -> Failed`, terminal.
    async fn fail_terminal(
        &self,
        id: Uuid,
        expected_version: i64,
        reason: &str,
        detail: Option<&str>,
        now: DateTime<Utc>,
    ) -> QueueResult<bool>;

    /// `Processing -> Pending` retry reset: clears assignment, bumps
    /// `retry_count`, reschedules `scheduled_for`.
    async fn retry(
        &self,
        id: Uuid,
        expected_version: i64,
        next_schedule: DateTime<Utc>,
        reason: &str,
        detail: Option<&str>,
        now: DateTime<Utc>,
    ) -> QueueResult<bool>;

    /// `Pending -> Cancelled` directly, or flags a `Processing` job for
    /// cooperative cancellation (the worker observes it on its next
    /// heartbeat and aborts). Returns `false` if the job is already terminal.
    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> QueueResult<bool>;

    /// Jobs `Processing` with `heartbeat_at < now - stale_after`.
    async fn find_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> QueueResult<Vec<Job>>;

    /// Fetches a single job by id.
    async fn get(&self, id: Uuid) -> QueueResult<Option<Job>>;

    /// Paginated read by status, newest first.
    async fn list_by_status(
        &self,
        status: crate::job::JobStatus,
        page: crate::dead_letter::Page,
    ) -> QueueResult<Vec<Job>>;

    /// The single longest-waiting `Pending` job, oldest `created_at` first.
    /// Used by the admin health check; unlike [`JobStore::list_by_status`]
    /// (newest first) this is ordered ascending.
    async fn oldest_pending(&self) -> QueueResult<Option<Job>>;

    /// All jobs sharing a correlation id.
    async fn list_by_correlation(&self, correlation_id: &str) -> QueueResult<Vec<Job>>;

    /// Aggregate counts, optionally filtered to one job type.
    async fn stats(&self, job_type: Option<&str>) -> QueueResult<QueueStats>;

    /// Deletes `Completed` rows with `completed_at < before`. Returns the
    /// number of rows removed.
    async fn cleanup(&self, before: DateTime<Utc>) -> QueueResult<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatOutcome {
    /// `true` if the row was `Processing` and owned by `worker_id` (and so
    /// the heartbeat actually applied).
    pub accepted: bool,
    /// `true` if a cooperative cancellation was flagged on this job.
    pub cancel_requested: bool,
    /// The row's `version` after this call, whether or not it changed.
    /// Callers holding a job from `claim()` use this to keep their
    /// `expected_version` precondition current across repeated heartbeats.
    pub version: i64,
}
