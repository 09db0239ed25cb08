//! The transactional surface producers, the scheduler, processors, and
//! admins call. Every method is idempotent with respect to repeated
//! invocations on the same id: repeating `mark_completed` on an
//! already-completed job is a no-op returning `false`.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::dead_letter::{DeadLetter, DeadLetterStore};
use crate::error::{QueueError, QueueResult};
use crate::failure::{next_retry_schedule, BackoffConfig};
use crate::job::{Job, DEFAULT_MAX_RETRIES, PRIORITY_MAX, PRIORITY_MIN};
use crate::store::{JobStore, NewJob, QueueStats};
use crate::tracker::TrackerStore;

/// Producer-facing input to [`QueueService::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueSpec {
    pub job_type: String,
    pub payload_blob: Option<Vec<u8>>,
    pub metadata: JsonValue,
    pub priority: Option<i32>,
    pub delay: Option<Duration>,
    pub correlation_id: Option<String>,
    pub max_retries: Option<i32>,
}

impl EnqueueSpec {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            payload_blob: None,
            metadata: JsonValue::Object(Default::default()),
            priority: None,
            delay: None,
            correlation_id: None,
            max_retries: None,
        }
    }

    fn into_new_job(self, id: Uuid, now: DateTime<Utc>) -> QueueResult<NewJob> {
        if self.job_type.trim().is_empty() {
            return Err(QueueError::Validation("job_type must not be empty".into()));
        }
        let priority = self
            .priority
            .unwrap_or(0)
            .clamp(PRIORITY_MIN, PRIORITY_MAX);
        let delay = self.delay.unwrap_or_else(Duration::zero);
        if delay < Duration::zero() {
            return Err(QueueError::Validation("delay must not be negative".into()));
        }
        let max_retries = self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        if max_retries < 0 {
            return Err(QueueError::Validation("max_retries must not be negative".into()));
        }
        Ok(NewJob {
            id,
            job_type: self.job_type,
            correlation_id: self.correlation_id,
            priority,
            payload_blob: self.payload_blob,
            metadata: self.metadata,
            max_retries,
            scheduled_for: now + delay,
        })
    }
}

pub struct QueueService<S, D, T> {
    store: Arc<S>,
    dead_letters: Arc<D>,
    trackers: Arc<T>,
    clock: SharedClock,
    backoff: BackoffConfig,
}

impl<S, D, T> Clone for QueueService<S, D, T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            dead_letters: self.dead_letters.clone(),
            trackers: self.trackers.clone(),
            clock: self.clock.clone(),
            backoff: self.backoff,
        }
    }
}

impl<S, D, T> QueueService<S, D, T>
where
    S: JobStore,
    D: DeadLetterStore,
    T: TrackerStore,
{
    pub fn new(store: Arc<S>, dead_letters: Arc<D>, trackers: Arc<T>, clock: SharedClock) -> Self {
        Self {
            store,
            dead_letters,
            trackers,
            clock,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn enqueue(&self, spec: EnqueueSpec) -> QueueResult<Job> {
        let now = self.clock.now();
        let new_job = spec.into_new_job(Uuid::new_v4(), now)?;
        let job = self.store.insert(new_job, now).await?;
        debug!(job_id = %job.id, job_type = %job.job_type, "enqueued job");
        Ok(job)
    }

    /// All-or-nothing: every spec commits, or none do.
    pub async fn enqueue_batch(&self, specs: Vec<EnqueueSpec>) -> QueueResult<Vec<Job>> {
        let now = self.clock.now();
        let mut new_jobs = Vec::with_capacity(specs.len());
        for spec in specs {
            new_jobs.push(spec.into_new_job(Uuid::new_v4(), now)?);
        }
        let jobs = self.store.insert_batch(new_jobs, now).await?;
        info!(count = jobs.len(), "enqueued job batch");
        Ok(jobs)
    }

    /// Claims up to `batch_size` due jobs. Oversamples `find_due` by a
    /// small factor so that losing a claim race to another worker doesn't
    /// starve this call of work that is actually available.
    pub async fn claim_next(&self, worker_id: &str, batch_size: usize) -> QueueResult<Vec<Job>> {
        const OVERSAMPLE: i64 = 2;
        let now = self.clock.now();
        let candidates = self
            .store
            .find_due(now, (batch_size as i64) * OVERSAMPLE)
            .await?;

        let mut claimed = Vec::with_capacity(batch_size);
        for candidate in candidates {
            if claimed.len() >= batch_size {
                break;
            }
            match self
                .store
                .claim(candidate.id, worker_id, now, candidate.version)
                .await?
            {
                Some(job) => claimed.push(job),
                None => continue, // another worker won this one
            }
        }
        Ok(claimed)
    }

    pub async fn update_heartbeat(&self, id: Uuid, worker_id: &str) -> QueueResult<crate::store::HeartbeatOutcome> {
        let now = self.clock.now();
        self.store.heartbeat(id, worker_id, now).await
    }

    /// Merges `result_metadata` into the job's metadata, transitions to
    /// `Completed`, and reconciles the tracker for a success.
    pub async fn mark_completed(
        &self,
        id: Uuid,
        expected_version: i64,
        result_metadata: Option<JsonValue>,
    ) -> QueueResult<bool> {
        let now = self.clock.now();
        let job = match self.store.get(id).await? {
            Some(job) => job,
            None => return Ok(false),
        };
        if job.status.is_terminal() {
            return Ok(false); // idempotent no-op
        }
        let applied = self.store.complete(id, expected_version, now, result_metadata).await?;
        if applied {
            if let Some(tracker_id) = job.tracker_id() {
                if let Some(tracker) = self.trackers.record_success(tracker_id, now).await? {
                    debug!(
                        tracker_id = %tracker_id,
                        processed = tracker.processed_files,
                        total = tracker.total_files,
                        "tracker reconciled on success"
                    );
                }
            }
        }
        Ok(applied)
    }

    /// Routes a job failure through the Failure Router (see module docs):
    /// retryable with budget left resets to `Pending` with a backoff
    /// schedule; otherwise the job fails terminally and a dead letter is
    /// written. Cancellations never produce a dead letter.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        expected_version: i64,
        reason: &str,
        detail: Option<&str>,
        retryable: bool,
    ) -> QueueResult<bool> {
        let now = self.clock.now();
        let job = match self.store.get(id).await? {
            Some(job) => job,
            None => return Ok(false),
        };
        if job.status.is_terminal() {
            return Ok(false);
        }

        let is_cancellation = reason == "cancelled";

        if retryable && job.retry_count < job.max_retries && !is_cancellation {
            let next_retry_count = job.retry_count + 1;
            let next_schedule = next_retry_schedule(now, next_retry_count, &self.backoff);
            let applied = self
                .store
                .retry(id, expected_version, next_schedule, reason, detail, now)
                .await?;
            if applied {
                warn!(
                    job_id = %id,
                    retry_count = next_retry_count,
                    max_retries = job.max_retries,
                    scheduled_for = %next_schedule,
                    "job failed, scheduled retry"
                );
            }
            return Ok(applied);
        }

        let applied = self
            .store
            .fail_terminal(id, expected_version, reason, detail, now)
            .await?;
        if !applied {
            return Ok(false);
        }

        if !is_cancellation {
            let snapshot = Job {
                status: crate::job::JobStatus::Failed,
                error_message: Some(reason.to_string()),
                error_detail: detail.map(|d| d.to_string()),
                completed_at: Some(now),
                ..job.clone()
            };
            let dead_letter = DeadLetter::from_job(&snapshot, reason, now);
            self.dead_letters.insert(&dead_letter).await?;
            warn!(job_id = %id, reason, "job failed terminally, wrote dead letter");
        } else {
            info!(job_id = %id, "job cancelled in flight");
        }

        if let Some(tracker_id) = job.tracker_id() {
            if let Some(tracker) = self.trackers.record_failure(tracker_id, now).await? {
                debug!(
                    tracker_id = %tracker_id,
                    failed = tracker.failed_files,
                    total = tracker.total_files,
                    "tracker reconciled on failure"
                );
            }
        }

        Ok(applied)
    }

    /// Cooperative cancel: `Pending -> Cancelled` immediately; `Processing`
    /// jobs are flagged and the owning worker aborts on its next heartbeat
    /// check.
    pub async fn cancel(&self, id: Uuid) -> QueueResult<bool> {
        let now = self.clock.now();
        self.store.cancel(id, now).await
    }

    /// Resets every `Processing` job whose heartbeat has lapsed, attributing
    /// each as a retryable "worker loss" failure. Each job is processed
    /// independently: one failure must not block the others. Returns the
    /// number of jobs reset.
    pub async fn reset_stale(&self, stale_after: Duration) -> QueueResult<usize> {
        let now = self.clock.now();
        let stale = self.store.find_stale(now, stale_after).await?;
        let mut reset = 0;
        for job in stale {
            match self
                .mark_failed(
                    job.id,
                    job.version,
                    "worker loss / heartbeat timeout",
                    None,
                    true,
                )
                .await
            {
                Ok(true) => reset += 1,
                Ok(false) => {}
                Err(err) => warn!(job_id = %job.id, error = %err, "failed to reset stale job"),
            }
        }
        if reset > 0 {
            info!(reset, "stale sweep reset jobs");
        }
        Ok(reset)
    }

    pub async fn stats(&self, job_type: Option<&str>) -> QueueResult<QueueStats> {
        self.store.stats(job_type).await
    }

    pub async fn cleanup(&self, before: DateTime<Utc>) -> QueueResult<u64> {
        self.store.cleanup(before).await
    }
}
