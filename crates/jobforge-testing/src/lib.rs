//! In-memory [`JobStore`], [`DeadLetterStore`], and [`TrackerStore`]
//! implementations for exercising a [`JobProcessor`] without a database.
//!
//! These are not a toy subset of the contract: claim races, optimistic
//! version checks, and the tracker conservation invariant all behave the
//! same way here as they do against Postgres, so tests written against this
//! crate stay valid when pointed at the real store.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use jobforge_core::dead_letter::{DeadLetter, DeadLetterStore, Page};
use jobforge_core::error::{QueueError, QueueResult};
use jobforge_core::job::{Job, JobStatus};
use jobforge_core::store::{HeartbeatOutcome, JobStore, NewJob, QueueStats};
use jobforge_core::tracker::{ProcessTracker, TrackerStore};
use jobforge_core::JobProcessor;
use std::sync::Arc;
use uuid::Uuid;

/// An in-memory, process-local `JobStore`. Safe to share across tasks via
/// `Arc`; internally backed by a `DashMap` keyed by job id.
#[derive(Default, Clone)]
pub struct MemoryJobStore {
    jobs: Arc<DashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn new_job_to_row(job: NewJob, now: DateTime<Utc>) -> Job {
        Job {
            id: job.id,
            job_type: job.job_type,
            correlation_id: job.correlation_id,
            status: JobStatus::Pending,
            priority: job.priority,
            payload_blob: job.payload_blob,
            metadata: job.metadata,
            retry_count: 0,
            max_retries: job.max_retries,
            error_message: None,
            error_detail: None,
            created_at: now,
            scheduled_for: job.scheduled_for,
            started_at: None,
            completed_at: None,
            updated_at: now,
            assigned_to: None,
            heartbeat_at: None,
            version: 1,
            cancel_requested: false,
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> QueueResult<Job> {
        if self.jobs.contains_key(&job.id) {
            return Err(QueueError::Conflict);
        }
        let row = Self::new_job_to_row(job, now);
        self.jobs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn insert_batch(&self, jobs: Vec<NewJob>, now: DateTime<Utc>) -> QueueResult<Vec<Job>> {
        for job in &jobs {
            if self.jobs.contains_key(&job.id) {
                return Err(QueueError::Conflict);
            }
        }
        let rows: Vec<Job> = jobs
            .into_iter()
            .map(|job| Self::new_job_to_row(job, now))
            .collect();
        for row in &rows {
            self.jobs.insert(row.id, row.clone());
        }
        Ok(rows)
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: i64) -> QueueResult<Vec<Job>> {
        let mut due: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| entry.status == JobStatus::Pending && entry.scheduled_for <= now)
            .map(|entry| entry.clone())
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn claim(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        expected_version: i64,
    ) -> QueueResult<Option<Job>> {
        let Some(mut entry) = self.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if entry.status != JobStatus::Pending || entry.version != expected_version {
            return Ok(None);
        }
        entry.status = JobStatus::Processing;
        entry.assigned_to = Some(worker_id.to_string());
        entry.started_at = Some(now);
        entry.heartbeat_at = Some(now);
        entry.updated_at = now;
        entry.version += 1;
        Ok(Some(entry.clone()))
    }

    async fn heartbeat(&self, id: Uuid, worker_id: &str, now: DateTime<Utc>) -> QueueResult<HeartbeatOutcome> {
        let Some(mut entry) = self.jobs.get_mut(&id) else {
            return Ok(HeartbeatOutcome {
                accepted: false,
                cancel_requested: false,
                version: 0,
            });
        };
        if entry.status != JobStatus::Processing || entry.assigned_to.as_deref() != Some(worker_id) {
            return Ok(HeartbeatOutcome {
                accepted: false,
                cancel_requested: entry.cancel_requested,
                version: entry.version,
            });
        }
        entry.heartbeat_at = Some(now);
        entry.updated_at = now;
        entry.version += 1;
        Ok(HeartbeatOutcome {
            accepted: true,
            cancel_requested: entry.cancel_requested,
            version: entry.version,
        })
    }

    async fn complete(
        &self,
        id: Uuid,
        expected_version: i64,
        now: DateTime<Utc>,
        result_metadata: Option<serde_json::Value>,
    ) -> QueueResult<bool> {
        let Some(mut entry) = self.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if entry.status != JobStatus::Processing || entry.version != expected_version {
            return Ok(false);
        }
        if let Some(serde_json::Value::Object(extra)) = result_metadata {
            if let serde_json::Value::Object(existing) = &mut entry.metadata {
                existing.extend(extra);
            }
        }
        entry.status = JobStatus::Completed;
        entry.completed_at = Some(now);
        entry.updated_at = now;
        entry.heartbeat_at = None;
        entry.version += 1;
        Ok(true)
    }

    async fn fail_terminal(
        &self,
        id: Uuid,
        expected_version: i64,
        reason: &str,
        detail: Option<&str>,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let Some(mut entry) = self.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if entry.status != JobStatus::Processing || entry.version != expected_version {
            return Ok(false);
        }
        entry.status = if reason == "cancelled" {
            JobStatus::Cancelled
        } else {
            JobStatus::Failed
        };
        entry.error_message = Some(reason.to_string());
        entry.error_detail = detail.map(|d| d.to_string());
        entry.completed_at = Some(now);
        entry.updated_at = now;
        entry.version += 1;
        Ok(true)
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
        let Some(mut entry) = self.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if entry.status != JobStatus::Processing || entry.version != expected_version {
            return Ok(false);
        }
        entry.status = JobStatus::Pending;
        entry.assigned_to = None;
        entry.started_at = None;
        entry.heartbeat_at = None;
        entry.retry_count += 1;
        entry.scheduled_for = next_schedule;
        entry.error_message = Some(reason.to_string());
        entry.error_detail = detail.map(|d| d.to_string());
        entry.updated_at = now;
        entry.version += 1;
        Ok(true)
    }

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> QueueResult<bool> {
        let Some(mut entry) = self.jobs.get_mut(&id) else {
            return Ok(false);
        };
        match entry.status {
            JobStatus::Pending => {
                entry.status = JobStatus::Cancelled;
                entry.completed_at = Some(now);
                entry.updated_at = now;
                entry.version += 1;
                Ok(true)
            }
            JobStatus::Processing => {
                entry.cancel_requested = true;
                entry.updated_at = now;
                entry.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> QueueResult<Vec<Job>> {
        let threshold = now - stale_after;
        Ok(self
            .jobs
            .iter()
            .filter(|entry| {
                entry.status == JobStatus::Processing
                    && entry.heartbeat_at.map(|hb| hb < threshold).unwrap_or(false)
            })
            .map(|entry| entry.clone())
            .collect())
    }

    async fn get(&self, id: Uuid) -> QueueResult<Option<Job>> {
        Ok(self.jobs.get(&id).map(|entry| entry.clone()))
    }

    async fn list_by_status(&self, status: JobStatus, page: Page) -> QueueResult<Vec<Job>> {
        let mut matches: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.clone())
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let start = page.offset.max(0) as usize;
        let end = start.saturating_add(page.limit.max(0) as usize);
        Ok(matches.into_iter().skip(start).take(end - start).collect())
    }

    async fn list_by_correlation(&self, correlation_id: &str) -> QueueResult<Vec<Job>> {
        Ok(self
            .jobs
            .iter()
            .filter(|entry| entry.correlation_id.as_deref() == Some(correlation_id))
            .map(|entry| entry.clone())
            .collect())
    }

    async fn oldest_pending(&self) -> QueueResult<Option<Job>> {
        Ok(self
            .jobs
            .iter()
            .filter(|entry| entry.status == JobStatus::Pending)
            .map(|entry| entry.clone())
            .min_by_key(|job| job.created_at))
    }

    async fn stats(&self, job_type: Option<&str>) -> QueueResult<QueueStats> {
        let mut stats = QueueStats::default();
        let mut durations = Vec::new();
        for entry in self.jobs.iter() {
            if let Some(filter) = job_type {
                if entry.job_type != filter {
                    continue;
                }
            }
            match entry.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => {
                    stats.completed += 1;
                    if let (Some(started), Some(completed)) = (entry.started_at, entry.completed_at) {
                        durations.push((completed - started).num_milliseconds() as f64);
                    }
                }
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        if !durations.is_empty() {
            stats.avg_duration_ms = Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        Ok(stats)
    }

    async fn cleanup(&self, before: DateTime<Utc>) -> QueueResult<u64> {
        let to_remove: Vec<Uuid> = self
            .jobs
            .iter()
            .filter(|entry| {
                entry.status == JobStatus::Completed
                    && entry.completed_at.map(|at| at < before).unwrap_or(false)
            })
            .map(|entry| entry.id)
            .collect();
        for id in &to_remove {
            self.jobs.remove(id);
        }
        Ok(to_remove.len() as u64)
    }
}

/// An in-memory `DeadLetterStore`.
#[derive(Default, Clone)]
pub struct MemoryDeadLetterStore {
    records: Arc<DashMap<Uuid, DeadLetter>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn insert(&self, record: &DeadLetter) -> QueueResult<()> {
        self.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> QueueResult<Option<DeadLetter>> {
        Ok(self.records.get(&id).map(|entry| entry.clone()))
    }

    async fn list_unresolved(&self, page: Page) -> QueueResult<Vec<DeadLetter>> {
        let mut matches: Vec<DeadLetter> = self
            .records
            .iter()
            .filter(|entry| !entry.resolved)
            .map(|entry| entry.clone())
            .collect();
        matches.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        let start = page.offset.max(0) as usize;
        let end = start.saturating_add(page.limit.max(0) as usize);
        Ok(matches.into_iter().skip(start).take(end - start).collect())
    }
}

/// An in-memory `TrackerStore`.
#[derive(Default, Clone)]
pub struct MemoryTrackerStore {
    trackers: Arc<DashMap<Uuid, ProcessTracker>>,
}

impl MemoryTrackerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, tracker: ProcessTracker) {
        self.trackers.insert(tracker.id, tracker);
    }
}

#[async_trait]
impl TrackerStore for MemoryTrackerStore {
    async fn get(&self, id: Uuid) -> QueueResult<Option<ProcessTracker>> {
        Ok(self.trackers.get(&id).map(|entry| entry.clone()))
    }

    async fn upsert(&self, tracker: &ProcessTracker) -> QueueResult<()> {
        self.trackers.insert(tracker.id, tracker.clone());
        Ok(())
    }

    async fn record_success(&self, id: Uuid, now: DateTime<Utc>) -> QueueResult<Option<ProcessTracker>> {
        let Some(mut entry) = self.trackers.get_mut(&id) else {
            return Ok(None);
        };
        entry.processed_files += 1;
        entry.reconcile(now, "processed one more file");
        Ok(Some(entry.clone()))
    }

    async fn record_failure(&self, id: Uuid, now: DateTime<Utc>) -> QueueResult<Option<ProcessTracker>> {
        let Some(mut entry) = self.trackers.get_mut(&id) else {
            return Ok(None);
        };
        entry.failed_files += 1;
        entry.reconcile(now, "one file failed");
        Ok(Some(entry.clone()))
    }
}

/// A `JobProcessor` stub for tests: returns a fixed outcome (optionally after
/// a sequence of scripted retryable failures) and records every job it was
/// asked to process.
pub struct ScriptedProcessor {
    job_type: String,
    script: Arc<std::sync::Mutex<Vec<ScriptedStep>>>,
    invocations: Arc<DashMap<Uuid, u32>>,
    delay: Option<std::time::Duration>,
}

#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Succeed,
    FailRetryable(String),
    FailTerminal(String),
}

impl ScriptedProcessor {
    pub fn new(job_type: impl Into<String>, script: Vec<ScriptedStep>) -> Self {
        Self {
            job_type: job_type.into(),
            script: Arc::new(std::sync::Mutex::new(script)),
            invocations: Arc::new(DashMap::new()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn invocation_count(&self, job_id: Uuid) -> u32 {
        self.invocations.get(&job_id).map(|v| *v).unwrap_or(0)
    }
}

#[async_trait]
impl JobProcessor for ScriptedProcessor {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn process(
        &self,
        job: &Job,
        _ctx: jobforge_core::processor::ProcessorContext,
    ) -> jobforge_core::processor::ProcessorOutcome {
        use jobforge_core::processor::ProcessorOutcome;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        *self.invocations.entry(job.id).or_insert(0) += 1;

        let step = {
            let mut script = self.script.lock().expect("script mutex poisoned");
            if script.is_empty() {
                ScriptedStep::Succeed
            } else {
                script.remove(0)
            }
        };

        match step {
            ScriptedStep::Succeed => ProcessorOutcome::Success(serde_json::json!({})),
            ScriptedStep::FailRetryable(reason) => ProcessorOutcome::failure(reason, true),
            ScriptedStep::FailTerminal(reason) => ProcessorOutcome::failure(reason, false),
        }
    }
}
