//! Per-correlation progress mirror consumed by UIs polling batch status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerStatus {
    Initiated,
    InProgress,
    Completed,
    Failed,
}

/// Progress mirror for one logical batch of jobs (e.g. a multi-file upload).
///
/// Invariant: `processed_files + failed_files <= total_files`. `status ==
/// Completed` iff `processed_files + failed_files == total_files` and
/// `failed_files == 0`; otherwise a fully-accounted batch with any failures
/// settles as `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessTracker {
    pub id: Uuid,
    /// The job that owns this tracker (the one whose metadata carries this
    /// tracker's id as `tracker_id`), kept denormalized so a tracker row can
    /// be looked up by job id without a join.
    pub job_id: Uuid,
    pub correlation_id: Option<String>,
    pub status: TrackerStatus,
    pub total_files: i32,
    pub processed_files: i32,
    pub failed_files: i32,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessTracker {
    pub fn new(
        id: Uuid,
        job_id: Uuid,
        correlation_id: Option<String>,
        total_files: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job_id,
            correlation_id,
            status: TrackerStatus::Initiated,
            total_files,
            processed_files: 0,
            failed_files: 0,
            message: "initiated".to_string(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Recomputes `status`/`completed_at` after `processed_files`/
    /// `failed_files` have been mutated by the caller. Kept as a pure
    /// function on the struct so both the Postgres and in-memory stores
    /// apply exactly the same reconciliation rule.
    pub fn reconcile(&mut self, now: DateTime<Utc>, message: impl Into<String>) {
        debug_assert!(self.processed_files + self.failed_files <= self.total_files);
        self.message = message.into();
        self.updated_at = now;
        if self.processed_files + self.failed_files >= self.total_files {
            self.status = if self.failed_files > 0 {
                TrackerStatus::Failed
            } else {
                TrackerStatus::Completed
            };
            self.completed_at = Some(now);
        } else {
            self.status = TrackerStatus::InProgress;
        }
    }
}

/// Storage contract for [`ProcessTracker`] rows. Owned exclusively by the
/// tracker subsystem; the queue never writes these rows directly.
#[async_trait]
pub trait TrackerStore: Send + Sync {
    async fn get(&self, id: Uuid) -> QueueResult<Option<ProcessTracker>>;
    async fn upsert(&self, tracker: &ProcessTracker) -> QueueResult<()>;

    /// Atomically increments `processed_files` by one and reconciles status.
    /// Returns the updated tracker, or `None` if it does not exist.
    async fn record_success(&self, id: Uuid, now: DateTime<Utc>) -> QueueResult<Option<ProcessTracker>>;

    /// Atomically increments `failed_files` by one and reconciles status.
    async fn record_failure(&self, id: Uuid, now: DateTime<Utc>) -> QueueResult<Option<ProcessTracker>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_progress_until_all_files_accounted_for() {
        let now = Utc::now();
        let mut t = ProcessTracker::new(Uuid::new_v4(), Uuid::new_v4(), None, 3, now);
        t.processed_files = 1;
        t.reconcile(now, "one done");
        assert_eq!(t.status, TrackerStatus::InProgress);
        assert!(t.completed_at.is_none());
    }

    #[test]
    fn completed_when_all_processed_with_no_failures() {
        let now = Utc::now();
        let mut t = ProcessTracker::new(Uuid::new_v4(), Uuid::new_v4(), None, 2, now);
        t.processed_files = 2;
        t.reconcile(now, "all done");
        assert_eq!(t.status, TrackerStatus::Completed);
        assert_eq!(t.completed_at, Some(now));
    }

    #[test]
    fn failed_when_fully_accounted_with_any_failures() {
        let now = Utc::now();
        let mut t = ProcessTracker::new(Uuid::new_v4(), Uuid::new_v4(), None, 2, now);
        t.processed_files = 1;
        t.failed_files = 1;
        t.reconcile(now, "done with one failure");
        assert_eq!(t.status, TrackerStatus::Failed);
    }

    #[test]
    fn conservation_holds_across_mixed_updates() {
        let now = Utc::now();
        let mut t = ProcessTracker::new(Uuid::new_v4(), Uuid::new_v4(), None, 5, now);
        t.processed_files = 3;
        t.failed_files = 1;
        t.reconcile(now, "4 of 5 done");
        assert!(t.processed_files + t.failed_files <= t.total_files);
        assert_eq!(t.status, TrackerStatus::InProgress);
    }
}
