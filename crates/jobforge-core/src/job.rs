//! The `Job` entity and its allowed state transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// The one job type this workspace ships a processor for today. The queue
/// itself treats `job_type` as an opaque string so new processors can be
/// registered without touching core code.
pub const RESUME_PROCESSING: &str = "resume_processing";

/// Key that trackable jobs must carry in `metadata` to be reconciled against
/// a [`crate::tracker::ProcessTracker`].
pub const TRACKER_ID_KEY: &str = "tracker_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A unit of durable, asynchronously-executed work.
///
/// Invariants upheld by construction and by every [`crate::store::JobStore`]
/// transition method, never left to caller discipline:
/// - `assigned_to`, `started_at`, `heartbeat_at` are `Some` iff
///   `status == Processing`.
/// - `completed_at` is `Some` iff `status` is terminal.
/// - `retry_count <= max_retries`.
/// - `version` strictly increases across mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub correlation_id: Option<String>,
    pub status: JobStatus,
    pub priority: i32,
    pub payload_blob: Option<Vec<u8>>,
    pub metadata: JsonValue,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub assigned_to: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub version: i64,
    /// Flag raised by a cooperative `cancel()` while `status == Processing`.
    /// The store clears it back to `false` the moment the job reaches a
    /// terminal state; a processor observes it via `ProcessorContext`.
    pub cancel_requested: bool,
}

/// Minimum default retry budget, applied when an enqueue spec omits one.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Priorities are clamped into this inclusive range at enqueue time.
pub const PRIORITY_MIN: i32 = 0;
pub const PRIORITY_MAX: i32 = 100;

impl Job {
    /// `metadata.tracker_id`, if this job is trackable.
    pub fn tracker_id(&self) -> Option<Uuid> {
        self.metadata
            .get(TRACKER_ID_KEY)
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(metadata: JsonValue) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            job_type: RESUME_PROCESSING.to_string(),
            correlation_id: None,
            status: JobStatus::Pending,
            priority: 0,
            payload_blob: None,
            metadata,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            error_message: None,
            error_detail: None,
            created_at: now,
            scheduled_for: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            assigned_to: None,
            heartbeat_at: None,
            version: 1,
            cancel_requested: false,
        }
    }

    #[test]
    fn tracker_id_parses_from_metadata() {
        let id = Uuid::new_v4();
        let j = job(json!({ "tracker_id": id.to_string() }));
        assert_eq!(j.tracker_id(), Some(id));
    }

    #[test]
    fn tracker_id_absent_when_metadata_missing_key() {
        let j = job(json!({ "filename": "resume.pdf" }));
        assert_eq!(j.tracker_id(), None);
    }

    #[test]
    fn tracker_id_none_when_not_a_valid_uuid() {
        let j = job(json!({ "tracker_id": "not-a-uuid" }));
        assert_eq!(j.tracker_id(), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }
}
