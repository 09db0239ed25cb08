//! Terminal archive for jobs that failed without further retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::QueueResult;
use crate::job::Job;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub original_job_id: Uuid,
    pub job_type: String,
    pub failed_at: DateTime<Utc>,
    pub failure_reason: String,
    pub job_snapshot: JsonValue,
    pub retry_attempts: i32,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
}

impl DeadLetter {
    pub fn from_job(job: &Job, failure_reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            original_job_id: job.id,
            job_type: job.job_type.clone(),
            failed_at: now,
            failure_reason: failure_reason.into(),
            job_snapshot: serde_json::to_value(job).unwrap_or(JsonValue::Null),
            retry_attempts: job.retry_count,
            resolved: false,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
        }
    }
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn insert(&self, record: &DeadLetter) -> QueueResult<()>;
    async fn get(&self, id: Uuid) -> QueueResult<Option<DeadLetter>>;
    async fn list_unresolved(&self, page: Page) -> QueueResult<Vec<DeadLetter>>;
}

/// Simple offset/limit pagination shared by the admin listing calls.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

impl Page {
    pub fn first(limit: i64) -> Self {
        Self { offset: 0, limit }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::first(50)
    }
}
