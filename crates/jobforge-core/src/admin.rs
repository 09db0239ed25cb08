//! The small synchronous surface producers, operators, and UIs use: enqueue,
//! inspect, cancel, health, cleanup. No REST/GraphQL wiring lives here — per
//! the design, that surface belongs to the surrounding application; this is
//! the library API it would be built on top of.

use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::dead_letter::Page;
use crate::error::QueueResult;
use crate::job::{Job, JobStatus};
use crate::scheduler::Scheduler;
use crate::service::{EnqueueSpec, QueueService};
use crate::store::{JobStore, QueueStats};
use crate::dead_letter::DeadLetterStore;
use crate::tracker::TrackerStore;

pub struct AdminSurface<S, D, T> {
    service: QueueService<S, D, T>,
    scheduler: Option<Arc<Scheduler<S, D, T>>>,
}

impl<S, D, T> AdminSurface<S, D, T>
where
    S: JobStore + 'static,
    D: DeadLetterStore + 'static,
    T: TrackerStore + 'static,
{
    pub fn new(service: QueueService<S, D, T>) -> Self {
        Self {
            service,
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler<S, D, T>>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub async fn enqueue(&self, spec: EnqueueSpec) -> QueueResult<Job> {
        self.service.enqueue(spec).await
    }

    pub async fn get(&self, id: Uuid) -> QueueResult<Option<Job>> {
        self.service.store().get(id).await
    }

    pub async fn list_by_status(&self, status: JobStatus, page: Page) -> QueueResult<Vec<Job>> {
        self.service.store().list_by_status(status, page).await
    }

    pub async fn list_by_correlation(&self, correlation_id: &str) -> QueueResult<Vec<Job>> {
        self.service.store().list_by_correlation(correlation_id).await
    }

    pub async fn cancel(&self, id: Uuid) -> QueueResult<bool> {
        self.service.cancel(id).await
    }

    /// Runs the stale sweep immediately, outside of its usual interval.
    pub async fn reset_stale(&self, stale_after: Duration) -> QueueResult<usize> {
        self.service.reset_stale(stale_after).await
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        self.service.stats(None).await
    }

    /// Scheduler running state, pending/processing counts, oldest pending
    /// age, and the poller's last-run timestamp.
    pub async fn health(&self) -> QueueResult<AdminHealth> {
        let stats = self.service.stats(None).await?;
        let oldest_pending = self
            .service
            .store()
            .oldest_pending()
            .await?
            .map(|job| Utc::now() - job.created_at);

        let scheduler_health = self.scheduler.as_ref().map(|s| s.health());

        Ok(AdminHealth {
            scheduler_running: scheduler_health.as_ref().map(|h| h.running).unwrap_or(false),
            pending: stats.pending,
            processing: stats.processing,
            oldest_pending_age_ms: oldest_pending.map(|d| d.num_milliseconds()),
            last_poll_at: scheduler_health.and_then(|h| h.last_poll_at),
        })
    }

    pub async fn cleanup(&self, days_to_keep: i64) -> QueueResult<u64> {
        let before = Utc::now() - Duration::days(days_to_keep);
        self.service.cleanup(before).await
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AdminHealth {
    pub scheduler_running: bool,
    pub pending: i64,
    pub processing: i64,
    pub oldest_pending_age_ms: Option<i64>,
    pub last_poll_at: Option<chrono::DateTime<Utc>>,
}
