//! Integration tests for the concrete end-to-end scenarios and universal
//! invariants the queue is expected to uphold.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use jobforge_core::admin::AdminSurface;
use jobforge_core::clock::{Clock, FixedClock, SharedClock};
use jobforge_core::dead_letter::Page;
use jobforge_core::job::{JobStatus, RESUME_PROCESSING};
use jobforge_core::processor::ProcessorRegistry;
use jobforge_core::scheduler::{Scheduler, SchedulerConfig};
use jobforge_core::service::{EnqueueSpec, QueueService};
use jobforge_core::tracker::{ProcessTracker, TrackerStatus, TrackerStore};
use jobforge_testing::{MemoryDeadLetterStore, MemoryJobStore, MemoryTrackerStore, ScriptedProcessor, ScriptedStep};
use serde_json::json;
use uuid::Uuid;

type Service = QueueService<MemoryJobStore, MemoryDeadLetterStore, MemoryTrackerStore>;

fn new_service(clock: SharedClock) -> (Service, Arc<MemoryDeadLetterStore>, Arc<MemoryTrackerStore>) {
    let store = Arc::new(MemoryJobStore::new());
    let dead_letters = Arc::new(MemoryDeadLetterStore::new());
    let trackers = Arc::new(MemoryTrackerStore::new());
    let service = QueueService::new(store, dead_letters.clone(), trackers.clone(), clock);
    (service, dead_letters, trackers)
}

fn trackable_spec(tracker_id: Uuid) -> EnqueueSpec {
    let mut spec = EnqueueSpec::new(RESUME_PROCESSING);
    spec.metadata = json!({ "tracker_id": tracker_id.to_string(), "filename": "a.pdf" });
    spec.payload_blob = Some(vec![0u8; 10]);
    spec
}

#[tokio::test]
async fn enqueue_get_roundtrip_all_fields() {
    let clock: SharedClock = Arc::new(FixedClock::new(Utc::now()));
    let (service, _, _) = new_service(clock);

    let mut spec = EnqueueSpec::new(RESUME_PROCESSING);
    spec.priority = Some(42);
    spec.correlation_id = Some("batch-1".to_string());
    spec.metadata = json!({ "filename": "resume.pdf" });

    let job = service.enqueue(spec).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.priority, 42);
    assert_eq!(job.correlation_id.as_deref(), Some("batch-1"));
    assert_eq!(job.retry_count, 0);

    let fetched = service.store().get(job.id).await.unwrap().unwrap();
    assert_eq!(fetched.id, job.id);
    assert_eq!(fetched.priority, job.priority);
    assert_eq!(fetched.correlation_id, job.correlation_id);
    assert_eq!(fetched.metadata, job.metadata);
}

#[tokio::test]
async fn enqueue_cancel_pending_job_reaches_cancelled_without_processing() {
    let clock: SharedClock = Arc::new(FixedClock::new(Utc::now()));
    let (service, _, _) = new_service(clock);

    let job = service.enqueue(EnqueueSpec::new(RESUME_PROCESSING)).await.unwrap();
    let cancelled = service.cancel(job.id).await.unwrap();
    assert!(cancelled);

    let fetched = service.store().get(job.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn cancel_on_terminal_job_is_a_no_op() {
    let clock: SharedClock = Arc::new(FixedClock::new(Utc::now()));
    let (service, _, _) = new_service(clock);

    let job = service.enqueue(EnqueueSpec::new(RESUME_PROCESSING)).await.unwrap();
    assert!(service.cancel(job.id).await.unwrap());
    // Already cancelled: a second cancel must not mutate anything further.
    assert!(!service.cancel(job.id).await.unwrap());
}

#[tokio::test]
async fn priority_law_claims_higher_priority_first() {
    let fixed = FixedClock::new(Utc::now());
    let clock: SharedClock = Arc::new(fixed.clone());
    let (service, _, _) = new_service(clock);

    let mut low = EnqueueSpec::new(RESUME_PROCESSING);
    low.priority = Some(0);
    let j1 = service.enqueue(low).await.unwrap();

    fixed.advance(Duration::milliseconds(1));
    let mut high = EnqueueSpec::new(RESUME_PROCESSING);
    high.priority = Some(10);
    let j2 = service.enqueue(high).await.unwrap();

    let first = service.claim_next("worker-1", 1).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, j2.id, "higher priority job must be claimed first");

    let second = service.claim_next("worker-1", 1).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, j1.id);
}

/// Scenario 2: retryable failure twice, then success.
#[tokio::test]
async fn retryable_failure_then_success_respects_backoff_and_retry_count() {
    let fixed = FixedClock::new(Utc::now());
    let clock: SharedClock = Arc::new(fixed.clone());
    let (service, dead_letters, trackers) = new_service(clock);

    let tracker_id = Uuid::new_v4();
    let job = service.enqueue(trackable_spec(tracker_id)).await.unwrap();
    trackers.seed(ProcessTracker::new(tracker_id, job.id, job.correlation_id.clone(), 1, fixed.now()));

    // First attempt.
    let claimed = service.claim_next("worker-1", 1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let v1 = claimed[0].version;
    assert!(service
        .mark_failed(job.id, v1, "connection reset", None, true)
        .await
        .unwrap());
    let after_first = service.store().get(job.id).await.unwrap().unwrap();
    assert_eq!(after_first.status, JobStatus::Pending);
    assert_eq!(after_first.retry_count, 1);
    let first_schedule = after_first.scheduled_for;
    // First retry: base (5 min) * 2^1, with up to +/-30s jitter.
    assert!(first_schedule - fixed.now() >= Duration::seconds(10 * 60 - 31));

    // Second attempt: advance the clock past the first backoff window.
    fixed.set(first_schedule);
    let claimed = service.claim_next("worker-1", 1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let v2 = claimed[0].version;
    assert!(service
        .mark_failed(job.id, v2, "timed out", None, true)
        .await
        .unwrap());
    let after_second = service.store().get(job.id).await.unwrap().unwrap();
    assert_eq!(after_second.retry_count, 2);
    let second_schedule = after_second.scheduled_for;
    assert!(second_schedule > first_schedule);

    // Third attempt succeeds.
    fixed.set(second_schedule);
    let claimed = service.claim_next("worker-1", 1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let v3 = claimed[0].version;
    assert!(service.mark_completed(job.id, v3, None).await.unwrap());

    let final_job = service.store().get(job.id).await.unwrap().unwrap();
    assert_eq!(final_job.status, JobStatus::Completed);
    assert_eq!(final_job.retry_count, 2);
    assert!(dead_letters.is_empty(), "no dead letter for an eventually-successful job");

    let tracker = trackers.get(tracker_id).await.unwrap().unwrap();
    assert_eq!(tracker.processed_files, 1);
    assert_eq!(tracker.failed_files, 0);
    assert_eq!(tracker.status, TrackerStatus::Completed);
}

/// Scenario 3: terminal failure routes straight to the dead letter store.
#[tokio::test]
async fn terminal_failure_writes_dead_letter_and_updates_tracker() {
    let clock: SharedClock = Arc::new(FixedClock::new(Utc::now()));
    let (service, dead_letters, trackers) = new_service(clock);

    let tracker_id = Uuid::new_v4();
    let job = service.enqueue(trackable_spec(tracker_id)).await.unwrap();
    trackers.seed(ProcessTracker::new(tracker_id, job.id, job.correlation_id.clone(), 1, Utc::now()));

    let claimed = service.claim_next("worker-1", 1).await.unwrap();
    let version = claimed[0].version;

    let applied = service
        .mark_failed(job.id, version, "unsupported format", Some("detail"), false)
        .await
        .unwrap();
    assert!(applied);

    let failed = service.store().get(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.retry_count, 0);

    assert_eq!(dead_letters.len(), 1);
    let record = dead_letters
        .list_unresolved(Page::first(10))
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    assert_eq!(record.original_job_id, job.id);
    assert_eq!(record.retry_attempts, 0);

    let tracker = trackers.get(tracker_id).await.unwrap().unwrap();
    assert_eq!(tracker.failed_files, 1);
    assert_eq!(tracker.status, TrackerStatus::Failed);
}

/// Scenario 4: worker loss. A stale sweep resets the job and the original
/// worker's subsequent `complete` call is rejected as a conflict.
#[tokio::test]
async fn worker_loss_is_swept_and_stale_workers_are_rejected() {
    let fixed = FixedClock::new(Utc::now());
    let clock: SharedClock = Arc::new(fixed.clone());
    let (service, _, _) = new_service(clock);

    let job = service.enqueue(EnqueueSpec::new(RESUME_PROCESSING)).await.unwrap();
    let claimed = service.claim_next("worker-1", 1).await.unwrap();
    let claimed_version = claimed[0].version;

    fixed.advance(Duration::seconds(2));
    let reset = service.reset_stale(Duration::seconds(1)).await.unwrap();
    assert_eq!(reset, 1);

    let after_sweep = service.store().get(job.id).await.unwrap().unwrap();
    assert_eq!(after_sweep.status, JobStatus::Pending);
    assert_eq!(after_sweep.retry_count, 1);
    assert!(after_sweep.assigned_to.is_none());

    // The original worker didn't know it was reaped; its complete() call
    // races against the now-stale version and must be rejected.
    let stale_complete = service.mark_completed(job.id, claimed_version, None).await.unwrap();
    assert!(!stale_complete, "a stale worker must not be able to complete a reclaimed job");
}

/// Scenario 6: cancellation of an in-flight job settles as `Cancelled`, not
/// `Failed`, and never produces a dead letter.
#[tokio::test]
async fn cancellation_of_in_flight_job_does_not_dead_letter() {
    let clock: SharedClock = Arc::new(FixedClock::new(Utc::now()));
    let (service, dead_letters, trackers) = new_service(clock);

    let tracker_id = Uuid::new_v4();
    let job = service.enqueue(trackable_spec(tracker_id)).await.unwrap();
    trackers.seed(ProcessTracker::new(tracker_id, job.id, job.correlation_id.clone(), 1, Utc::now()));

    let claimed = service.claim_next("worker-1", 1).await.unwrap();
    let version = claimed[0].version;

    // Cancel flags the in-flight job; the worker observes it on its next
    // heartbeat and returns a terminal, non-retryable "cancelled" failure.
    assert!(service.cancel(job.id).await.unwrap());
    let outcome = service.update_heartbeat(job.id, "worker-1").await.unwrap();
    assert!(outcome.cancel_requested);

    let applied = service
        .mark_failed(job.id, outcome.version, "cancelled", None, false)
        .await
        .unwrap();
    assert!(applied);

    let final_job = service.store().get(job.id).await.unwrap().unwrap();
    assert_eq!(final_job.status, JobStatus::Cancelled);
    assert!(dead_letters.is_empty(), "cancellations must never be dead-lettered");

    let tracker = trackers.get(tracker_id).await.unwrap().unwrap();
    assert_eq!(tracker.failed_files, 1);
}

/// Testable property: retry budget. Exhausting it on a non-cancellable
/// failure reaches `Failed`, never back to `Pending`.
#[tokio::test]
async fn retry_budget_exhaustion_reaches_failed_not_pending() {
    let fixed = FixedClock::new(Utc::now());
    let clock: SharedClock = Arc::new(fixed.clone());
    let (service, dead_letters, _) = new_service(clock);

    let mut spec = EnqueueSpec::new(RESUME_PROCESSING);
    spec.max_retries = Some(1);
    let job = service.enqueue(spec).await.unwrap();

    // First failure: budget remains (retry_count 0 < max_retries 1).
    let claimed = service.claim_next("worker-1", 1).await.unwrap();
    service
        .mark_failed(job.id, claimed[0].version, "timeout", None, true)
        .await
        .unwrap();
    let after_first = service.store().get(job.id).await.unwrap().unwrap();
    assert_eq!(after_first.status, JobStatus::Pending);
    assert_eq!(after_first.retry_count, 1);

    // Second failure: retry_count (1) now equals max_retries (1) -> terminal.
    fixed.set(after_first.scheduled_for);
    let claimed = service.claim_next("worker-1", 1).await.unwrap();
    service
        .mark_failed(job.id, claimed[0].version, "timeout again", None, true)
        .await
        .unwrap();
    let after_second = service.store().get(job.id).await.unwrap().unwrap();
    assert_eq!(after_second.status, JobStatus::Failed);
    assert_eq!(after_second.retry_count, 1, "retry_count must never exceed max_retries");
    assert_eq!(dead_letters.len(), 1);
}

/// Idempotence: completing an already-terminal job a second time is a no-op.
#[tokio::test]
async fn mark_completed_twice_is_idempotent() {
    let clock: SharedClock = Arc::new(FixedClock::new(Utc::now()));
    let (service, _, _) = new_service(clock);

    let job = service.enqueue(EnqueueSpec::new(RESUME_PROCESSING)).await.unwrap();
    let claimed = service.claim_next("worker-1", 1).await.unwrap();
    let version = claimed[0].version;

    assert!(service.mark_completed(job.id, version, None).await.unwrap());
    assert!(!service.mark_completed(job.id, version, None).await.unwrap());
}

/// Testable property: version strictly increases across mutations.
#[tokio::test]
async fn version_strictly_increases_across_mutations() {
    let clock: SharedClock = Arc::new(FixedClock::new(Utc::now()));
    let (service, _, _) = new_service(clock);

    let job = service.enqueue(EnqueueSpec::new(RESUME_PROCESSING)).await.unwrap();
    let v0 = job.version;

    let claimed = service.claim_next("worker-1", 1).await.unwrap();
    let v1 = claimed[0].version;
    assert!(v1 > v0);

    let hb = service.update_heartbeat(job.id, "worker-1").await.unwrap();
    assert!(hb.version > v1);

    assert!(service.mark_completed(job.id, hb.version, None).await.unwrap());
    let done = service.store().get(job.id).await.unwrap().unwrap();
    assert!(done.version > hb.version);
}

/// Scenario 1 (happy path), exercised through the real `Scheduler` rather
/// than direct store calls, to prove the poller/worker/heartbeat wiring
/// works end-to-end.
#[tokio::test(flavor = "multi_thread")]
async fn scheduler_end_to_end_happy_path() {
    let clock: SharedClock = Arc::new(jobforge_core::clock::SystemClock);
    let (service, _dead_letters, trackers) = new_service(clock);

    let tracker_id = Uuid::new_v4();
    let admin = AdminSurface::new(service.clone());
    let job = admin.enqueue(trackable_spec(tracker_id)).await.unwrap();
    trackers.seed(ProcessTracker::new(tracker_id, job.id, job.correlation_id.clone(), 1, Utc::now()));

    let processor = Arc::new(
        ScriptedProcessor::new(RESUME_PROCESSING, vec![ScriptedStep::Succeed])
            .with_delay(StdDuration::from_millis(50)),
    );
    let registry = ProcessorRegistry::new().register(processor.clone());

    let config = SchedulerConfig {
        enabled: true,
        poll_interval: StdDuration::from_millis(100),
        idle_backoff: StdDuration::from_millis(100),
        max_workers: 1,
        ..SchedulerConfig::default()
    };

    let scheduler = Arc::new(Scheduler::new(service, registry, config, "test-worker".to_string()));
    scheduler.start().await;

    let deadline = tokio::time::Instant::now() + StdDuration::from_millis(500);
    let mut final_job = None;
    while tokio::time::Instant::now() < deadline {
        let current = admin.get(job.id).await.unwrap().unwrap();
        if current.status.is_terminal() {
            final_job = Some(current);
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }
    scheduler.stop().await;

    let final_job = final_job.expect("job did not reach a terminal state within the deadline");
    assert_eq!(final_job.status, JobStatus::Completed);
    assert_eq!(final_job.retry_count, 0);
    assert!(final_job.completed_at.is_some());

    let tracker = trackers.get(tracker_id).await.unwrap().unwrap();
    assert_eq!(tracker.processed_files, 1);
    assert_eq!(tracker.failed_files, 0);
}
