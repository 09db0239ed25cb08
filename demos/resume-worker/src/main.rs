//! Demo: wires `AdminSurface` and `Scheduler` around a resume-processing
//! `JobProcessor`.
//!
//! Set `JOBFORGE_SYNC_MODE=1` to skip the scheduler entirely and run the
//! processor synchronously on the producer thread right after `enqueue`,
//! demonstrating the dual-mode execution contract.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use jobforge_core::admin::AdminSurface;
use jobforge_core::clock::SystemClock;
use jobforge_core::dead_letter::Page;
use jobforge_core::job::{Job, JobStatus, RESUME_PROCESSING};
use jobforge_core::processor::{JobProcessor, ProcessorContext, ProcessorOutcome, ProcessorRegistry};
use jobforge_core::scheduler::{Scheduler, SchedulerConfig};
use jobforge_core::service::{EnqueueSpec, QueueService};
use jobforge_testing::{MemoryDeadLetterStore, MemoryJobStore, MemoryTrackerStore};
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Reports a byte count for a resume payload. Stands in for a real
/// text-extraction and scoring pipeline; the point of this demo is the
/// queue plumbing around a processor, not the parsing itself.
struct ResumeProcessor;

#[async_trait]
impl JobProcessor for ResumeProcessor {
    fn job_type(&self) -> &str {
        RESUME_PROCESSING
    }

    async fn process(&self, job: &Job, ctx: ProcessorContext) -> ProcessorOutcome {
        let filename = ctx
            .metadata()
            .get("filename")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        if ctx.cancelled() {
            return ProcessorOutcome::failure("cancelled", false);
        }

        if !filename.ends_with(".pdf") && !filename.ends_with(".docx") {
            return ProcessorOutcome::failure_with_detail(
                "unsupported format",
                format!("cannot parse {filename}"),
                false,
            );
        }

        let Some(blob) = &job.payload_blob else {
            return ProcessorOutcome::failure("missing payload", true);
        };

        ctx.heartbeat();
        tokio::time::sleep(Duration::from_millis(20)).await;

        ProcessorOutcome::Success(json!({
            "filename": filename,
            "byte_count": blob.len(),
        }))
    }
}

fn sample_resumes() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("applicant-1.pdf", b"dummy pdf bytes".to_vec()),
        ("applicant-2.docx", b"dummy docx bytes".to_vec()),
        ("applicant-3.exe", b"not a resume".to_vec()),
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let store = Arc::new(MemoryJobStore::new());
    let dead_letters = Arc::new(MemoryDeadLetterStore::new());
    let trackers = Arc::new(MemoryTrackerStore::new());
    let service = QueueService::new(store, dead_letters, trackers, Arc::new(SystemClock));
    let admin = AdminSurface::new(service.clone());

    if std::env::var("JOBFORGE_SYNC_MODE").is_ok() {
        run_sync_mode(&service, &admin).await?;
    } else {
        run_scheduled_mode(service.clone(), &admin).await?;
    }

    let stats = admin.stats().await?;
    tracing::info!(?stats, "final queue stats");

    for status in [JobStatus::Completed, JobStatus::Failed] {
        for job in admin.list_by_status(status, Page::default()).await? {
            tracing::info!(job_id = %job.id, status = %job.status, error = ?job.error_message, "job settled");
        }
    }

    Ok(())
}

/// Dual-mode contract, disabled-scheduler branch: the producer claims and
/// runs the processor itself, right after enqueue, on its own task.
async fn run_sync_mode(
    service: &QueueService<MemoryJobStore, MemoryDeadLetterStore, MemoryTrackerStore>,
    admin: &AdminSurface<MemoryJobStore, MemoryDeadLetterStore, MemoryTrackerStore>,
) -> Result<()> {
    tracing::info!("running in synchronous producer-thread mode");
    let processor = ResumeProcessor;

    for (filename, bytes) in sample_resumes() {
        let mut spec = EnqueueSpec::new(RESUME_PROCESSING);
        spec.metadata = json!({ "filename": filename });
        spec.payload_blob = Some(bytes);
        let job = admin.enqueue(spec).await?;

        let Some(claimed) = service
            .claim_next("sync-producer", 1)
            .await?
            .into_iter()
            .find(|j| j.id == job.id)
        else {
            continue;
        };

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let ctx = ProcessorContext::new(claimed.correlation_id.clone(), claimed.metadata.clone(), rx, Arc::new(|| {}));

        match processor.process(&claimed, ctx).await {
            ProcessorOutcome::Success(result) => {
                service.mark_completed(claimed.id, claimed.version, Some(result)).await?;
            }
            ProcessorOutcome::Failure { reason, detail, retryable } => {
                service
                    .mark_failed(claimed.id, claimed.version, &reason, detail.as_deref(), retryable)
                    .await?;
            }
        }
    }
    Ok(())
}

/// Dual-mode contract, enabled-scheduler branch: enqueue and let the
/// background poller/worker pool pick the jobs up.
async fn run_scheduled_mode(
    service: QueueService<MemoryJobStore, MemoryDeadLetterStore, MemoryTrackerStore>,
    admin: &AdminSurface<MemoryJobStore, MemoryDeadLetterStore, MemoryTrackerStore>,
) -> Result<()> {
    tracing::info!("running with the background scheduler enabled");
    let registry = ProcessorRegistry::new().register(Arc::new(ResumeProcessor));
    let config = SchedulerConfig {
        enabled: true,
        poll_interval: Duration::from_millis(200),
        idle_backoff: Duration::from_millis(200),
        max_workers: 3,
        ..SchedulerConfig::default()
    };
    let worker_id = jobforge_core::worker_id("resume-worker");
    let scheduler = Arc::new(Scheduler::new(service, registry, config, worker_id));
    scheduler.start().await;

    for (filename, bytes) in sample_resumes() {
        let mut spec = EnqueueSpec::new(RESUME_PROCESSING);
        spec.metadata = json!({ "filename": filename });
        spec.payload_blob = Some(bytes);
        admin.enqueue(spec).await?;
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    scheduler.stop().await;
    Ok(())
}
