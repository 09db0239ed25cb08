//! The poller + bounded worker pool + stale sweeper that turn claimed jobs
//! into finished ones.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{watch, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::dead_letter::DeadLetterStore;
use crate::failure::classify_uncaught;
use crate::job::Job;
use crate::processor::{ProcessorContext, ProcessorOutcome, ProcessorRegistry};
use crate::service::QueueService;
use crate::store::JobStore;
use crate::tracker::TrackerStore;

/// Every recognized `scheduler.*` configuration key and its default, per the
/// design's configuration table.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// When `false`, [`Scheduler::start`] is a no-op: producers are expected
    /// to run the relevant `JobProcessor` synchronously on the producer's
    /// thread right after `enqueue` (see the crate-level docs for the
    /// dual-mode contract).
    pub enabled: bool,
    pub poll_interval: StdDuration,
    pub idle_backoff: StdDuration,
    pub batch_size: usize,
    pub max_workers: usize,
    pub heartbeat_interval: StdDuration,
    pub stale_after: Duration,
    pub stale_sweep_interval: StdDuration,
    pub shutdown_grace: StdDuration,
    pub cleanup_retention_days: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let poll_interval = StdDuration::from_secs(5);
        Self {
            enabled: false,
            poll_interval,
            idle_backoff: poll_interval,
            batch_size: 10,
            max_workers: 5,
            heartbeat_interval: StdDuration::from_secs(30),
            stale_after: Duration::minutes(10),
            stale_sweep_interval: StdDuration::from_secs(60),
            shutdown_grace: StdDuration::from_secs(30),
            cleanup_retention_days: 30,
        }
    }
}

/// Snapshot used by the admin health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerHealth {
    pub running: bool,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub in_flight: usize,
    pub max_workers: usize,
}

pub struct Scheduler<S, D, T> {
    service: QueueService<S, D, T>,
    registry: ProcessorRegistry,
    config: SchedulerConfig,
    worker_id: String,
    permits: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: AsyncMutex<Vec<JoinHandle<()>>>,
    worker_handles: Arc<AsyncMutex<Vec<JoinHandle<()>>>>,
    last_poll_at: Arc<std::sync::Mutex<Option<DateTime<Utc>>>>,
    started: AtomicBool,
}

impl<S, D, T> Scheduler<S, D, T>
where
    S: JobStore + 'static,
    D: DeadLetterStore + 'static,
    T: TrackerStore + 'static,
{
    pub fn new(
        service: QueueService<S, D, T>,
        registry: ProcessorRegistry,
        config: SchedulerConfig,
        worker_id: String,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let max_workers = config.max_workers.max(1);
        Self {
            service,
            registry,
            config,
            worker_id,
            permits: Arc::new(Semaphore::new(max_workers)),
            shutdown_tx,
            shutdown_rx,
            handles: AsyncMutex::new(Vec::new()),
            worker_handles: Arc::new(AsyncMutex::new(Vec::new())),
            last_poll_at: Arc::new(std::sync::Mutex::new(None)),
            started: AtomicBool::new(false),
        }
    }

    pub fn health(&self) -> SchedulerHealth {
        SchedulerHealth {
            running: self.started.load(Ordering::SeqCst),
            last_poll_at: *self.last_poll_at.lock().expect("poll-time mutex poisoned"),
            in_flight: self.config.max_workers.saturating_sub(self.permits.available_permits()),
            max_workers: self.config.max_workers,
        }
    }

    /// Starts the poller, worker dispatch, and stale sweeper. No-op if
    /// `config.enabled` is `false` or the scheduler is already running.
    pub async fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("scheduler disabled, not starting");
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("scheduler already started, ignoring duplicate start()");
            return;
        }

        let mut handles = self.handles.lock().await;
        handles.push(tokio::spawn(self.clone().poller_loop()));
        handles.push(tokio::spawn(self.clone().stale_sweeper_loop()));
        info!(max_workers = self.config.max_workers, "scheduler started");
    }

    /// Idempotent graceful shutdown: stops the poller/sweeper, then waits up
    /// to `shutdown_grace` for in-flight worker tasks to finish. Anything
    /// still running past the grace period is left running in the
    /// background — it stays `Processing` and the stale sweeper will
    /// eventually reclaim it if it never finishes.
    pub async fn stop(self: &Arc<Self>) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return; // already stopped, or never started
        }
        let _ = self.shutdown_tx.send(true);

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = tokio::time::timeout(self.config.shutdown_grace, handle).await;
        }
        drop(handles);

        let worker_handles: Vec<_> = self.worker_handles.lock().await.drain(..).collect();
        let joined = futures::future::join_all(
            worker_handles
                .into_iter()
                .map(|h| tokio::time::timeout(self.config.shutdown_grace, h)),
        );
        let _ = tokio::time::timeout(self.config.shutdown_grace, joined).await;

        info!("scheduler stopped");
    }

    async fn poller_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let available = self.permits.available_permits();
            let (claimed, sleep_for) = if available == 0 {
                (Vec::new(), self.config.poll_interval)
            } else {
                let batch = available.min(self.config.batch_size);
                let claimed = match self.service.claim_next(&self.worker_id, batch).await {
                    Ok(jobs) => jobs,
                    Err(err) => {
                        error!(error = %err, "poll cycle failed, backing off");
                        Vec::new()
                    }
                };
                let sleep_for = if claimed.is_empty() {
                    self.config.idle_backoff
                } else {
                    self.config.poll_interval
                };
                (claimed, sleep_for)
            };

            *self.last_poll_at.lock().expect("poll-time mutex poisoned") = Some(Utc::now());

            for job in &claimed {
                self.dispatch(job.clone()).await;
            }

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    async fn stale_sweeper_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.stale_sweep_interval) => {
                    if let Err(err) = self.service.reset_stale(self.config.stale_after).await {
                        error!(error = %err, "stale sweep failed");
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    /// Acquires a worker permit and spawns the job's execution. The permit
    /// is held for the lifetime of the spawned task, which is what makes
    /// `max_workers` an enforced concurrency bound rather than a soft hint.
    async fn dispatch(self: &Arc<Self>, job: Job) {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                // Lost the race between sampling available_permits() and
                // acquiring one; the job stays Processing and will simply be
                // worked on the next poll cycle's heartbeat/claim pass.
                warn!(job_id = %job.id, "no worker permit available at dispatch time");
                return;
            }
        };

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _permit = permit;
            scheduler.run_job(job).await;
        });
        self.worker_handles.lock().await.push(handle);
    }

    async fn run_job(self: Arc<Self>, job: Job) {
        let job_id = job.id;
        let Some(processor) = self.registry.get(&job.job_type) else {
            warn!(job_id = %job_id, job_type = %job.job_type, "no processor registered");
            let _ = self
                .service
                .mark_failed(job_id, job.version, "no processor", None, false)
                .await;
            return;
        };

        let version = Arc::new(std::sync::atomic::AtomicI64::new(job.version));
        let (cancel_tx, cancel_rx) = watch::channel(job.cancel_requested);
        let heartbeat_service = self.service.clone();
        let heartbeat_worker_id = self.worker_id.clone();
        let heartbeat_version = Arc::clone(&version);
        let heartbeat_cancel_tx = cancel_tx.clone();
        let heartbeat_interval = self.config.heartbeat_interval;

        let heartbeat_handle: JoinHandle<()> = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await; // first tick is immediate; skip it
            loop {
                ticker.tick().await;
                match heartbeat_service.update_heartbeat(job_id, &heartbeat_worker_id).await {
                    Ok(outcome) => {
                        heartbeat_version.store(outcome.version, Ordering::SeqCst);
                        if outcome.cancel_requested {
                            let _ = heartbeat_cancel_tx.send(true);
                        }
                        if !outcome.accepted {
                            break; // job no longer ours (completed/failed/lost)
                        }
                    }
                    Err(err) => {
                        warn!(job_id = %job_id, error = %err, "heartbeat failed");
                    }
                }
            }
        });

        let manual_heartbeat_service = self.service.clone();
        let manual_heartbeat_worker_id = self.worker_id.clone();
        let heartbeat_fn: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            let service = manual_heartbeat_service.clone();
            let worker_id = manual_heartbeat_worker_id.clone();
            tokio::spawn(async move {
                let _ = service.update_heartbeat(job_id, &worker_id).await;
            });
        });

        let ctx = ProcessorContext::new(
            job.correlation_id.clone(),
            job.metadata.clone(),
            cancel_rx,
            heartbeat_fn,
        );

        let process_job = job.clone();
        let outcome = match tokio::spawn(async move { processor.process(&process_job, ctx).await })
            .await
        {
            Ok(outcome) => outcome,
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    "processor panicked".to_string()
                } else {
                    join_err.to_string()
                };
                error!(job_id = %job_id, %message, "processor task failed");
                ProcessorOutcome::Failure {
                    retryable: classify_uncaught(&message),
                    reason: message,
                    detail: None,
                }
            }
        };

        heartbeat_handle.abort();
        let current_version = version.load(Ordering::SeqCst);

        match outcome {
            ProcessorOutcome::Success(result_metadata) => {
                if let Err(err) = self
                    .service
                    .mark_completed(job_id, current_version, Some(result_metadata))
                    .await
                {
                    error!(job_id = %job_id, error = %err, "failed to record completion");
                }
            }
            ProcessorOutcome::Failure {
                reason,
                detail,
                retryable,
            } => {
                if let Err(err) = self
                    .service
                    .mark_failed(job_id, current_version, &reason, detail.as_deref(), retryable)
                    .await
                {
                    error!(job_id = %job_id, error = %err, "failed to record failure");
                }
            }
        }
    }
}
