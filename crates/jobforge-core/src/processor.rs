//! The pluggable unit of business work keyed by job type.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::job::Job;

/// Outcome a [`JobProcessor`] must return instead of propagating an
/// exception for any *expected* business failure. The worker harness still
/// catches panics/uncaught errors as a defensive net (see
/// `crate::scheduler`), but processors are contractually expected to return
/// this.
#[derive(Debug, Clone)]
pub enum ProcessorOutcome {
    Success(JsonValue),
    Failure {
        reason: String,
        detail: Option<String>,
        retryable: bool,
    },
}

impl ProcessorOutcome {
    pub fn failure(reason: impl Into<String>, retryable: bool) -> Self {
        ProcessorOutcome::Failure {
            reason: reason.into(),
            detail: None,
            retryable,
        }
    }

    pub fn failure_with_detail(
        reason: impl Into<String>,
        detail: impl Into<String>,
        retryable: bool,
    ) -> Self {
        ProcessorOutcome::Failure {
            reason: reason.into(),
            detail: Some(detail.into()),
            retryable,
        }
    }
}

/// Everything a processor needs beyond the `Job` itself: cooperative
/// cancellation, a heartbeat it must call periodically during long work, and
/// read access to correlation id / metadata.
#[derive(Clone)]
pub struct ProcessorContext {
    correlation_id: Option<String>,
    metadata: JsonValue,
    cancelled: watch::Receiver<bool>,
    heartbeat_tx: Arc<dyn Fn() + Send + Sync>,
}

impl ProcessorContext {
    pub fn new(
        correlation_id: Option<String>,
        metadata: JsonValue,
        cancelled: watch::Receiver<bool>,
        heartbeat_tx: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            correlation_id,
            metadata,
            cancelled,
            heartbeat_tx,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn metadata(&self) -> &JsonValue {
        &self.metadata
    }

    /// Whether this job has been cooperatively cancelled. Processors should
    /// poll this at coarse boundaries (per file, per LLM call) and return
    /// `ProcessorOutcome::failure("cancelled", false)` when observed.
    pub fn cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Signals liveness. Implementations should call this at least every
    /// `heartbeat_interval` during long work; the worker harness also calls
    /// it on a timer, so this is a courtesy for processors that want to
    /// signal progress at natural checkpoints.
    pub fn heartbeat(&self) {
        (self.heartbeat_tx)();
    }
}

#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// The `job_type` this processor handles.
    fn job_type(&self) -> &str;

    async fn process(&self, job: &Job, ctx: ProcessorContext) -> ProcessorOutcome;
}

/// Maps `job_type` to the registered [`JobProcessor`]. Built at startup and
/// immutable thereafter; dispatch for an unregistered type fails the job
/// terminally with reason "no processor".
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn JobProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `processor` for its own `job_type()`. Panics if a processor
    /// is already registered for that type — this is a startup-time wiring
    /// error, not a runtime condition.
    pub fn register(mut self, processor: Arc<dyn JobProcessor>) -> Self {
        let job_type = processor.job_type().to_string();
        if self.processors.insert(job_type.clone(), processor).is_some() {
            panic!("duplicate processor registered for job type {job_type:?}");
        }
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobProcessor>> {
        self.processors.get(job_type).cloned()
    }
}
