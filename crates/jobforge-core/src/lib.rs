//! # jobforge-core
//!
//! A durable, database-backed job queue and scheduler: priority + delayed
//! scheduling, a bounded pool of cooperating workers, heartbeat-based crash
//! recovery, bounded retry with exponential backoff, dead-letter routing,
//! and per-correlation tracker reconciliation.
//!
//! ## Architecture
//!
//! ```text
//! Producer                                  Scheduler
//!     │ enqueue()                               │ poll (fixed interval)
//!     ▼                                          ▼
//! QueueService ──insert──► JobStore ◄──claim── claim_next()
//!     │                        ▲                 │
//!     │                        │          dispatch to worker
//!     │                 heartbeat/retry/          │
//!     │                 complete/fail             ▼
//!     │                        │          JobProcessor.process()
//!     ▼                        │                 │
//! TrackerStore ◄────── mark_completed/mark_failed ┘
//!                              │
//!                              ▼
//!                       DeadLetterStore (on terminal failure)
//! ```
//!
//! ## Key invariants
//!
//! 1. A job is processed by at most one worker at any instant, enforced by
//!    `claim`'s optimistic-version precondition.
//! 2. `version` strictly increases across every mutation of a job row.
//! 3. `retry_count` never exceeds `max_retries`; exhausting the budget on a
//!    non-cancellable failure reaches `Failed`, never back to `Pending`.
//! 4. Delivery is at-least-once, never exactly-once: processors must be
//!    safe to invoke more than once for the same `(id, payload)`.
//!
//! ## What this is not
//!
//! This crate does not parse resumes, call an LLM, or expose a REST/GraphQL
//! surface — those are external collaborators reached only through the
//! [`JobProcessor`] trait. It does not provide cross-process distributed
//! consensus, exactly-once delivery, priority aging, or multi-tenant
//! isolation.

pub mod admin;
pub mod clock;
pub mod dead_letter;
pub mod error;
mod failure;
mod ids;
pub mod job;
pub mod processor;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod tracker;

pub use admin::{AdminHealth, AdminSurface};
pub use clock::{Clock, FixedClock, SharedClock, SystemClock};
pub use dead_letter::{DeadLetter, DeadLetterStore, Page};
pub use error::{Categorizable, QueueError, QueueResult};
pub use failure::{next_retry_schedule, BackoffConfig};
pub use ids::worker_id;
pub use job::{
    Job, JobStatus, DEFAULT_MAX_RETRIES, PRIORITY_MAX, PRIORITY_MIN, RESUME_PROCESSING,
    TRACKER_ID_KEY,
};
pub use processor::{JobProcessor, ProcessorContext, ProcessorOutcome, ProcessorRegistry};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHealth};
pub use service::{EnqueueSpec, QueueService};
pub use store::{HeartbeatOutcome, JobStore, NewJob, QueueStats};
pub use tracker::{ProcessTracker, TrackerStatus, TrackerStore};

pub use async_trait::async_trait;
