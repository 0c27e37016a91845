//! Reqflow - request orchestration for dashboard feature modules
//!
//! Every outbound operation a feature module issues (model uploads, gas
//! telemetry, space layout, route planning) goes through one [`Scheduler`].
//! The scheduler answers repeated requests from a per-key cache, queues the
//! rest by priority behind a bounded concurrency gate, tracks each key's
//! lifecycle and relays progress back to whoever asked.
//!
//! # Core Concepts
//!
//! - **Keys**: a request key names one logical, deduplicatable unit of work
//! - **Freshness per read**: each call decides how old a cached result may be
//! - **Priority admission**: higher tiers start first, FIFO within a tier;
//!   running operations are never preempted
//! - **Guaranteed release**: a slot is returned however an operation ends
//!
//! # Modules
//!
//! - [`scheduler`] - Scheduler, queue, concurrency gate and batches
//! - [`store`] - Result cache and status registry
//! - [`progress`] - Progress relay handed to operations
//! - [`domain`] - Priorities and status records
//! - [`config`] - Configuration types and loading
//! - [`logging`] - Tracing subscriber setup

pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod progress;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use config::{Config, LoggingConfig};
pub use domain::{Priority, RequestStatus, StatusRecord};
pub use error::RequestError;
pub use logging::setup_logging;
pub use progress::{ProgressCallback, ProgressReporter};
pub use scheduler::{
    BatchEntry, BatchOptions, BatchOutcome, Operation, QueueEntry, QueueEntryStatus, QueueState, RequestOptions,
    Scheduler, SchedulerConfig, SchedulerStats, SharedOperation,
};
pub use store::{CacheEntry, CacheStore, StatusRegistry};
