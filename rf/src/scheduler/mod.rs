//! Request scheduler
//!
//! Accepts keyed operations, answers fresh cache hits immediately, and runs
//! everything else through a priority queue behind a bounded concurrency gate
//! with optional rate limiting. Also provides cancellation of queued requests,
//! explicit retry and batch execution.

mod batch;
mod config;
mod core;
mod gate;
mod operation;
mod queue;

pub use batch::{BatchEntry, BatchOptions, BatchOutcome};
pub use config::SchedulerConfig;
pub use core::Scheduler;
pub use gate::{Admission, ConcurrencyGate};
pub use operation::{Operation, RequestOptions, SharedOperation};
pub use queue::{QueueEntry, QueueEntryStatus, QueueState, SchedulerStats};
