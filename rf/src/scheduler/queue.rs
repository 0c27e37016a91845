//! Queue types for the scheduler

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::domain::Priority;
use crate::error::RequestError;
use crate::progress::ProgressReporter;

use super::operation::SharedOperation;

/// Channel half used to settle a caller's request
pub(crate) type Reply<T> = oneshot::Sender<Result<T, RequestError>>;

/// A request waiting for admission
pub(crate) struct QueuedRequest<T> {
    /// Arrival sequence number; breaks priority ties FIFO
    pub seq: u64,
    pub key: String,
    pub priority: Priority,
    /// Batch lane the request belongs to, if any
    pub lane: Option<u64>,
    pub submitted_at: Instant,
    pub operation: SharedOperation<T>,
    pub progress: ProgressReporter,
    pub reply: Reply<T>,
}

impl<T> QueuedRequest<T> {
    fn rank(&self) -> (Priority, Reverse<u64>) {
        (self.priority, Reverse(self.seq))
    }
}

impl<T> Eq for QueuedRequest<T> {}

impl<T> PartialEq for QueuedRequest<T> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<T> Ord for QueuedRequest<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier arrival
        self.rank().cmp(&other.rank())
    }
}

impl<T> PartialOrd for QueuedRequest<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Waiting requests ordered by priority, then arrival
///
/// Duplicate keys are allowed and are served independently.
pub(crate) struct PriorityQueue<T> {
    heap: BinaryHeap<QueuedRequest<T>>,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self { heap: BinaryHeap::new() }
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: QueuedRequest<T>) {
        self.heap.push(request);
    }

    /// Next request to admit
    pub fn pop(&mut self) -> Option<QueuedRequest<T>> {
        self.heap.pop()
    }

    /// Remove the entry for `key` that would be admitted first
    pub fn remove_first(&mut self, key: &str) -> Option<QueuedRequest<T>> {
        let target = self.first_where(|r| r.key == key)?;
        self.remove_seq(target)
    }

    /// Sequence number of the highest-ranked request accepted by `eligible`
    pub fn first_where(&self, eligible: impl Fn(&QueuedRequest<T>) -> bool) -> Option<u64> {
        if let Some(top) = self.heap.peek().filter(|r| eligible(r)) {
            return Some(top.seq);
        }
        self.heap.iter().filter(|r| eligible(r)).max().map(|r| r.seq)
    }

    pub fn remove_seq(&mut self, seq: u64) -> Option<QueuedRequest<T>> {
        if self.heap.peek().is_some_and(|r| r.seq == seq) {
            return self.pop();
        }

        let mut entries = std::mem::take(&mut self.heap).into_vec();
        let removed = entries
            .iter()
            .position(|r| r.seq == seq)
            .map(|index| entries.swap_remove(index));
        self.heap = BinaryHeap::from(entries);
        removed
    }

    /// Take every request accepted by `matches`, in no particular order
    pub fn drain_where(&mut self, matches: impl Fn(&QueuedRequest<T>) -> bool) -> Vec<QueuedRequest<T>> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .partition(|r| matches(r));
        self.heap = BinaryHeap::from(kept);
        taken
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.heap.iter().any(|r| r.key == key)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedRequest<T>> {
        self.heap.iter()
    }

    /// Drain every waiting request, in no particular order
    pub fn drain(&mut self) -> Vec<QueuedRequest<T>> {
        std::mem::take(&mut self.heap).into_vec()
    }
}

/// Statistics for the scheduler
#[derive(Debug, Default, Clone, Serialize)]
pub struct SchedulerStats {
    pub total_submitted: u64,
    pub total_cache_hits: u64,
    /// Requests admitted, batch lanes included
    pub total_scheduled: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    /// Requests held back by the throttle or rate window, counted once each
    pub total_rate_limited: u64,
    /// Remote rate-limit signals received through `handle_rate_limit`
    pub total_throttle_signals: u64,
    pub total_run_time_ms: u64,
    pub peak_queue_depth: usize,
    /// Most operations running at once, batch lanes included
    pub peak_concurrent: usize,
}

/// Snapshot of the scheduler for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct QueueState {
    /// Operations holding a global slot
    pub running: usize,
    /// Operations running on a batch's own slots
    pub batch_running: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub rate_limited: bool,
    pub stats: SchedulerStats,
}

/// One running or waiting request, for display
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub key: String,
    pub priority: Priority,
    pub status: QueueEntryStatus,
    pub wait_time: Duration,
}

/// Status of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueEntryStatus {
    Running,
    Queued,
}
