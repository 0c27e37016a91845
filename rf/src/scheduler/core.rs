//! Scheduler implementation

use std::any::Any;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use eyre::eyre;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::{Priority, RequestStatus, StatusRecord};
use crate::error::RequestError;
use crate::progress::ProgressReporter;
use crate::store::{CacheStore, StatusRegistry};

use super::config::SchedulerConfig;
use super::gate::ConcurrencyGate;
use super::operation::{Operation, RequestOptions, ResolvedOptions, SharedOperation};
use super::queue::{PriorityQueue, QueueEntry, QueueEntryStatus, QueueState, QueuedRequest, SchedulerStats};

/// An admitted request that has not settled yet
struct RunningRequest {
    key: String,
    priority: Priority,
    started_at: Instant,
    lane: Option<u64>,
    /// Counted against the global ceiling rather than a lane's own
    global: bool,
}

/// Admission context for one batch
///
/// A lane with its own ceiling replaces the global ceiling for its entries.
/// The throttle and rate window still apply.
struct BatchLane {
    ceiling: Option<usize>,
    running: usize,
}

/// Last operation submitted for a key, kept for `retry`
#[derive(Clone)]
struct RecordedRequest<T> {
    operation: SharedOperation<T>,
    options: RequestOptions,
}

/// Result of the cache check at submission
pub(super) enum Prepared<T> {
    Cached(T),
    Run(ResolvedOptions),
}

/// Requests taken off the queue in one admission pass
pub(super) struct Admitted<T> {
    requests: Vec<QueuedRequest<T>>,
    wake_after: Option<Duration>,
}

/// Internal state protected by mutex
pub(super) struct SchedulerInner<T> {
    cache: CacheStore<T>,
    statuses: StatusRegistry<T>,
    queue: PriorityQueue<T>,
    gate: ConcurrencyGate,
    running: HashMap<u64, RunningRequest>,
    lanes: HashMap<u64, BatchLane>,
    recorded: HashMap<String, RecordedRequest<T>>,
    /// Queued requests already counted as rate limited
    deferred: HashSet<u64>,
    next_seq: u64,
    next_lane: u64,
    wake_armed: bool,
    stats: SchedulerStats,
}

impl<T: Clone> SchedulerInner<T> {
    fn new(config: &SchedulerConfig) -> Self {
        Self {
            cache: CacheStore::new(),
            statuses: StatusRegistry::new(),
            queue: PriorityQueue::new(),
            gate: ConcurrencyGate::from_config(config),
            running: HashMap::new(),
            lanes: HashMap::new(),
            recorded: HashMap::new(),
            deferred: HashSet::new(),
            next_seq: 0,
            next_lane: 0,
            wake_armed: false,
            stats: SchedulerStats::default(),
        }
    }

    /// Record the request, serve a fresh cache hit, or mark the key pending
    pub(super) fn begin(
        &mut self,
        key: &str,
        operation: &SharedOperation<T>,
        options: RequestOptions,
        config: &SchedulerConfig,
    ) -> Result<Prepared<T>, RequestError> {
        if key.is_empty() {
            return Err(RequestError::InvalidKey);
        }

        let resolved = options
            .clone()
            .resolve(config.default_priority, config.default_cache_duration());

        self.stats.total_submitted += 1;
        self.recorded.insert(
            key.to_string(),
            RecordedRequest {
                operation: Arc::clone(operation),
                options,
            },
        );

        if !resolved.force_refresh {
            let hit = self
                .cache
                .get_fresh(key, resolved.cache_duration, Instant::now())
                .cloned();
            if let Some(data) = hit {
                debug!(%key, "SchedulerInner::begin: cache hit");
                self.stats.total_cache_hits += 1;
                return Ok(Prepared::Cached(data));
            }
        }

        self.statuses.mark_pending(key);
        Ok(Prepared::Run(resolved))
    }

    /// Queue a request that missed the cache
    pub(super) fn enqueue(
        &mut self,
        key: &str,
        operation: SharedOperation<T>,
        resolved: ResolvedOptions,
        lane: Option<u64>,
    ) -> oneshot::Receiver<Result<T, RequestError>> {
        let (reply, rx) = oneshot::channel();
        let seq = self.next_seq;
        self.next_seq += 1;

        self.queue.push(QueuedRequest {
            seq,
            key: key.to_string(),
            priority: resolved.priority,
            lane,
            submitted_at: Instant::now(),
            operation,
            progress: ProgressReporter::new(key.to_string(), resolved.on_progress),
            reply,
        });
        self.stats.peak_queue_depth = self.stats.peak_queue_depth.max(self.queue.len());
        debug!(%key, seq, ?lane, priority = %resolved.priority, queued = self.queue.len(), "SchedulerInner::enqueue: queued");
        rx
    }

    /// Register a batch lane; `None` shares the global ceiling
    pub(super) fn open_lane(&mut self, ceiling: Option<usize>) -> u64 {
        let id = self.next_lane;
        self.next_lane += 1;
        self.lanes.insert(id, BatchLane { ceiling, running: 0 });
        id
    }

    /// Drop a lane and take its requests that are still waiting
    fn close_lane(&mut self, id: u64) -> Vec<QueuedRequest<T>> {
        self.lanes.remove(&id);
        let waiting = self.queue.drain_where(|r| r.lane == Some(id));
        for request in &waiting {
            self.cancel_waiting(request);
        }
        waiting
    }

    /// Bookkeeping for a waiting request that will never run
    fn cancel_waiting(&mut self, request: &QueuedRequest<T>) {
        self.deferred.remove(&request.seq);
        self.stats.total_cancelled += 1;
        if !self.key_in_flight(&request.key) {
            let error = RequestError::Cancelled {
                key: request.key.clone(),
            };
            self.statuses.mark_error(&request.key, error);
        }
    }

    /// Return the slot held by `seq`
    fn release_slot(&mut self, seq: u64) -> bool {
        let Some(request) = self.running.remove(&seq) else {
            return false;
        };
        if request.global {
            self.gate.release();
        }
        if let Some(lane) = request.lane.and_then(|id| self.lanes.get_mut(&id)) {
            lane.running = lane.running.saturating_sub(1);
        }
        true
    }

    /// Pop queued requests while the gate has room
    pub(super) fn admit_ready(&mut self) -> Admitted<T> {
        let mut admitted = Admitted {
            requests: Vec::new(),
            wake_after: None,
        };

        while !self.queue.is_empty() {
            let now = Instant::now();
            let global_free = self.gate.has_capacity();
            let lanes = &self.lanes;
            let next = self.queue.first_where(|r| match r.lane.and_then(|id| lanes.get(&id)) {
                Some(BatchLane {
                    ceiling: Some(ceiling),
                    running,
                }) => running < ceiling,
                _ => global_free,
            });
            let Some(seq) = next else {
                debug!(queued = self.queue.len(), "SchedulerInner::admit_ready: at capacity");
                break;
            };

            if let Some(retry_after) = self.gate.rate_check(now) {
                debug!(?retry_after, "SchedulerInner::admit_ready: rate limited");
                if self.deferred.insert(seq) {
                    self.stats.total_rate_limited += 1;
                }
                if !self.wake_armed {
                    self.wake_armed = true;
                    admitted.wake_after = Some(retry_after);
                }
                break;
            }

            let Some(request) = self.queue.remove_seq(seq) else {
                break;
            };
            self.deferred.remove(&seq);

            let lane = request.lane.and_then(|id| self.lanes.get_mut(&id));
            let global = match lane {
                Some(lane) => {
                    lane.running += 1;
                    lane.ceiling.is_none()
                }
                None => true,
            };
            if global {
                self.gate.acquire(now);
            } else {
                self.gate.record_admission(now);
            }

            self.running.insert(
                seq,
                RunningRequest {
                    key: request.key.clone(),
                    priority: request.priority,
                    started_at: now,
                    lane: request.lane,
                    global,
                },
            );
            self.stats.total_scheduled += 1;
            self.stats.peak_concurrent = self.stats.peak_concurrent.max(self.running.len());
            debug!(
                key = %request.key,
                priority = %request.priority,
                lane = ?request.lane,
                waited_ms = now.saturating_duration_since(request.submitted_at).as_millis() as u64,
                "SchedulerInner::admit_ready: admitting"
            );
            admitted.requests.push(request);
        }

        admitted
    }

    fn key_in_flight(&self, key: &str) -> bool {
        self.queue.contains_key(key) || self.running.values().any(|r| r.key == key)
    }
}

/// State shared between the scheduler handle and its running operations
pub(super) struct Shared<T> {
    pub(super) config: SchedulerConfig,
    inner: Mutex<SchedulerInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Shared<T> {
    pub(super) fn lock(&self) -> MutexGuard<'_, SchedulerInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit whatever the gate allows and start it
    fn pump(self: &Arc<Self>) {
        let admitted = self.lock().admit_ready();
        self.dispatch(admitted);
    }

    pub(super) fn dispatch(self: &Arc<Self>, admitted: Admitted<T>) {
        let Admitted { requests, wake_after } = admitted;
        if requests.is_empty() && wake_after.is_none() {
            return;
        }

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(count = requests.len(), "Shared::dispatch: no tokio runtime, dropping admitted requests");
                let mut inner = self.lock();
                inner.wake_armed = false;
                for request in &requests {
                    inner.release_slot(request.seq);
                    let error = RequestError::Dropped {
                        key: request.key.clone(),
                    };
                    inner.statuses.mark_error(&request.key, error);
                }
                return;
            }
        };

        for request in requests {
            let shared = Arc::clone(self);
            handle.spawn(shared.run(request));
        }

        if let Some(delay) = wake_after {
            let weak = Arc::downgrade(self);
            handle.spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(shared) = weak.upgrade() {
                    shared.lock().wake_armed = false;
                    shared.pump();
                }
            });
        }
    }

    /// Body of an admitted request's task
    async fn run(self: Arc<Self>, request: QueuedRequest<T>) {
        let QueuedRequest {
            seq,
            key,
            operation,
            progress,
            reply,
            ..
        } = request;

        let slot = SlotGuard {
            shared: Arc::clone(&self),
            seq,
        };

        let started = Instant::now();
        let outcome = run_operation(operation.as_ref(), progress.clone()).await;
        progress.settle();
        let result = self.finish(&key, outcome, started.elapsed());

        drop(slot);

        if reply.send(result).is_err() {
            debug!(%key, "Shared::run: caller went away before the result arrived");
        }
    }

    /// Write the outcome to the cache and status registry
    pub(super) fn finish(&self, key: &str, outcome: eyre::Result<T>, elapsed: Duration) -> Result<T, RequestError> {
        let mut inner = self.lock();
        inner.stats.total_run_time_ms += elapsed.as_millis() as u64;

        match outcome {
            Ok(data) => {
                inner.cache.insert(key, data.clone(), Instant::now());
                inner.statuses.mark_success(key, data.clone());
                inner.stats.total_completed += 1;
                debug!(%key, elapsed_ms = elapsed.as_millis() as u64, "Shared::finish: succeeded");
                Ok(data)
            }
            Err(report) => {
                warn!(%key, error = %report, "Request failed");
                let error = RequestError::execution(key, report);
                inner.statuses.mark_error(key, error.clone());
                inner.stats.total_failed += 1;
                Err(error)
            }
        }
    }

    /// Return a slot and admit the next waiting request
    fn release(self: &Arc<Self>, seq: u64) {
        let admitted = {
            let mut inner = self.lock();
            if !inner.release_slot(seq) {
                warn!(seq, "Shared::release: unknown request");
            }
            inner.admit_ready()
        };
        self.dispatch(admitted);
    }

    /// Remove a batch lane, cancelling its requests that have not started
    pub(super) fn close_lane(&self, id: u64) {
        let waiting = self.lock().close_lane(id);
        if !waiting.is_empty() {
            info!(lane = id, count = waiting.len(), "Cancelled waiting batch entries");
        }
        for request in waiting {
            reply_cancelled(request);
        }
    }
}

/// Settle a request removed from the queue before it ran
fn reply_cancelled<T>(request: QueuedRequest<T>) {
    request.progress.settle();
    let _ = request.reply.send(Err(RequestError::Cancelled { key: request.key }));
}

/// Releases a concurrency slot however the operation ends
struct SlotGuard<T: Clone + Send + Sync + 'static> {
    shared: Arc<Shared<T>>,
    seq: u64,
}

impl<T: Clone + Send + Sync + 'static> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        self.shared.release(self.seq);
    }
}

/// Run an operation, turning a panic into an error
async fn run_operation<T>(operation: &dyn Operation<T>, progress: ProgressReporter) -> eyre::Result<T> {
    let outcome = AssertUnwindSafe(async move { operation.execute(progress).await })
        .catch_unwind()
        .await;
    match outcome {
        Ok(result) => result,
        Err(payload) => Err(eyre!("operation panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The Scheduler deduplicates, caches, prioritizes and rate-limits requests
///
/// Cloning yields another handle onto the same caches, queue and counter.
/// Every state change happens inside one critical section, so a cache check
/// and the matching enqueue can never interleave with another submission.
pub struct Scheduler<T = serde_json::Value> {
    pub(super) shared: Arc<Shared<T>>,
}

impl<T> Clone for Scheduler<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Scheduler<T> {
    fn default() -> Self {
        Self::from_valid_config(SchedulerConfig::default())
    }
}

impl<T: Clone + Send + Sync + 'static> Scheduler<T> {
    /// Create a new scheduler with the given configuration
    pub fn new(config: SchedulerConfig) -> Result<Self, RequestError> {
        debug!(?config, "Scheduler::new: called");
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    fn from_valid_config(config: SchedulerConfig) -> Self {
        let inner = SchedulerInner::new(&config);
        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(inner),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Submit a keyed operation
    ///
    /// Resolves immediately from the cache when a fresh result exists and
    /// `force_refresh` is off. Otherwise the request is queued and the future
    /// settles once the operation has run.
    pub async fn submit<O>(&self, key: impl Into<String>, operation: O, options: RequestOptions) -> Result<T, RequestError>
    where
        O: Operation<T> + 'static,
    {
        self.submit_shared(key.into(), Arc::new(operation), options).await
    }

    /// Submit an operation that is already shared
    pub async fn submit_shared(
        &self,
        key: String,
        operation: SharedOperation<T>,
        options: RequestOptions,
    ) -> Result<T, RequestError> {
        debug!(%key, ?options, "Scheduler::submit: called");

        let (rx, admitted) = {
            let mut inner = self.shared.lock();
            let resolved = match inner.begin(&key, &operation, options, &self.shared.config)? {
                Prepared::Cached(data) => return Ok(data),
                Prepared::Run(resolved) => resolved,
            };
            let rx = inner.enqueue(&key, operation, resolved, None);
            (rx, inner.admit_ready())
        };
        self.shared.dispatch(admitted);

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RequestError::Dropped { key }),
        }
    }

    /// Run the last operation recorded for `key` again, bypassing the cache
    pub async fn retry(&self, key: &str) -> Result<T, RequestError> {
        debug!(%key, "Scheduler::retry: called");
        let recorded = self.shared.lock().recorded.get(key).cloned();
        let Some(recorded) = recorded else {
            return Err(RequestError::NotFound { key: key.to_string() });
        };

        info!(%key, "Retrying request");
        let options = RequestOptions {
            force_refresh: true,
            ..recorded.options
        };
        self.submit_shared(key.to_string(), recorded.operation, options).await
    }

    /// Current status of `key`; unknown keys are idle
    pub fn get_status(&self, key: &str) -> StatusRecord<T> {
        self.shared.lock().statuses.get(key)
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.shared.lock().statuses.status(key) == RequestStatus::Pending
    }

    /// Drop the cached result for `key`, or every cached result
    pub fn clear_cache(&self, key: Option<&str>) {
        debug!(?key, "Scheduler::clear_cache: called");
        let mut inner = self.shared.lock();
        match key {
            Some(key) => {
                inner.cache.remove(key);
            }
            None => {
                inner.cache.clear();
            }
        }
    }

    /// Whether a fresh cached result exists for a reader allowing `max_age`
    pub fn is_cached(&self, key: &str, max_age: Duration) -> bool {
        self.shared
            .lock()
            .cache
            .get_fresh(key, max_age, Instant::now())
            .is_some()
    }

    /// Cancel a queued request (remove from queue)
    ///
    /// Running operations are never interrupted; only a request still waiting
    /// for admission can be cancelled.
    pub fn cancel(&self, key: &str) -> bool {
        debug!(%key, "Scheduler::cancel: called");
        let removed = {
            let mut inner = self.shared.lock();
            let Some(request) = inner.queue.remove_first(key) else {
                debug!(%key, "Scheduler::cancel: not found in queue");
                return false;
            };
            inner.cancel_waiting(&request);
            request
        };

        info!(%key, "Cancelled queued request");
        reply_cancelled(removed);
        true
    }

    /// Cancel every queued request, returning how many were cancelled
    pub fn cancel_all(&self) -> usize {
        debug!("Scheduler::cancel_all: called");
        let removed = {
            let mut inner = self.shared.lock();
            let removed = inner.queue.drain();
            for request in &removed {
                inner.cancel_waiting(request);
            }
            removed
        };

        let count = removed.len();
        for request in removed {
            reply_cancelled(request);
        }
        if count > 0 {
            info!(count, "Cancelled all queued requests");
        }
        count
    }

    /// Hold back admissions after the remote side asked us to slow down
    pub fn handle_rate_limit(&self, retry_after: Duration) {
        warn!(?retry_after, "Received rate limit from remote");
        let mut inner = self.shared.lock();
        inner.gate.throttle(Instant::now(), retry_after);
        inner.stats.total_throttle_signals += 1;
    }

    /// Get current queue state
    pub fn queue_state(&self) -> QueueState {
        let inner = self.shared.lock();
        QueueState {
            running: inner.gate.running(),
            batch_running: inner.running.values().filter(|r| !r.global).count(),
            queued: inner.queue.len(),
            max_concurrent: inner.gate.ceiling(),
            rate_limited: inner.gate.is_rate_limited(Instant::now()),
            stats: inner.stats.clone(),
        }
    }

    /// Running and queued requests, highest priority first
    ///
    /// Within a tier, entries keep arrival order.
    pub fn queue_details(&self) -> Vec<QueueEntry> {
        let inner = self.shared.lock();
        let now = Instant::now();

        let mut entries: Vec<(u64, QueueEntry)> = inner
            .running
            .iter()
            .map(|(seq, r)| {
                let entry = QueueEntry {
                    key: r.key.clone(),
                    priority: r.priority,
                    status: QueueEntryStatus::Running,
                    wait_time: now.saturating_duration_since(r.started_at),
                };
                (*seq, entry)
            })
            .chain(inner.queue.iter().map(|r| {
                let entry = QueueEntry {
                    key: r.key.clone(),
                    priority: r.priority,
                    status: QueueEntryStatus::Queued,
                    wait_time: now.saturating_duration_since(r.submitted_at),
                };
                (r.seq, entry)
            }))
            .collect();

        entries.sort_by_key(|(seq, entry)| (Reverse(entry.priority), *seq));
        entries.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Get the scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        self.shared.lock().stats.clone()
    }
}
