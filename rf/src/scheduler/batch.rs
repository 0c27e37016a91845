//! Batch execution with a batch-scoped admission lane

use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::error::RequestError;

use super::core::{Prepared, Scheduler, Shared};
use super::operation::{Operation, RequestOptions, SharedOperation};

/// One request in a batch
#[derive(Clone)]
pub struct BatchEntry<T> {
    pub key: String,
    pub operation: SharedOperation<T>,
    pub options: RequestOptions,
}

impl<T> BatchEntry<T> {
    pub fn new<O>(key: impl Into<String>, operation: O) -> Self
    where
        O: Operation<T> + 'static,
    {
        Self {
            key: key.into(),
            operation: Arc::new(operation),
            options: RequestOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

/// How a batch is run
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    /// Slots reserved for this batch; `None` shares the scheduler's own gate
    pub concurrency: Option<usize>,

    /// Fail the whole batch on the first failing entry
    pub abort_on_error: bool,
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn abort_on_error(mut self, abort: bool) -> Self {
        self.abort_on_error = abort;
        self
    }
}

/// Per-entry result of a batch that tolerates failures
#[derive(Debug, Clone)]
pub enum BatchOutcome<T> {
    Success(T),
    Failure(RequestError),
}

impl<T> BatchOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchOutcome::Success(_))
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            BatchOutcome::Success(data) => Some(data),
            BatchOutcome::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&RequestError> {
        match self {
            BatchOutcome::Success(_) => None,
            BatchOutcome::Failure(error) => Some(error),
        }
    }

    pub fn into_result(self) -> Result<T, RequestError> {
        match self {
            BatchOutcome::Success(data) => Ok(data),
            BatchOutcome::Failure(error) => Err(error),
        }
    }
}

impl<T> From<Result<T, RequestError>> for BatchOutcome<T> {
    fn from(result: Result<T, RequestError>) -> Self {
        match result {
            Ok(data) => BatchOutcome::Success(data),
            Err(error) => BatchOutcome::Failure(error),
        }
    }
}

/// Where an entry's result will come from
enum Pending<T> {
    Ready(Result<T, RequestError>),
    Queued {
        key: String,
        rx: oneshot::Receiver<Result<T, RequestError>>,
    },
}

impl<T> Pending<T> {
    async fn settled(self) -> Result<T, RequestError> {
        match self {
            Pending::Ready(result) => result,
            Pending::Queued { key, rx } => rx.await.unwrap_or_else(|_| Err(RequestError::Dropped { key })),
        }
    }
}

/// Closes a batch lane once the batch settles or is dropped
struct LaneGuard<T: Clone + Send + Sync + 'static> {
    shared: Arc<Shared<T>>,
    id: u64,
}

impl<T: Clone + Send + Sync + 'static> Drop for LaneGuard<T> {
    fn drop(&mut self) {
        self.shared.close_lane(self.id);
    }
}

impl<T: Clone + Send + Sync + 'static> Scheduler<T> {
    /// Run a group of requests together
    ///
    /// Every entry is checked against the cache and queued up front, so an
    /// entry waiting for a slot is `Pending` and can be cancelled like any
    /// other request. Entries are admitted by priority, then entry order.
    /// A batch with its own `concurrency` counts against that ceiling instead
    /// of the global one; the throttle and rate window apply either way.
    ///
    /// Outcomes come back in entry order. With `abort_on_error` the first
    /// failure is returned as the batch error and entries still waiting are
    /// cancelled; otherwise each failure is kept as a `BatchOutcome::Failure`.
    pub async fn batch(
        &self,
        entries: Vec<BatchEntry<T>>,
        options: BatchOptions,
    ) -> Result<Vec<BatchOutcome<T>>, RequestError> {
        debug!(count = entries.len(), ?options, "Scheduler::batch: called");
        if options.concurrency == Some(0) {
            return Err(RequestError::InvalidConfig(
                "batch concurrency must be at least 1".to_string(),
            ));
        }

        let (pending, lane, admitted) = {
            let shared = &self.shared;
            let mut inner = shared.lock();
            let lane = inner.open_lane(options.concurrency);
            let pending: Vec<Pending<T>> = entries
                .into_iter()
                .map(|entry| {
                    let BatchEntry {
                        key,
                        operation,
                        options: request_options,
                    } = entry;
                    match inner.begin(&key, &operation, request_options, &shared.config) {
                        Ok(Prepared::Cached(data)) => Pending::Ready(Ok(data)),
                        Ok(Prepared::Run(resolved)) => {
                            let rx = inner.enqueue(&key, operation, resolved, Some(lane));
                            Pending::Queued { key, rx }
                        }
                        Err(error) => Pending::Ready(Err(error)),
                    }
                })
                .collect();
            (pending, lane, inner.admit_ready())
        };

        let _lane = LaneGuard {
            shared: Arc::clone(&self.shared),
            id: lane,
        };
        self.shared.dispatch(admitted);

        let waits = pending.into_iter().map(Pending::settled);
        let results: Vec<Result<T, RequestError>> = if options.abort_on_error {
            try_join_all(waits).await?.into_iter().map(Ok).collect()
        } else {
            join_all(waits).await
        };

        let outcomes: Vec<BatchOutcome<T>> = results.into_iter().map(BatchOutcome::from).collect();
        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        info!(lane, count = outcomes.len(), failed, "Batch finished");
        Ok(outcomes)
    }
}
