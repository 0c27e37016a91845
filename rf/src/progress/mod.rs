//! Progress relay for in-flight requests
//!
//! An operation receives a [`ProgressReporter`] and may call it any number of
//! times. Each call is forwarded synchronously to the subscriber registered for
//! that invocation, if any. Once the request settles the reporter goes quiet.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, trace};

/// Subscriber receiving percentages in `0..=100`
pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// Handle given to an operation for reporting progress
#[derive(Clone)]
pub struct ProgressReporter {
    key: String,
    subscriber: Option<ProgressCallback>,
    settled: Arc<AtomicBool>,
}

impl ProgressReporter {
    /// Create a reporter for `key` forwarding to `subscriber`
    pub fn new(key: impl Into<String>, subscriber: Option<ProgressCallback>) -> Self {
        Self {
            key: key.into(),
            subscriber,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A reporter nobody listens to
    pub fn detached() -> Self {
        Self::new("", None)
    }

    /// Forward `percent` (clamped to 100) to the subscriber
    ///
    /// No-op once the request has settled or when there is no subscriber.
    pub fn report(&self, percent: u8) {
        if self.settled.load(Ordering::Acquire) {
            debug!(key = %self.key, percent, "ProgressReporter::report: already settled, ignoring");
            return;
        }
        if let Some(subscriber) = &self.subscriber {
            trace!(key = %self.key, percent, "ProgressReporter::report: forwarding");
            subscriber(percent.min(100));
        }
    }

    /// Report `done` out of `total` as a percentage
    pub fn report_ratio(&self, done: u64, total: u64) {
        if total == 0 {
            self.report(100);
            return;
        }
        let percent = (done.min(total) as u128 * 100 / total as u128) as u8;
        self.report(percent);
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn has_subscriber(&self) -> bool {
        self.subscriber.is_some()
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Silence this reporter and every clone of it
    pub(crate) fn settle(&self) {
        self.settled.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("key", &self.key)
            .field("has_subscriber", &self.subscriber.is_some())
            .field("settled", &self.is_settled())
            .finish()
    }
}
