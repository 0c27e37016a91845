//! Operation trait and per-request options

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::Priority;
use crate::progress::{ProgressCallback, ProgressReporter};

/// A unit of work the scheduler runs on a caller's behalf
///
/// The scheduler imposes nothing on what `execute` does (network I/O, file
/// uploads, ...). It only needs a result or an error, and forwards whatever the
/// operation reports through `progress`.
#[async_trait]
pub trait Operation<T>: Send + Sync {
    async fn execute(&self, progress: ProgressReporter) -> eyre::Result<T>;
}

#[async_trait]
impl<T, F, Fut> Operation<T> for F
where
    T: Send + 'static,
    F: Fn(ProgressReporter) -> Fut + Send + Sync,
    Fut: Future<Output = eyre::Result<T>> + Send + 'static,
{
    async fn execute(&self, progress: ProgressReporter) -> eyre::Result<T> {
        (self)(progress).await
    }
}

/// Operations are shared so `retry` can run them again
pub type SharedOperation<T> = Arc<dyn Operation<T>>;

/// Per-request options; unset fields fall back to the scheduler config
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub priority: Option<Priority>,
    pub cache_duration: Option<Duration>,
    pub force_refresh: bool,
    pub on_progress: Option<ProgressCallback>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn cache_duration(mut self, duration: Duration) -> Self {
        self.cache_duration = Some(duration);
        self
    }

    pub fn cache_duration_ms(self, millis: u64) -> Self {
        self.cache_duration(Duration::from_millis(millis))
    }

    /// Skip the cache and always execute
    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("priority", &self.priority)
            .field("cache_duration", &self.cache_duration)
            .field("force_refresh", &self.force_refresh)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Options with every default filled in
#[derive(Clone)]
pub(crate) struct ResolvedOptions {
    pub priority: Priority,
    pub cache_duration: Duration,
    pub force_refresh: bool,
    pub on_progress: Option<ProgressCallback>,
}

impl RequestOptions {
    pub(crate) fn resolve(self, default_priority: Priority, default_cache_duration: Duration) -> ResolvedOptions {
        ResolvedOptions {
            priority: self.priority.unwrap_or(default_priority),
            cache_duration: self.cache_duration.unwrap_or(default_cache_duration),
            force_refresh: self.force_refresh,
            on_progress: self.on_progress,
        }
    }
}
