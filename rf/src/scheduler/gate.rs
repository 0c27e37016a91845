//! Concurrency gate with optional sliding-window rate limiting

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::config::SchedulerConfig;

/// Outcome of asking the gate for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot is free
    Admit,

    /// Every slot is taken; the next release will retry
    AtCapacity,

    /// The rate window is full or admissions are throttled
    RateLimited { retry_after: Duration },
}

/// Sliding window of admission timestamps
#[derive(Debug)]
struct RateWindow {
    limit: usize,
    window: Duration,
    admitted: VecDeque<Instant>,
}

impl RateWindow {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.admitted.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn retry_after(&self, now: Instant) -> Option<Duration> {
        if self.admitted.len() < self.limit {
            return None;
        }
        let oldest = *self.admitted.front()?;
        let wait = self.window.saturating_sub(now.saturating_duration_since(oldest));
        Some(wait.max(Duration::from_millis(1)))
    }
}

/// Counts in-flight operations against a ceiling
#[derive(Debug)]
pub struct ConcurrencyGate {
    ceiling: usize,
    running: usize,
    rate: Option<RateWindow>,
    throttled_until: Option<Instant>,
}

impl ConcurrencyGate {
    pub fn new(ceiling: usize) -> Self {
        debug!(ceiling, "ConcurrencyGate::new: called");
        Self {
            ceiling,
            running: 0,
            rate: None,
            throttled_until: None,
        }
    }

    /// Build the gate described by `config`
    pub fn from_config(config: &SchedulerConfig) -> Self {
        let mut gate = Self::new(config.max_concurrent);
        if let Some(limit) = config.max_requests_per_window {
            gate = gate.with_rate_limit(limit as usize, config.rate_window());
        }
        gate
    }

    pub fn with_rate_limit(mut self, limit: usize, window: Duration) -> Self {
        debug!(limit, ?window, "ConcurrencyGate::with_rate_limit: called");
        self.rate = Some(RateWindow {
            limit,
            window,
            admitted: VecDeque::new(),
        });
        self
    }

    /// Whether one more operation may start at `now`
    pub fn check(&mut self, now: Instant) -> Admission {
        if !self.has_capacity() {
            return Admission::AtCapacity;
        }
        match self.rate_check(now) {
            Some(retry_after) => Admission::RateLimited { retry_after },
            None => Admission::Admit,
        }
    }

    /// Whether a global slot is free
    pub fn has_capacity(&self) -> bool {
        self.running < self.ceiling
    }

    /// How long the throttle or the rate window holds admissions back
    ///
    /// Applies to every admission, whichever ceiling it counts against.
    pub fn rate_check(&mut self, now: Instant) -> Option<Duration> {
        if let Some(until) = self.throttled_until {
            if now < until {
                return Some(until - now);
            }
            self.throttled_until = None;
        }

        let rate = self.rate.as_mut()?;
        rate.prune(now);
        let retry_after = rate.retry_after(now)?;
        debug!(?retry_after, "ConcurrencyGate::rate_check: rate window full");
        Some(retry_after)
    }

    /// Take a slot; callers must have seen `Admission::Admit`
    pub fn acquire(&mut self, now: Instant) {
        self.running += 1;
        self.record_admission(now);
        debug!(running = self.running, ceiling = self.ceiling, "ConcurrencyGate::acquire");
    }

    /// Count an admission against the rate window without taking a slot
    pub fn record_admission(&mut self, now: Instant) {
        if let Some(rate) = self.rate.as_mut() {
            rate.admitted.push_back(now);
        }
    }

    /// Give a slot back
    pub fn release(&mut self) {
        if self.running == 0 {
            warn!("ConcurrencyGate::release: called with no running operations");
            return;
        }
        self.running -= 1;
        debug!(running = self.running, ceiling = self.ceiling, "ConcurrencyGate::release");
    }

    /// Hold back admissions until `now + retry_after`
    pub fn throttle(&mut self, now: Instant, retry_after: Duration) {
        let until = now + retry_after;
        self.throttled_until = Some(match self.throttled_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    pub fn is_rate_limited(&self, now: Instant) -> bool {
        if self.throttled_until.is_some_and(|until| now < until) {
            return true;
        }
        self.rate.as_ref().is_some_and(|rate| {
            let live = rate
                .admitted
                .iter()
                .filter(|t| now.saturating_duration_since(**t) < rate.window)
                .count();
            live >= rate.limit
        })
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn available(&self) -> usize {
        self.ceiling.saturating_sub(self.running)
    }
}
