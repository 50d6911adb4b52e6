//! Bounded retry of transient failures and rate-limit governance.
//!
//! [`RetryPolicy::run`] retries only [`ErrorClass::Transient`]; rate-limit
//! errors propagate immediately so the caller can back off. A
//! [`RateGovernor`] is owned by one API client and passed explicitly to the
//! bulk paths that need to pace themselves.

use std::fmt::Display;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sitesync_core::config::SyncConfig;

use crate::error::{Classify, ErrorClass};

// ---------------------------------------------------------------------------
// Sleeper
// ---------------------------------------------------------------------------

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Blocks the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Records requested sleeps without blocking.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Fixed-attempt, fixed-backoff retry.
#[derive(Clone)]
pub struct RetryPolicy {
    attempts: u32,
    backoff: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicy {
    /// `attempts` is the total number of tries, at least one.
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.retry_attempts, config.retry_backoff())
    }

    /// One attempt, no sleeping.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn run<T, E, F>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: Classify + Display,
        F: FnMut() -> Result<T, E>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.class() == ErrorClass::Transient && attempt < self.attempts => {
                    tracing::warn!(
                        "{label}: attempt {attempt}/{} failed: {err}; retrying in {:?}",
                        self.attempts,
                        self.backoff
                    );
                    self.sleeper.sleep(self.backoff);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("attempts", &self.attempts)
            .field("backoff", &self.backoff)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RateGovernor
// ---------------------------------------------------------------------------

/// Remote API budget as last reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Paces bulk API usage against the last observed [`RateLimit`].
pub struct RateGovernor {
    cutoff: u32,
    delay: Duration,
    last: Mutex<Option<RateLimit>>,
    sleeper: Arc<dyn Sleeper>,
}

impl RateGovernor {
    pub fn new(cutoff: u32, delay: Duration) -> Self {
        Self {
            cutoff,
            delay,
            last: Mutex::new(None),
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.rate_limit_cutoff, config.call_delay())
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Record a budget reading, e.g. from response headers or a
    /// rate-limit error.
    pub fn observe(&self, limit: RateLimit) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(limit);
        }
    }

    /// Budget exhausted until `reset_at`.
    pub fn exhausted(&self, reset_at: DateTime<Utc>) {
        self.observe(RateLimit { remaining: 0, reset_at });
    }

    pub fn last(&self) -> Option<RateLimit> {
        self.last.lock().ok().and_then(|l| *l)
    }

    /// Sleep before the next bulk call.
    pub fn throttle(&self) {
        self.throttle_at(Utc::now());
    }

    /// Below the cutoff sleep until reset, otherwise sleep the fixed delay.
    pub fn throttle_at(&self, now: DateTime<Utc>) {
        let pause = self.pause_at(now);
        if let Some(limit) = self.last() {
            if limit.remaining < self.cutoff {
                tracing::info!(
                    "rate limit low ({} remaining), sleeping {:?} until {}",
                    limit.remaining,
                    pause,
                    limit.reset_at
                );
            }
        }
        self.sleeper.sleep(pause);
    }

    /// How long [`throttle_at`](Self::throttle_at) would sleep.
    pub fn pause_at(&self, now: DateTime<Utc>) -> Duration {
        match self.last() {
            Some(limit) if limit.remaining < self.cutoff => {
                (limit.reset_at - now).to_std().unwrap_or(Duration::ZERO)
            }
            _ => self.delay,
        }
    }
}

impl std::fmt::Debug for RateGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGovernor")
            .field("cutoff", &self.cutoff)
            .field("delay", &self.delay)
            .field("last", &self.last())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::cell::Cell;

    fn policy(attempts: u32) -> (RetryPolicy, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::new());
        let policy = RetryPolicy::new(attempts, Duration::from_millis(10)).with_sleeper(sleeper.clone());
        (policy, sleeper)
    }

    #[test]
    fn transient_errors_retry_until_success() {
        let (policy, sleeper) = policy(3);
        let calls = Cell::new(0);
        let result = policy.run("op", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(SyncError::Transient("502".into()))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.get(), 3);
        assert_eq!(sleeper.sleeps().len(), 2);
    }

    #[test]
    fn transient_errors_surface_after_bound() {
        let (policy, _) = policy(2);
        let calls = Cell::new(0);
        let result: Result<(), _> = policy.run("op", || {
            calls.set(calls.get() + 1);
            Err(SyncError::Transient("timeout".into()))
        });
        assert!(matches!(result, Err(SyncError::Transient(_))));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn rate_limited_is_never_retried() {
        let (policy, sleeper) = policy(5);
        let calls = Cell::new(0);
        let result: Result<(), _> = policy.run("op", || {
            calls.set(calls.get() + 1);
            Err(SyncError::RateLimited { reset_at: Utc::now() })
        });
        assert!(matches!(result, Err(SyncError::RateLimited { .. })));
        assert_eq!(calls.get(), 1);
        assert!(sleeper.sleeps().is_empty());
    }

    #[test]
    fn fatal_and_not_found_are_not_retried() {
        let (policy, _) = policy(5);
        for err in [SyncError::Fatal("bad".into()), SyncError::not_found("repo")] {
            let calls = Cell::new(0);
            let mut err = Some(err);
            let _: Result<(), _> = policy.run("op", || {
                calls.set(calls.get() + 1);
                Err(err.take().unwrap_or_else(|| SyncError::Fatal("again".into())))
            });
            assert_eq!(calls.get(), 1);
        }
    }

    #[test]
    fn governor_sleeps_fixed_delay_with_budget() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let governor = RateGovernor::new(100, Duration::from_millis(50)).with_sleeper(sleeper.clone());
        let now = Utc::now();
        governor.throttle_at(now);
        governor.observe(RateLimit { remaining: 4_000, reset_at: now });
        governor.throttle_at(now);
        assert_eq!(sleeper.sleeps(), vec![Duration::from_millis(50); 2]);
    }

    #[test]
    fn governor_sleeps_until_reset_below_cutoff() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let governor = RateGovernor::new(100, Duration::from_millis(50)).with_sleeper(sleeper.clone());
        let now = Utc::now();
        governor.observe(RateLimit {
            remaining: 10,
            reset_at: now + chrono::Duration::seconds(30),
        });
        governor.throttle_at(now);
        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(30)]);
    }

    #[test]
    fn governor_past_reset_does_not_sleep() {
        let governor = RateGovernor::new(100, Duration::from_millis(50));
        let now = Utc::now();
        governor.exhausted(now - chrono::Duration::seconds(5));
        assert_eq!(governor.pause_at(now), Duration::ZERO);
    }
}
