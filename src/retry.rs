//! ==============================================================================
//! retry.rs - explicit retry policies
//! ==============================================================================
//!
//! purpose:
//!     a retry policy is a plain value handed to whatever needs it, instead of
//!     wrapping functions. the schedule only depends on the attempt number; every
//!     error is treated the same way.
//!
//! schedules:
//!     - quadratic: attempt n (1-indexed) waits min(n², cap) seconds.
//!       used unbounded for relay setup and collector lookup.
//!     - fixed: every attempt waits the same interval.
//!       used bounded for driver-level sensor retries.
//!
//! ==============================================================================

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Upper bound for the quadratic schedule.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Quadratic { cap: Duration },
    Fixed(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Unbounded, min(n², 64) seconds.
    pub fn forever() -> Self {
        Self {
            backoff: Backoff::Quadratic { cap: DEFAULT_BACKOFF_CAP },
            max_attempts: None,
        }
    }

    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            backoff: Backoff::Fixed(interval),
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    /// Delay slept after the `attempt`-th failure (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Quadratic { cap } => {
                let n = u64::from(attempt);
                Duration::from_secs(n.saturating_mul(n)).min(cap)
            }
            Backoff::Fixed(interval) => interval,
        }
    }

    /// Runs `op` until it succeeds. Cancellation is external only.
    pub async fn until_success<T, E, F, Fut>(&self, what: &str, mut op: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    debug!(what, attempt, "completed");
                    return value;
                }
                Err(err) => {
                    self.back_off(what, attempt, &err).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Like `until_success` but stops after `max_attempts` and hands back the last error.
    pub async fn bounded<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        return Err(err);
                    }
                    self.back_off(what, attempt, &err).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn back_off<E: Display>(&self, what: &str, attempt: u32, err: &E) {
        let delay = self.delay(attempt);
        warn!(
            what,
            attempt,
            delay_secs = delay.as_secs_f64(),
            error = %err,
            "sleeping before retry"
        );
        tokio::time::sleep(delay).await;
    }
}
