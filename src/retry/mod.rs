//! Bounded retry with exponential backoff and jitter.
//!
//! A [`RetryPolicy`] is a plain value handed to each call site, so every
//! provider call can be retried (and tested) on its own. An operation is
//! attempted at most `max_retries` times (at least once). Delays follow
//! `base_delay * backoff^attempt + jitter`, capped at `max_delay`.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use crate::config::RetryConfig;

/// Errors that know whether another attempt could help.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Terminal failure of a retried operation. Always carries the last error.
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("{operation} gave up after {attempts} attempts")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        last: E,
    },

    #[error("{operation} failed permanently")]
    Rejected {
        operation: &'static str,
        #[source]
        last: E,
    },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    pub fn last(&self) -> &E {
        match self {
            Self::Exhausted { last, .. } | Self::Rejected { last, .. } => last,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero still makes one attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff: f64,
    /// Inclusive bounds of the random term added to every delay.
    pub jitter_range: (Duration, Duration),
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        let lo = c.jitter_min_ms.min(c.jitter_max_ms);
        let hi = c.jitter_min_ms.max(c.jitter_max_ms);
        Self {
            max_retries: c.max_retries,
            base_delay: Duration::from_millis(c.base_delay_ms),
            backoff: c.backoff,
            jitter_range: (Duration::from_millis(lo), Duration::from_millis(hi)),
            max_delay: Duration::from_millis(c.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    #[cfg(test)]
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            backoff: 1.0,
            jitter_range: (Duration::ZERO, Duration::ZERO),
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scale = self.backoff.max(0.0).powi(attempt.min(i32::MAX as u32) as i32);
        let base = self.base_delay.as_secs_f64() * scale;

        let (lo, hi) = self.jitter_range;
        let jitter = if hi > lo {
            rand::random_range(lo.as_secs_f64()..=hi.as_secs_f64())
        } else {
            lo.as_secs_f64()
        };

        let secs = (base + jitter).min(self.max_delay.as_secs_f64());
        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// One delay between each pair of attempts.
    fn delays(self) -> impl Iterator<Item = Duration> {
        (0..self.max_attempts() - 1).map(move |attempt| self.delay_for(attempt))
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// retry budget is spent.
    pub async fn run<T, E, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, RetryError<E>>
    where
        E: Retryable + std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempts = 0u32;
        let max_attempts = self.max_attempts();

        let outcome = RetryIf::start(
            self.delays(),
            || {
                attempts += 1;
                let attempt = attempts;
                let fut = op();
                async move {
                    let res = fut.await;
                    if let Err(e) = &res {
                        if attempt < max_attempts && e.is_transient() {
                            warn!("{} failed (attempt {}): {}", operation, attempt, e);
                        }
                    }
                    res
                }
            },
            |e: &E| e.is_transient(),
        )
        .await;

        match outcome {
            Ok(v) => {
                if attempts > 1 {
                    debug!("{} succeeded after {} attempts", operation, attempts);
                }
                Ok(v)
            }
            Err(last) if last.is_transient() => Err(RetryError::Exhausted {
                operation,
                attempts,
                last,
            }),
            Err(last) => Err(RetryError::Rejected { operation, last }),
        }
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} attempts, base {:?} x{} (+{:?}..{:?}), cap {:?}",
            self.max_retries,
            self.base_delay,
            self.backoff,
            self.jitter_range.0,
            self.jitter_range.1,
            self.max_delay
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
