//! Retry policies for fetch and mutation functions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::QueryError;

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// No delay between retries.
    None,
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff with base and max.
    Exponential {
        /// Delay before the first retry.
        base: Duration,
        /// Upper bound for any delay.
        max: Duration,
        /// Randomize each delay into `[delay / 2, delay]`.
        jitter: bool,
    },
}

impl BackoffStrategy {
    /// Calculate delay for a given retry number (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed(d) => *d,
            Self::Exponential { base, max, jitter } => {
                let multiplier = 2u32.saturating_pow(attempt);
                let delay = base.saturating_mul(multiplier).min(*max);
                if *jitter && !delay.is_zero() {
                    let half = delay / 2;
                    rand::thread_rng().gen_range(half..=delay)
                } else {
                    delay
                }
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: true,
        }
    }
}

type RetryPredicate = Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>;

/// Retry policy configuration.
///
/// `max_retries` counts retries after the first attempt, so the default policy
/// calls a failing fetcher four times before settling on the error.
///
/// # Example
///
/// ```
/// use refetch::RetryPolicy;
///
/// // Give up immediately on 4xx, otherwise retry up to three times.
/// let policy = RetryPolicy::new(3).when(|_, err| !err.is_client_error());
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries.
    pub max_retries: u32,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    predicate: Option<RetryPredicate>,
}

impl RetryPolicy {
    /// Create a policy that retries up to `max_retries` times.
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: BackoffStrategy::default(),
            predicate: None,
        }
    }

    /// Create a policy with no retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffStrategy::None,
            predicate: None,
        }
    }

    /// Set backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Only retry when `predicate(failures_so_far, error)` returns `true`.
    ///
    /// The predicate is consulted in addition to `max_retries`. Pass
    /// `u32::MAX` to [`RetryPolicy::new`] to let the predicate decide alone.
    #[must_use]
    pub fn when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(u32, &QueryError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Whether another attempt should follow `failures` failed attempts ending in `err`.
    #[must_use]
    pub fn should_retry(&self, failures: u32, err: &QueryError) -> bool {
        if failures >= self.max_retries || matches!(err, QueryError::Cancelled | QueryError::Shutdown) {
            return false;
        }
        self.predicate
            .as_ref()
            .is_none_or(|predicate| predicate(failures, err))
    }

    /// Delay before retry number `retry` (0-indexed).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff.delay_for_attempt(retry)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl From<u32> for RetryPolicy {
    fn from(max_retries: u32) -> Self {
        Self::new(max_retries)
    }
}

impl From<bool> for RetryPolicy {
    fn from(retry: bool) -> Self {
        if retry { Self::default() } else { Self::none() }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}
