use std::time::Duration;

use crate::retry::RetryPolicy;

/// Client-wide query defaults.
///
/// These are client-wide defaults; every field except `gc_interval` can be
/// overridden per query through [`QueryOptions`](crate::QueryOptions).
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// How long after a successful fetch the data is served without refetching.
    ///
    /// Past this window the cached data is still shown, but the next subscribe (or
    /// focus, reconnect, invalidation) refetches it in the background.
    pub stale_time: Duration,

    /// How long an unwatched entry survives before the collector drops it.
    ///
    /// The clock starts when the last subscriber detaches (or, for entries that never
    /// had one, when the entry was last read or prefetched).
    pub cache_time: Duration,

    /// Retry policy applied to failed fetches.
    pub retry: RetryPolicy,

    /// How often the background sweeper started by
    /// [`QueryClient::spawn_gc`](crate::QueryClient::spawn_gc) runs.
    pub gc_interval: Duration,

    /// Refetch stale, subscribed queries when the host reports focus regained.
    pub refetch_on_focus: bool,

    /// Refetch stale, subscribed queries when the host reports connectivity restored.
    pub refetch_on_reconnect: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            cache_time: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            gc_interval: Duration::from_secs(1),
            refetch_on_focus: true,
            refetch_on_reconnect: true,
        }
    }
}

impl QueryConfig {
    /// Defaults with the given stale and cache times.
    #[must_use]
    pub fn new(stale_time: Duration, cache_time: Duration) -> Self {
        Self {
            stale_time,
            cache_time,
            ..Self::default()
        }
    }

    /// Sets the default retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = retry.into();
        self
    }

    /// Sets the background sweep interval.
    #[must_use]
    pub const fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Enables or disables refetching on focus and reconnect events.
    #[must_use]
    pub const fn with_window_refetch(mut self, on_focus: bool, on_reconnect: bool) -> Self {
        self.refetch_on_focus = on_focus;
        self.refetch_on_reconnect = on_reconnect;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueryConfig::default();
        assert!(config.stale_time.is_zero());
        assert_eq!(config.cache_time, Duration::from_secs(300));
        assert_eq!(config.gc_interval, Duration::from_secs(1));
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.refetch_on_focus);
    }

    #[test]
    fn test_times_override_defaults() {
        let config = QueryConfig::new(Duration::from_millis(2000), Duration::from_secs(10));
        assert_eq!(config.stale_time.as_millis(), 2000);
        assert_eq!(config.cache_time.as_secs(), 10);
        assert!(config.refetch_on_reconnect);
    }

    #[test]
    fn test_builders() {
        let config = QueryConfig::default()
            .with_retry(0)
            .with_gc_interval(Duration::from_millis(250))
            .with_window_refetch(false, true);
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.gc_interval, Duration::from_millis(250));
        assert!(!config.refetch_on_focus);
        assert!(config.refetch_on_reconnect);
    }
}
