use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::client::fetch::{NextPageFn, PendingFetch, RefetchFn};
use crate::error::QueryError;
use crate::key::{CanonicalKey, QueryKey};
use crate::persist::ErasedPersist;
use crate::query::EntryDependency;

/// Type-erased payload. Entries of different keys hold different types.
pub(crate) type AnyData = Arc<dyn Any + Send + Sync>;

/// Lifecycle state of a cached query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    /// No data and no fetch has run yet, or a first fetch was cancelled.
    Idle,
    /// First fetch in progress, nothing to show yet.
    Loading,
    /// Data is available.
    Success,
    /// The last fetch failed after exhausting its retries.
    Error,
}

/// A cached query with timestamps and fetch bookkeeping.
pub(crate) struct QueryEntry {
    /// Identity of this incarnation of the key; assigned by the store on insert.
    pub id: u64,
    pub key: QueryKey,
    pub canonical: CanonicalKey,
    pub status: QueryStatus,
    pub data: Option<AnyData>,
    pub error: Option<QueryError>,
    pub data_updated_at: Option<Instant>,
    pub last_accessed_at: Instant,
    pub stale_time: Duration,
    pub cache_time: Duration,
    pub subscriber_count: usize,
    pub retry_count: u32,
    pub invalidated: bool,
    pub generation: u64,
    pub pending: Option<PendingFetch>,
    pub fetch_enabled: bool,
    pub refetch_on_focus: bool,
    pub refetch_on_reconnect: bool,
    pub refetch: Option<RefetchFn>,
    pub next_page: Option<NextPageFn>,
    pub persist: Option<Arc<dyn ErasedPersist>>,
    pub dependency: Option<EntryDependency>,
}

impl QueryEntry {
    /// Creates an empty, idle entry.
    pub fn new(key: QueryKey, canonical: CanonicalKey, stale_time: Duration, cache_time: Duration) -> Self {
        Self {
            id: 0,
            key,
            canonical,
            status: QueryStatus::Idle,
            data: None,
            error: None,
            data_updated_at: None,
            last_accessed_at: Instant::now(),
            stale_time,
            cache_time,
            subscriber_count: 0,
            retry_count: 0,
            invalidated: false,
            generation: 0,
            pending: None,
            fetch_enabled: true,
            refetch_on_focus: true,
            refetch_on_reconnect: true,
            refetch: None,
            next_page: None,
            persist: None,
            dependency: None,
        }
    }

    /// The status to show once no fetch is running.
    pub fn settled_status(&self) -> QueryStatus {
        if self.data.is_some() {
            QueryStatus::Success
        } else if self.error.is_some() {
            QueryStatus::Error
        } else {
            QueryStatus::Idle
        }
    }

    /// Checks if this entry is stale at `now`.
    pub fn is_stale(&self, now: Instant) -> bool {
        match self.data_updated_at {
            _ if self.invalidated => true,
            Some(updated) => now.saturating_duration_since(updated) >= self.stale_time,
            None => true,
        }
    }

    /// Checks if this entry should be garbage collected at `now`.
    pub fn should_gc(&self, now: Instant) -> bool {
        self.subscriber_count == 0
            && self.pending.is_none()
            && now.saturating_duration_since(self.last_accessed_at) >= self.cache_time
    }

    /// Replaces the data, resetting timestamps and staleness.
    pub fn update(&mut self, data: AnyData, now: Instant) {
        self.data = Some(data);
        self.data_updated_at = Some(now);
        self.status = QueryStatus::Success;
        self.error = None;
        self.invalidated = false;
        self.retry_count = 0;
    }

    pub fn attach(&mut self, now: Instant) {
        self.subscriber_count += 1;
        self.last_accessed_at = now;
    }

    pub fn detach(&mut self, now: Instant) {
        self.subscriber_count = self.subscriber_count.saturating_sub(1);
        self.last_accessed_at = now;
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            key: self.key.clone(),
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            is_fetching: self.pending.is_some(),
            is_invalidated: self.invalidated,
            data_updated_at: self.data_updated_at,
            stale_time: self.stale_time,
            subscriber_count: self.subscriber_count,
            retry_count: self.retry_count,
        }
    }
}

/// A read-only view of an entry at one point in time.
///
/// Snapshots are what the store hands out; nothing outside the crate mutates an
/// entry directly.
#[derive(Clone)]
pub struct EntrySnapshot {
    pub(crate) key: QueryKey,
    pub(crate) status: QueryStatus,
    pub(crate) data: Option<AnyData>,
    pub(crate) error: Option<QueryError>,
    pub(crate) is_fetching: bool,
    pub(crate) is_invalidated: bool,
    pub(crate) data_updated_at: Option<Instant>,
    pub(crate) stale_time: Duration,
    pub(crate) subscriber_count: usize,
    pub(crate) retry_count: u32,
}

impl EntrySnapshot {
    /// The snapshot listeners receive when their entry is removed.
    pub(crate) fn removed(key: QueryKey) -> Self {
        Self {
            key,
            status: QueryStatus::Idle,
            data: None,
            error: None,
            is_fetching: false,
            is_invalidated: false,
            data_updated_at: None,
            stale_time: Duration::ZERO,
            subscriber_count: 0,
            retry_count: 0,
        }
    }

    #[must_use]
    pub const fn key(&self) -> &QueryKey {
        &self.key
    }

    #[must_use]
    pub const fn status(&self) -> QueryStatus {
        self.status
    }

    /// The cached payload, if present and of type `T`.
    #[must_use]
    pub fn data<T: 'static>(&self) -> Option<&T> {
        self.data.as_ref().and_then(|data| data.downcast_ref::<T>())
    }

    /// Returns `true` if any payload is cached, whatever its type.
    #[must_use]
    pub const fn has_data(&self) -> bool {
        self.data.is_some()
    }

    #[must_use]
    pub const fn error(&self) -> Option<&QueryError> {
        self.error.as_ref()
    }

    #[must_use]
    pub const fn is_fetching(&self) -> bool {
        self.is_fetching
    }

    #[must_use]
    pub const fn is_invalidated(&self) -> bool {
        self.is_invalidated
    }

    /// When the data was last replaced by a successful fetch or a direct write.
    #[must_use]
    pub const fn data_updated_at(&self) -> Option<Instant> {
        self.data_updated_at
    }

    #[must_use]
    pub const fn subscriber_count(&self) -> usize {
        self.subscriber_count
    }

    /// Failed attempts of the fetch currently in flight.
    #[must_use]
    pub const fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Checks staleness at `now` with the entry's stale time.
    #[must_use]
    pub fn is_stale_at(&self, now: Instant) -> bool {
        match self.data_updated_at {
            _ if self.is_invalidated => true,
            Some(updated) => now.saturating_duration_since(updated) >= self.stale_time,
            None => true,
        }
    }
}

impl fmt::Debug for EntrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntrySnapshot")
            .field("key", &self.key)
            .field("status", &self.status)
            .field("has_data", &self.data.is_some())
            .field("error", &self.error)
            .field("is_fetching", &self.is_fetching)
            .field("is_invalidated", &self.is_invalidated)
            .field("subscriber_count", &self.subscriber_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;

    fn entry(stale: Duration, cache: Duration) -> QueryEntry {
        let key = query_key!["posts", 1];
        let canonical = key.canonical().unwrap();
        QueryEntry::new(key, canonical, stale, cache)
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_entry_is_idle_and_stale() {
        let entry = entry(Duration::from_secs(10), Duration::from_secs(60));
        assert_eq!(entry.status, QueryStatus::Idle);
        assert!(entry.is_stale(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_window() {
        let mut entry = entry(Duration::from_millis(2000), Duration::from_secs(60));
        let start = Instant::now();
        entry.update(Arc::new(42_i32), start);

        assert!(!entry.is_stale(start + Duration::from_millis(500)));
        assert!(entry.is_stale(start + Duration::from_millis(2000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_is_stale() {
        let mut entry = entry(Duration::from_secs(600), Duration::from_secs(60));
        let now = Instant::now();
        entry.update(Arc::new(42_i32), now);
        entry.invalidated = true;
        assert!(entry.is_stale(now));

        entry.update(Arc::new(43_i32), now);
        assert!(!entry.is_stale(now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriber_count_never_negative() {
        let mut entry = entry(Duration::ZERO, Duration::from_secs(60));
        let now = Instant::now();
        entry.detach(now);
        assert_eq!(entry.subscriber_count, 0);
        entry.attach(now);
        entry.detach(now);
        entry.detach(now);
        assert_eq!(entry.subscriber_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_gc() {
        let mut entry = entry(Duration::ZERO, Duration::from_secs(60));
        let now = Instant::now();
        entry.attach(now);
        assert!(!entry.should_gc(now + Duration::from_secs(120)));

        entry.detach(now);
        assert!(!entry.should_gc(now + Duration::from_secs(59)));
        assert!(entry.should_gc(now + Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_status() {
        let mut entry = entry(Duration::ZERO, Duration::from_secs(60));
        assert_eq!(entry.settled_status(), QueryStatus::Idle);
        entry.error = Some(QueryError::Timeout(Duration::from_secs(1)));
        assert_eq!(entry.settled_status(), QueryStatus::Error);
        entry.update(Arc::new(1_u8), Instant::now());
        assert_eq!(entry.settled_status(), QueryStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_downcast() {
        let mut entry = entry(Duration::ZERO, Duration::from_secs(60));
        entry.update(Arc::new(String::from("hello")), Instant::now());
        let snapshot = entry.snapshot();
        assert_eq!(snapshot.data::<String>().map(String::as_str), Some("hello"));
        assert_eq!(snapshot.data::<i32>(), None);
        assert!(snapshot.has_data());
        assert_eq!(snapshot.status(), QueryStatus::Success);
    }
}
