//! Query subscriptions.
//!
//! A query is a **subscription** to one cache entry. When you subscribe with
//! [`QueryClient::query`]:
//!
//! 1. If cached data exists, it is visible immediately
//! 2. If the data is stale or missing, a fetch is triggered (or joined)
//! 3. When the entry is invalidated, subscribed queries refetch automatically
//!
//! The returned [`QueryObserver`] is the subscription handle. Dropping it detaches,
//! which starts the entry's cache-time clock; it never cancels a running fetch.
//!
//! # Example
//!
//! ```rust,no_run
//! use refetch::prelude::*;
//! use std::time::Duration;
//!
//! # #[derive(Clone)]
//! # struct User { name: String }
//! # async fn fetch_user(id: u32) -> Result<User, QueryError> {
//! #     Ok(User { name: format!("user {id}") })
//! # }
//! # async fn run() -> Result<(), QueryError> {
//! let client = QueryClient::new();
//! let mut user = client.query(
//!     &query_key!["user", 123],
//!     |_ctx| fetch_user(123),
//!     QueryOptions::default().stale_time(Duration::from_secs(30)),
//! )?;
//!
//! let result = user.wait_until(|r| !r.is_loading()).await;
//! if let Some(user) = result.data() {
//!     println!("{}", user.name);
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;

use crate::client::QueryClient;
use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::key::{CanonicalKey, QueryKey};
use crate::persist::PersistentStorage;
use crate::retry::RetryPolicy;
use crate::store::{EntrySnapshot, ListenerId, QueryEntry, QueryStatus};

pub(crate) type DependencyPredicate = Arc<dyn Fn(&EntrySnapshot) -> bool + Send + Sync>;
pub(crate) type Selector<T, U> = Arc<dyn Fn(&T) -> U + Send + Sync>;

/// A dependency declared through [`QueryOptions::depends_on`].
#[derive(Clone)]
pub(crate) struct Dependency {
    pub key: QueryKey,
    pub predicate: DependencyPredicate,
}

/// A dependency resolved to its canonical key and stored on the dependent entry.
#[derive(Clone)]
pub(crate) struct EntryDependency {
    pub canonical: CanonicalKey,
    pub predicate: DependencyPredicate,
}

impl EntryDependency {
    pub fn is_satisfied(&self, snapshot: Option<&EntrySnapshot>) -> bool {
        snapshot.is_some_and(|snapshot| (self.predicate)(snapshot))
    }
}

/// Per-query options. Anything left unset falls back to the client's
/// [`QueryConfig`].
///
/// `T` is the type the fetcher returns and the cache holds; `U` is what the
/// observer sees, which differs from `T` only after [`select`](Self::select).
pub struct QueryOptions<T, U = T> {
    pub(crate) stale_time: Option<Duration>,
    pub(crate) cache_time: Option<Duration>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) enabled: bool,
    pub(crate) initial_data: Option<T>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) dependency: Option<Dependency>,
    pub(crate) persist: Option<Arc<dyn PersistentStorage<T>>>,
    pub(crate) refetch_on_focus: Option<bool>,
    pub(crate) refetch_on_reconnect: Option<bool>,
    pub(crate) select: Selector<T, U>,
}

impl<T: Clone + 'static> Default for QueryOptions<T> {
    fn default() -> Self {
        Self {
            stale_time: None,
            cache_time: None,
            retry: None,
            enabled: true,
            initial_data: None,
            timeout: None,
            dependency: None,
            persist: None,
            refetch_on_focus: None,
            refetch_on_reconnect: None,
            select: Arc::new(|data: &T| data.clone()),
        }
    }
}

impl<T: Clone + 'static> QueryOptions<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T, U> QueryOptions<T, U> {
    /// How long fetched data counts as fresh.
    #[must_use]
    pub const fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// How long the entry survives without subscribers.
    #[must_use]
    pub const fn cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = Some(cache_time);
        self
    }

    /// Accepts a retry count, `false` to disable retries, or a full [`RetryPolicy`].
    #[must_use]
    pub fn retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    /// With `false` the query never fetches; cached data stays readable.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Seeds an empty entry. Initial data counts as fetched at subscribe time.
    #[must_use]
    pub fn initial_data(mut self, data: T) -> Self {
        self.initial_data = Some(data);
        self
    }

    /// Fails an attempt that takes longer than `timeout`. Timeouts are retried.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Holds fetching until the query at `key` has succeeded with data of type `D`
    /// that satisfies `predicate`.
    ///
    /// ```rust,no_run
    /// # use refetch::prelude::*;
    /// # #[derive(Clone)]
    /// # struct User { active: bool }
    /// # async fn fetch_projects(_user_id: u32) -> Result<Vec<String>, QueryError> { Ok(vec![]) }
    /// # fn demo(client: &QueryClient, user_id: u32) -> Result<(), QueryError> {
    /// let projects = client.query(
    ///     &query_key!["projects", user_id],
    ///     move |_ctx| fetch_projects(user_id),
    ///     QueryOptions::default().depends_on(query_key!["user", user_id], |user: &User| user.active),
    /// )?;
    /// # drop(projects);
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn depends_on<D, P>(mut self, key: QueryKey, predicate: P) -> Self
    where
        D: 'static,
        P: Fn(&D) -> bool + Send + Sync + 'static,
    {
        self.dependency = Some(Dependency {
            key,
            predicate: Arc::new(move |snapshot: &EntrySnapshot| {
                snapshot.status() == QueryStatus::Success && snapshot.data::<D>().is_some_and(&predicate)
            }),
        });
        self
    }

    /// Keeps the payload in `storage` across restarts.
    #[must_use]
    pub fn persist(mut self, storage: Arc<dyn PersistentStorage<T>>) -> Self {
        self.persist = Some(storage);
        self
    }

    #[must_use]
    pub const fn refetch_on_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_focus = Some(enabled);
        self
    }

    #[must_use]
    pub const fn refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.refetch_on_reconnect = Some(enabled);
        self
    }

    /// Derives what this observer sees from the cached data.
    ///
    /// The cache keeps the fetcher's value untouched: other observers of the key,
    /// [`get_query_data`](QueryClient::get_query_data), `fetch_query` and
    /// `prefetch_query` all see the unselected data. A later call replaces the
    /// earlier selector.
    ///
    /// The selector runs whenever the entry changes, sometimes while the store
    /// holds its listener lock, so it must not call back into the client.
    ///
    /// ```rust,no_run
    /// # use refetch::prelude::*;
    /// # async fn fetch_appointments() -> Result<Vec<(u32, bool)>, QueryError> { Ok(vec![]) }
    /// # fn demo(client: &QueryClient) -> Result<(), QueryError> {
    /// let open: QueryObserver<Vec<u32>> = client.query(
    ///     &query_key!["appointments"],
    ///     |_ctx| fetch_appointments(),
    ///     QueryOptions::default().select(|all: &Vec<(u32, bool)>| {
    ///         all.iter().filter(|(_, taken)| !taken).map(|(id, _)| *id).collect()
    ///     }),
    /// )?;
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn select<V, S>(self, select: S) -> QueryOptions<T, V>
    where
        S: Fn(&T) -> V + Send + Sync + 'static,
    {
        QueryOptions {
            stale_time: self.stale_time,
            cache_time: self.cache_time,
            retry: self.retry,
            enabled: self.enabled,
            initial_data: self.initial_data,
            timeout: self.timeout,
            dependency: self.dependency,
            persist: self.persist,
            refetch_on_focus: self.refetch_on_focus,
            refetch_on_reconnect: self.refetch_on_reconnect,
            select: Arc::new(select),
        }
    }

    pub(crate) fn settings(&self, config: &QueryConfig) -> Settings {
        Settings {
            stale_time: self.stale_time.unwrap_or(config.stale_time),
            cache_time: self.cache_time.unwrap_or(config.cache_time),
            retry: self.retry.clone().unwrap_or_else(|| config.retry.clone()),
            timeout: self.timeout,
            enabled: self.enabled,
            refetch_on_focus: self.refetch_on_focus.unwrap_or(config.refetch_on_focus),
            refetch_on_reconnect: self.refetch_on_reconnect.unwrap_or(config.refetch_on_reconnect),
        }
    }
}

impl<T, U> fmt::Debug for QueryOptions<T, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .field("retry", &self.retry)
            .field("enabled", &self.enabled)
            .field("has_initial_data", &self.initial_data.is_some())
            .field("timeout", &self.timeout)
            .field("depends_on", &self.dependency.as_ref().map(|d| &d.key))
            .field("persisted", &self.persist.is_some())
            .finish_non_exhaustive()
    }
}

/// Options resolved against the client's config.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub stale_time: Duration,
    pub cache_time: Duration,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    pub enabled: bool,
    pub refetch_on_focus: bool,
    pub refetch_on_reconnect: bool,
}

impl Settings {
    /// Copies the per-entry flags. The most recent registration wins.
    pub fn apply(&self, entry: &mut QueryEntry) {
        entry.stale_time = self.stale_time;
        entry.cache_time = self.cache_time;
        entry.fetch_enabled = self.enabled;
        entry.refetch_on_focus = self.refetch_on_focus;
        entry.refetch_on_reconnect = self.refetch_on_reconnect;
    }
}

/// What a subscriber sees of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
    pub status: QueryStatus,
    /// The latest data; kept through refetches and failed refetches.
    pub data: Option<T>,
    pub error: Option<QueryError>,
    pub is_fetching: bool,
    /// Whether the data is stale and a refetch is due.
    pub is_stale: bool,
}

impl<U> QueryResult<U> {
    /// Builds the result for `snapshot`, passing cached data of type `T` through
    /// `select`. Cached data of any other type is reported as a type mismatch.
    pub(crate) fn project<T: 'static>(snapshot: &EntrySnapshot, now: Instant, select: &dyn Fn(&T) -> U) -> Self {
        let data = snapshot.data::<T>().map(select);
        if snapshot.has_data() && data.is_none() {
            return Self {
                status: QueryStatus::Error,
                data: None,
                error: Some(QueryError::TypeMismatch {
                    key: snapshot.key().to_string(),
                }),
                is_fetching: snapshot.is_fetching(),
                is_stale: true,
            };
        }
        Self {
            status: snapshot.status(),
            data,
            error: snapshot.error().cloned(),
            is_fetching: snapshot.is_fetching(),
            is_stale: snapshot.is_stale_at(now),
        }
    }
}

impl<T> QueryResult<T> {
    /// Returns the data if any is cached, otherwise `None`.
    pub const fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// Returns `true` if the query has no data yet and a first fetch is running.
    pub const fn is_loading(&self) -> bool {
        matches!(self.status, QueryStatus::Loading)
    }

    /// Returns `true` if the query succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self.status, QueryStatus::Success)
    }

    /// Returns `true` if the query failed.
    pub const fn is_error(&self) -> bool {
        matches!(self.status, QueryStatus::Error)
    }

    pub const fn is_idle(&self) -> bool {
        matches!(self.status, QueryStatus::Idle)
    }

    /// Returns `true` if the query data is stale.
    pub const fn is_stale(&self) -> bool {
        self.is_stale
    }
}

/// Subscription handle returned by [`QueryClient::query`].
///
/// Results are delivered through a watch channel: [`result`](Self::result) reads
/// the latest one, [`changed`](Self::changed) waits for the next.
pub struct QueryObserver<T> {
    client: QueryClient,
    key: QueryKey,
    canonical: CanonicalKey,
    entry_id: u64,
    listeners: Vec<(CanonicalKey, ListenerId)>,
    rx: watch::Receiver<QueryResult<T>>,
}

impl<T> QueryObserver<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        client: QueryClient,
        key: QueryKey,
        canonical: CanonicalKey,
        entry_id: u64,
        listeners: Vec<(CanonicalKey, ListenerId)>,
        rx: watch::Receiver<QueryResult<T>>,
    ) -> Self {
        Self {
            client,
            key,
            canonical,
            entry_id,
            listeners,
            rx,
        }
    }

    #[must_use]
    pub const fn key(&self) -> &QueryKey {
        &self.key
    }

    /// The latest result.
    #[must_use]
    pub fn result(&self) -> QueryResult<T> {
        self.rx.borrow().clone()
    }

    /// Waits for the next notification and returns the result it carried.
    pub async fn changed(&mut self) -> QueryResult<T> {
        // The sender lives in a listener this observer owns, so it outlives us.
        let _ = self.rx.changed().await;
        self.rx.borrow_and_update().clone()
    }

    /// Waits until the current or a future result satisfies `predicate`.
    pub async fn wait_until(&mut self, mut predicate: impl FnMut(&QueryResult<T>) -> bool) -> QueryResult<T> {
        if let Ok(result) = self.rx.wait_for(|result| predicate(result)).await {
            return result.clone();
        }
        self.rx.borrow().clone()
    }

    /// Forces a refetch even if the data is fresh, superseding any fetch in flight,
    /// and waits for it to settle.
    pub async fn refetch(&self) -> QueryResult<T> {
        if let Some(fetch) = self.client.refetch_entry(&self.canonical) {
            let _ = self.client.wait_fetch(&self.canonical, fetch).await;
        }
        self.result()
    }

    /// Turns fetching on or off. Enabling fetches right away if the data is stale.
    pub fn set_enabled(&self, enabled: bool) {
        self.client.set_enabled(&self.canonical, enabled);
    }

    /// Every subsequent result as a stream, starting with the current one. The
    /// stream keeps the subscription alive.
    pub fn into_stream(self) -> impl Stream<Item = QueryResult<T>> + Send + Unpin {
        let stream = WatchStream::new(self.rx.clone());
        stream.map(move |result| {
            let _subscription = &self;
            result
        })
    }
}

impl<T> fmt::Debug for QueryObserver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver").field("key", &self.key).finish_non_exhaustive()
    }
}

impl<T> Drop for QueryObserver<T> {
    fn drop(&mut self) {
        self.client.detach(&self.canonical, self.entry_id, &self.listeners);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;

    #[test]
    fn test_settings_fall_back_to_config() {
        let config = QueryConfig::new(Duration::from_secs(1), Duration::from_secs(2)).with_window_refetch(false, true);
        let settings = QueryOptions::<u8>::default().settings(&config);
        assert_eq!(settings.stale_time, Duration::from_secs(1));
        assert_eq!(settings.cache_time, Duration::from_secs(2));
        assert_eq!(settings.retry.max_retries, 3);
        assert!(settings.enabled);
        assert!(!settings.refetch_on_focus);
        assert!(settings.refetch_on_reconnect);
    }

    #[test]
    fn test_options_override_config() {
        let settings = QueryOptions::<u8>::new()
            .stale_time(Duration::from_secs(5))
            .retry(false)
            .enabled(false)
            .refetch_on_focus(false)
            .settings(&QueryConfig::default());
        assert_eq!(settings.stale_time, Duration::from_secs(5));
        assert_eq!(settings.retry.max_retries, 0);
        assert!(!settings.enabled);
        assert!(!settings.refetch_on_focus);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependency_predicate() {
        let options = QueryOptions::<u8>::new().depends_on(query_key!["user"], |id: &u32| *id > 0);
        let Some(dependency) = options.dependency else {
            panic!("dependency not recorded");
        };

        let key = query_key!["user"];
        let mut entry = QueryEntry::new(key.clone(), key.canonical().unwrap(), Duration::ZERO, Duration::ZERO);
        assert!(!(dependency.predicate)(&entry.snapshot()));

        entry.update(Arc::new(0_u32), Instant::now());
        assert!(!(dependency.predicate)(&entry.snapshot()));

        entry.update(Arc::new(7_u32), Instant::now());
        assert!((dependency.predicate)(&entry.snapshot()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_reports_type_mismatch() {
        let key = query_key!["user"];
        let mut entry = QueryEntry::new(key.clone(), key.canonical().unwrap(), Duration::ZERO, Duration::ZERO);
        entry.update(Arc::new("alice".to_string()), Instant::now());

        let result = QueryResult::<u32>::project::<u32>(&entry.snapshot(), Instant::now(), &|id: &u32| *id);
        assert!(result.is_error());
        assert!(matches!(result.error, Some(QueryError::TypeMismatch { .. })));

        let result = QueryResult::<String>::project::<String>(&entry.snapshot(), Instant::now(), &|name: &String| name.clone());
        assert!(result.is_success());
        assert_eq!(result.data().map(String::as_str), Some("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_project_applies_selector() {
        let key = query_key!["user"];
        let mut entry = QueryEntry::new(key.clone(), key.canonical().unwrap(), Duration::ZERO, Duration::ZERO);
        entry.update(Arc::new("alice".to_string()), Instant::now());

        let result = QueryResult::<usize>::project::<String>(&entry.snapshot(), Instant::now(), &|name: &String| name.len());
        assert_eq!(result.data(), Some(&5));
        assert_eq!(entry.snapshot().data::<String>().map(String::as_str), Some("alice"));
    }

    #[test]
    fn test_result_predicates() {
        let result = QueryResult::<u8> {
            status: QueryStatus::Loading,
            data: None,
            error: None,
            is_fetching: true,
            is_stale: true,
        };
        assert!(result.is_loading());
        assert!(!result.is_success());
        assert!(!result.is_error());
        assert!(result.is_stale());
        assert_eq!(result.data(), None);
    }
}
