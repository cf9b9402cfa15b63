//! The query client.
//!
//! [`QueryClient`] is the one object an application holds: it owns the entry
//! store, runs fetches, and exposes the imperative cache operations (reads,
//! writes, invalidation, cancellation, garbage collection). It is cheap to clone;
//! clones share the same cache.
//!
//! # Example
//!
//! ```rust,no_run
//! use refetch::prelude::*;
//! use std::time::Duration;
//!
//! # async fn fetch_posts(page: u32) -> Result<Vec<String>, QueryError> {
//! #     Ok(vec![format!("post {page}")])
//! # }
//! # async fn run() -> Result<(), QueryError> {
//! let client = QueryClient::with_config(
//!     QueryConfig::new(Duration::from_secs(30), Duration::from_secs(300)),
//! );
//! client.spawn_gc();
//!
//! client.prefetch_query(&query_key!["posts", 2], |_ctx| fetch_posts(2), QueryOptions::default()).await?;
//! client.invalidate_queries(&query_key!["posts"])?;
//! # Ok(())
//! # }
//! ```

pub(crate) mod fetch;
pub(crate) mod gc;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::key::{CanonicalKey, QueryKey};
use crate::persist::{ErasedPersist, TypedPersist};
use crate::query::{EntryDependency, QueryObserver, QueryOptions, QueryResult, Settings};
use crate::store::{AnyData, EntrySnapshot, ListenerId, QueryEntry, QueryStore};

use fetch::{AttemptFn, FetchContext, FetchJob, NextPageFn, RefetchFn, SharedFetch};

pub(crate) type Sink<T> = Box<dyn Fn(&QueryResult<T>) + Send + Sync>;

/// A client for managing the query cache.
///
/// The `QueryClient` is the central state manager for queries. It handles:
/// - Caching query results under canonical keys
/// - Deduplicating and retrying fetches
/// - Invalidation and refetching of subscribed queries
/// - Mutations with optimistic updates
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    store: Arc<QueryStore>,
    config: QueryConfig,
    mutating: AtomicUsize,
    shutdown: CancellationToken,
    gc: Mutex<Option<gc::Handle>>,
}

/// How an entry's fetching is set up when it is registered.
pub(crate) struct Registration<T, U = T> {
    pub refetch: RefetchFn,
    pub next_page: Option<NextPageFn>,
    pub options: QueryOptions<T, U>,
    pub settings: Settings,
}

impl QueryClient {
    /// Creates a new query client with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(QueryConfig::default())
    }

    /// Creates a new query client with the given configuration.
    #[must_use]
    pub fn with_config(config: QueryConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                store: Arc::new(QueryStore::new()),
                config,
                mutating: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
                gc: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &QueryConfig {
        &self.inner.config
    }

    /// The underlying entry store.
    #[must_use]
    pub fn store(&self) -> &QueryStore {
        &self.inner.store
    }

    /// Subscribes to `key`, fetching with `fetcher` if the cached data is missing
    /// or stale.
    pub fn query<T, U, F, Fut>(
        &self,
        key: &QueryKey,
        fetcher: F,
        options: QueryOptions<T, U>,
    ) -> Result<QueryObserver<U>, QueryError>
    where
        T: Clone + Send + Sync + 'static,
        U: Clone + Send + Sync + 'static,
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        let registration = self.registration(fetcher, options);
        self.observe(key, registration, None)
    }

    /// Like [`query`](Self::query), additionally calling `sink` synchronously with
    /// every new result.
    pub fn query_with_sink<T, U, F, Fut, S>(
        &self,
        key: &QueryKey,
        fetcher: F,
        options: QueryOptions<T, U>,
        sink: S,
    ) -> Result<QueryObserver<U>, QueryError>
    where
        T: Clone + Send + Sync + 'static,
        U: Clone + Send + Sync + 'static,
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
        S: Fn(&QueryResult<U>) + Send + Sync + 'static,
    {
        let registration = self.registration(fetcher, options);
        self.observe(key, registration, Some(Box::new(sink)))
    }

    /// Fetches `key` unless its data is fresh and returns the data. Errors are
    /// returned to the caller.
    pub async fn fetch_query<T, F, Fut>(&self, key: &QueryKey, fetcher: F, options: QueryOptions<T>) -> Result<T, QueryError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        let canonical = key.canonical()?;
        let registration = self.registration(fetcher, options);
        self.register(key, &canonical, registration, false)?;

        let data = match self.fetch_if_stale(&canonical) {
            Some(fetch) => self.wait_fetch(&canonical, fetch).await?,
            None => self
                .inner
                .store
                .get(&canonical)
                .and_then(|snapshot| snapshot.data)
                .ok_or(QueryError::Cancelled)?,
        };
        downcast(key, &data)
    }

    /// Warms the cache for `key` without subscribing. Fetch failures are logged,
    /// not returned; only an invalid key is an error.
    ///
    /// The entry's cache-time clock starts now.
    pub async fn prefetch_query<T, F, Fut>(&self, key: &QueryKey, fetcher: F, options: QueryOptions<T>) -> Result<(), QueryError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        let canonical = key.canonical()?;
        let registration = self.registration(fetcher, options);
        self.register(key, &canonical, registration, false)?;

        if let Some(fetch) = self.fetch_if_stale(&canonical) {
            if let Err(err) = self.wait_fetch(&canonical, fetch).await {
                debug!(%key, error = %err, "prefetch failed");
            }
        }
        Ok(())
    }

    /// Reads the cached data for `key` without fetching.
    pub fn get_query_data<T: Clone + 'static>(&self, key: &QueryKey) -> Result<Option<T>, QueryError> {
        let canonical = key.canonical()?;
        gc::evict_if_expired(&self.inner.store, &canonical, Instant::now());
        let Some(data) = self.inner.store.get(&canonical).and_then(|snapshot| snapshot.data) else {
            return Ok(None);
        };
        downcast(key, &data).map(Some)
    }

    /// Writes `data` to `key` as if it had just been fetched, creating the entry if
    /// needed. Subscribers are notified.
    pub fn set_query_data<T: Send + Sync + 'static>(&self, key: &QueryKey, data: T) -> Result<(), QueryError> {
        let canonical = key.canonical()?;
        self.write(key, &canonical, Arc::new(data));
        Ok(())
    }

    /// Replaces the data of `key` with `update(current)`.
    pub fn update_query_data<T, F>(&self, key: &QueryKey, update: F) -> Result<(), QueryError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Option<T>) -> T,
    {
        let current = self.get_query_data::<T>(key)?;
        self.set_query_data(key, update(current))
    }

    /// A snapshot of the entry for `key`, if cached.
    pub fn get_query_state(&self, key: &QueryKey) -> Result<Option<EntrySnapshot>, QueryError> {
        let canonical = key.canonical()?;
        gc::evict_if_expired(&self.inner.store, &canonical, Instant::now());
        Ok(self.inner.store.get(&canonical))
    }

    /// Marks every entry under `prefix` stale. Entries with subscribers refetch
    /// right away; the rest refetch when next subscribed. Returns the number of
    /// entries invalidated.
    pub fn invalidate_queries(&self, prefix: &QueryKey) -> Result<usize, QueryError> {
        let prefix = prefix.canonical()?;
        let keys = self.inner.store.keys_where(|entry| entry.canonical.starts_with(&prefix));

        for canonical in &keys {
            let active = self
                .inner
                .store
                .modify(canonical, |entry| {
                    entry.invalidated = true;
                    entry.subscriber_count > 0
                })
                .unwrap_or(false);

            let refetched = active && self.is_fetchable(canonical) && self.refetch_entry(canonical).is_some();
            if !refetched {
                self.inner.store.notify(canonical);
            }
        }

        debug!(%prefix, count = keys.len(), "invalidated queries");
        Ok(keys.len())
    }

    /// Refetches every enabled entry under `prefix` now, whether or not it is
    /// subscribed, and waits for all of them to settle. Failures are reflected in
    /// the entries, not returned.
    pub async fn refetch_queries(&self, prefix: &QueryKey) -> Result<usize, QueryError> {
        let prefix = prefix.canonical()?;
        let keys = self.inner.store.keys_where(|entry| entry.canonical.starts_with(&prefix));

        let mut fetches = Vec::new();
        for canonical in keys {
            if !self.is_fetchable(&canonical) {
                continue;
            }
            if let Some(fetch) = self.refetch_entry(&canonical) {
                fetches.push(async move {
                    let _ = self.wait_fetch(&canonical, fetch).await;
                });
            }
        }

        let count = fetches.len();
        futures::future::join_all(fetches).await;
        Ok(count)
    }

    /// Removes every entry under `prefix`, cancelling their fetches and clearing
    /// their persisted copies. Returns the removed keys.
    pub fn remove_queries(&self, prefix: &QueryKey) -> Result<Vec<QueryKey>, QueryError> {
        let prefix = prefix.canonical()?;
        let removed = self.inner.store.take_where(|entry| entry.canonical.starts_with(&prefix));
        let keys = removed
            .into_iter()
            .map(|entry| {
                if let Some(pending) = &entry.pending {
                    pending.token.cancel();
                }
                if let Some(persist) = &entry.persist {
                    persist.clear(&entry.key);
                }
                entry.key
            })
            .collect::<Vec<_>>();
        debug!(%prefix, count = keys.len(), "removed queries");
        Ok(keys)
    }

    /// Cancels in-flight fetches under `prefix`. Each entry returns to the state
    /// it had before its fetch started. Returns the number of fetches cancelled.
    pub fn cancel_queries(&self, prefix: &QueryKey) -> Result<usize, QueryError> {
        let prefix = prefix.canonical()?;
        let keys = self
            .inner
            .store
            .keys_where(|entry| entry.pending.is_some() && entry.canonical.starts_with(&prefix));
        Ok(keys
            .iter()
            .filter(|canonical| fetch::cancel(&self.inner.store, canonical))
            .count())
    }

    /// Number of fetches in flight.
    #[must_use]
    pub fn is_fetching(&self) -> usize {
        self.inner.store.keys_where(|entry| entry.pending.is_some()).len()
    }

    /// Number of mutations running.
    #[must_use]
    pub fn is_mutating(&self) -> usize {
        self.inner.mutating.load(Ordering::SeqCst)
    }

    /// The host regained focus: refetches stale, subscribed entries that opted in.
    /// Returns the number of fetches started.
    pub fn on_focus(&self) -> usize {
        self.refetch_active(|entry| entry.refetch_on_focus)
    }

    /// The host regained connectivity: refetches stale, subscribed entries that
    /// opted in. Returns the number of fetches started.
    pub fn on_reconnect(&self) -> usize {
        self.refetch_active(|entry| entry.refetch_on_reconnect)
    }

    /// Runs one garbage-collection sweep and returns the evicted keys.
    pub fn gc(&self) -> Vec<QueryKey> {
        gc::sweep(&self.inner.store, Instant::now())
    }

    /// Starts the background sweeper, running every
    /// [`gc_interval`](QueryConfig::gc_interval). Calling it again is a no-op.
    pub fn spawn_gc(&self) {
        let mut slot = self.inner.gc.lock();
        if slot.is_some() || self.inner.shutdown.is_cancelled() {
            return;
        }
        *slot = Some(gc::spawn(
            Arc::downgrade(&self.inner.store),
            self.inner.config.gc_interval,
            self.inner.shutdown.child_token(),
        ));
        debug!(interval = ?self.inner.config.gc_interval, "gc sweeper started");
    }

    /// Stops the sweeper, cancels every fetch and empties the cache. Later
    /// subscriptions fail with [`QueryError::Shutdown`].
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.gc.lock().take();
        if let Some(handle) = handle {
            handle.cancel().await;
        }
        let removed = self.inner.store.take_where(|_| true);
        for entry in &removed {
            if let Some(pending) = &entry.pending {
                pending.token.cancel();
            }
        }
        debug!(removed = removed.len(), "query client shut down");
    }

    pub(crate) fn ensure_running(&self) -> Result<(), QueryError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(QueryError::Shutdown);
        }
        Ok(())
    }

    /// Builds the registration for a plain fetcher.
    fn registration<T, U, F, Fut>(&self, fetcher: F, options: QueryOptions<T, U>) -> Registration<T, U>
    where
        T: Send + Sync + 'static,
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        let settings = options.settings(&self.inner.config);
        let attempt: AttemptFn = Arc::new(move |ctx: FetchContext| {
            let fetch = fetcher(ctx);
            async move { fetch.await.map(|data| Arc::new(data) as AnyData) }.boxed()
        });
        let retry = settings.retry.clone();
        let timeout = settings.timeout;
        let refetch: RefetchFn = Arc::new(move |_current: Option<&AnyData>| FetchJob {
            attempt: attempt.clone(),
            merge: None,
            retry: retry.clone(),
            timeout,
        });
        Registration {
            refetch,
            next_page: None,
            options,
            settings,
        }
    }

    /// Creates or updates the entry for `key` with a registration's settings and
    /// recipes. With `attach`, one subscriber is added. Returns the entry's id.
    pub(crate) fn register<T, U>(
        &self,
        key: &QueryKey,
        canonical: &CanonicalKey,
        registration: Registration<T, U>,
        attach: bool,
    ) -> Result<u64, QueryError>
    where
        T: Send + Sync + 'static,
    {
        self.ensure_running()?;
        let Registration {
            refetch,
            next_page,
            options,
            settings,
        } = registration;

        let dependency = match options.dependency {
            Some(dependency) => Some(EntryDependency {
                canonical: dependency.key.canonical()?,
                predicate: dependency.predicate,
            }),
            None => None,
        };

        let now = Instant::now();
        let store = &self.inner.store;
        gc::evict_if_expired(store, canonical, now);

        let needs_seed = store.get(canonical).is_none_or(|snapshot| !snapshot.has_data());
        let seed = if needs_seed {
            options
                .initial_data
                .or_else(|| options.persist.as_ref().and_then(|storage| storage.load_initial(key)))
        } else {
            None
        };
        let persist = options
            .persist
            .map(|storage| Arc::new(TypedPersist(storage)) as Arc<dyn ErasedPersist>);

        let (id, seeded) = store.modify_or_insert(canonical, self.blank(key, canonical), |entry| {
            if attach {
                entry.attach(now);
            } else {
                entry.last_accessed_at = now;
            }
            settings.apply(entry);
            entry.refetch = Some(refetch);
            entry.next_page = next_page;
            entry.dependency = dependency;
            if persist.is_some() {
                entry.persist = persist;
            }
            let seeded = match seed {
                Some(seed) if entry.data.is_none() => {
                    entry.update(Arc::new(seed), now);
                    true
                }
                _ => false,
            };
            (entry.id, seeded)
        });
        if seeded {
            trace!(%key, "seeded query data");
            store.notify(canonical);
        }
        Ok(id)
    }

    /// Registers and subscribes, returning the observer.
    pub(crate) fn observe<T, U>(
        &self,
        key: &QueryKey,
        registration: Registration<T, U>,
        sink: Option<Sink<U>>,
    ) -> Result<QueryObserver<U>, QueryError>
    where
        T: Send + Sync + 'static,
        U: Clone + Send + Sync + 'static,
    {
        let canonical = key.canonical()?;
        let select = Arc::clone(&registration.options.select);
        let entry_id = self.register(key, &canonical, registration, true)?;

        let store = &self.inner.store;
        let removed = EntrySnapshot::removed(key.clone());
        let (tx, mut rx) = watch::channel(QueryResult::project(&removed, Instant::now(), &*select));
        let tx = Arc::new(tx);

        let mut listeners: Vec<(CanonicalKey, ListenerId)> = Vec::new();
        let publish = Arc::clone(&tx);
        let project = Arc::clone(&select);
        // The first result is read after the listener is in place, so a fetch
        // settling meanwhile is never missed.
        let id = store.add_listener_with(
            &canonical,
            Arc::new(move |snapshot: &EntrySnapshot| {
                let result = QueryResult::project(snapshot, Instant::now(), &*project);
                if let Some(sink) = &sink {
                    sink(&result);
                }
                publish.send_replace(result);
            }),
            |current| {
                let current = current.unwrap_or(removed);
                tx.send_replace(QueryResult::project(&current, Instant::now(), &*select));
            },
        );
        drop(rx.borrow_and_update());
        listeners.push((canonical.clone(), id));

        let dependency = store.modify(&canonical, |entry| entry.dependency.clone()).flatten();
        if let Some(dependency) = dependency {
            let weak = Arc::downgrade(&self.inner);
            let target = canonical.clone();
            let predicate = dependency.predicate.clone();
            let id = store.add_listener(
                &dependency.canonical,
                Arc::new(move |snapshot: &EntrySnapshot| {
                    if !predicate(snapshot) {
                        return;
                    }
                    if let Some(inner) = weak.upgrade() {
                        let client = Self { inner };
                        let _ = client.fetch_if_stale(&target);
                    }
                }),
            );
            listeners.push((dependency.canonical, id));
        }

        let _ = self.fetch_if_stale(&canonical);
        trace!(%key, "subscribed");
        Ok(QueryObserver::new(
            self.clone(),
            key.clone(),
            canonical,
            entry_id,
            listeners,
            rx,
        ))
    }

    /// Detaches one subscriber and drops its listeners.
    ///
    /// Only the entry the observer attached to is touched. A key that was removed
    /// and created again holds a different entry.
    pub(crate) fn detach(&self, canonical: &CanonicalKey, entry_id: u64, listeners: &[(CanonicalKey, ListenerId)]) {
        for (key, id) in listeners {
            self.inner.store.remove_listener(key, *id);
        }
        let now = Instant::now();
        let count = self.inner.store.modify(canonical, |entry| {
            (entry.id == entry_id).then(|| {
                entry.detach(now);
                entry.subscriber_count
            })
        });
        match count.flatten() {
            Some(count) => trace!(key = %canonical, subscribers = count, "unsubscribed"),
            None => trace!(key = %canonical, "unsubscribed from a removed entry"),
        }
    }

    /// Starts (or joins) a fetch if the entry is fetchable and stale.
    pub(crate) fn fetch_if_stale(&self, canonical: &CanonicalKey) -> Option<SharedFetch> {
        if !self.is_fetchable(canonical) {
            return None;
        }
        let now = Instant::now();
        let job = self
            .inner
            .store
            .modify(canonical, |entry| {
                if entry.pending.is_none() && !entry.is_stale(now) {
                    return None;
                }
                entry.refetch.as_ref().map(|recipe| recipe(entry.data.as_ref()))
            })
            .flatten()?;
        fetch::start(&self.inner.store, canonical, job, false)
    }

    /// Starts a new fetch generation for the entry, superseding any in flight.
    pub(crate) fn refetch_entry(&self, canonical: &CanonicalKey) -> Option<SharedFetch> {
        if self.ensure_running().is_err() {
            return None;
        }
        let job = self
            .inner
            .store
            .modify(canonical, |entry| entry.refetch.as_ref().map(|recipe| recipe(entry.data.as_ref())))
            .flatten()?;
        fetch::start(&self.inner.store, canonical, job, true)
    }

    /// Starts a fetch built by the entry's next-page recipe, coalescing with any
    /// fetch already in flight. `None` means there is no next page or the entry
    /// may not fetch right now.
    pub(crate) fn start_next_page(&self, canonical: &CanonicalKey) -> Option<SharedFetch> {
        if !self.is_fetchable(canonical) {
            return None;
        }
        let job = self
            .inner
            .store
            .modify(canonical, |entry| {
                if let Some(pending) = &entry.pending {
                    trace!(key = %entry.key, generation = pending.generation, "next page joins in-flight fetch");
                    return Err(pending.result.clone());
                }
                let recipe = entry.next_page.as_ref();
                let data = entry.data.as_ref();
                Ok(recipe.zip(data).and_then(|(recipe, data)| recipe(data)))
            })?;
        match job {
            Err(pending) => Some(pending),
            Ok(Some(job)) => fetch::start(&self.inner.store, canonical, job, false),
            Ok(None) => None,
        }
    }

    pub(crate) async fn wait_fetch(&self, canonical: &CanonicalKey, fetch: SharedFetch) -> Result<AnyData, QueryError> {
        fetch::wait(&self.inner.store, canonical, fetch).await
    }

    pub(crate) fn set_enabled(&self, canonical: &CanonicalKey, enabled: bool) {
        self.inner.store.modify(canonical, |entry| entry.fetch_enabled = enabled);
        if enabled {
            let _ = self.fetch_if_stale(canonical);
        }
    }

    pub(crate) fn cancel_fetch(&self, canonical: &CanonicalKey) -> bool {
        fetch::cancel(&self.inner.store, canonical)
    }

    pub(crate) fn mutation_started(&self) -> MutatingGuard {
        MutatingGuard::new(Arc::clone(&self.inner))
    }

    /// Whether the entry is enabled and its dependency, if any, is satisfied.
    fn is_fetchable(&self, canonical: &CanonicalKey) -> bool {
        if self.ensure_running().is_err() {
            return false;
        }
        let store = &self.inner.store;
        // Read the dependency first: checking it needs another entry.
        let Some((enabled, dependency)) = store.modify(canonical, |entry| (entry.fetch_enabled, entry.dependency.clone())) else {
            return false;
        };
        enabled
            && dependency.is_none_or(|dependency| dependency.is_satisfied(store.get(&dependency.canonical).as_ref()))
    }

    fn refetch_active(&self, opted_in: impl Fn(&QueryEntry) -> bool) -> usize {
        let now = Instant::now();
        let keys = self.inner.store.keys_where(|entry| {
            entry.subscriber_count > 0 && entry.pending.is_none() && opted_in(entry) && entry.is_stale(now)
        });
        keys.iter()
            .filter(|canonical| self.fetch_if_stale(canonical).is_some())
            .count()
    }

    fn write(&self, key: &QueryKey, canonical: &CanonicalKey, data: AnyData) {
        let now = Instant::now();
        let persist = self.inner.store.upsert(canonical, self.blank(key, canonical), |entry| {
            entry.update(data.clone(), now);
            entry.last_accessed_at = now;
            entry.persist.clone()
        });
        if let Some(persist) = persist {
            persist.save(key, &data);
        }
        trace!(%key, "query data set");
    }

    fn blank(&self, key: &QueryKey, canonical: &CanonicalKey) -> impl FnOnce() -> QueryEntry {
        let key = key.clone();
        let canonical = canonical.clone();
        let stale_time = self.inner.config.stale_time;
        let cache_time = self.inner.config.cache_time;
        move || QueryEntry::new(key, canonical, stale_time, cache_time)
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("config", &self.inner.config)
            .field("entries", &self.inner.store.len())
            .field("mutating", &self.is_mutating())
            .finish_non_exhaustive()
    }
}

/// Counts a running mutation until dropped.
pub(crate) struct MutatingGuard {
    inner: Arc<ClientInner>,
}

impl MutatingGuard {
    fn new(inner: Arc<ClientInner>) -> Self {
        inner.mutating.fetch_add(1, Ordering::SeqCst);
        Self { inner }
    }
}

impl Drop for MutatingGuard {
    fn drop(&mut self) {
        self.inner.mutating.fetch_sub(1, Ordering::SeqCst);
    }
}

fn downcast<T: Clone + 'static>(key: &QueryKey, data: &AnyData) -> Result<T, QueryError> {
    data.downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| QueryError::TypeMismatch { key: key.to_string() })
}
