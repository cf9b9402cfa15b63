//! The query entry store.
//!
//! [`QueryStore`] maps canonical keys to entries and fans change notifications out
//! to per-key listeners. It never fetches anything; the fetch coordinator and the
//! client drive it. Listeners are always invoked after the entry lock is released,
//! so a listener may call back into the client.

pub(crate) mod entry;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::key::{CanonicalKey, QueryKey};

pub use entry::{EntrySnapshot, QueryStatus};
pub(crate) use entry::{AnyData, QueryEntry};

pub(crate) type Listener = Arc<dyn Fn(&EntrySnapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_key: HashMap<String, Vec<(ListenerId, Listener)>>,
}

/// Storage for every cached query of a [`QueryClient`](crate::QueryClient).
pub struct QueryStore {
    entries: DashMap<String, QueryEntry>,
    listeners: Mutex<Listeners>,
    generations: AtomicU64,
    entry_ids: AtomicU64,
}

impl QueryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            listeners: Mutex::new(Listeners::default()),
            generations: AtomicU64::new(0),
            entry_ids: AtomicU64::new(0),
        }
    }

    /// Gets a snapshot of the entry for `key`.
    #[must_use]
    pub fn get(&self, key: &CanonicalKey) -> Option<EntrySnapshot> {
        self.entries.get(key.as_str()).map(|entry| entry.snapshot())
    }

    #[must_use]
    pub fn contains(&self, key: &CanonicalKey) -> bool {
        self.entries.contains_key(key.as_str())
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The keys of every cached entry, in no particular order.
    #[must_use]
    pub fn keys(&self) -> Vec<QueryKey> {
        self.entries.iter().map(|entry| entry.key.clone()).collect()
    }

    /// Removes one entry and notifies its listeners.
    pub fn remove(&self, key: &CanonicalKey) -> Option<EntrySnapshot> {
        let entry = self.take(key)?;
        let snapshot = entry.snapshot();
        self.notify_removed(&entry.canonical, &entry.key);
        Some(snapshot)
    }

    /// Removes every entry whose key starts with `prefix` and returns their keys.
    ///
    /// Each affected key's listeners are notified once, after all removals.
    pub fn remove_by_prefix(&self, prefix: &CanonicalKey) -> Vec<QueryKey> {
        self.take_where(|entry| entry.canonical.starts_with(prefix))
            .into_iter()
            .map(|entry| entry.key)
            .collect()
    }

    /// Creates the entry with `create` if missing, applies `mutator`, then notifies.
    pub(crate) fn upsert<R>(
        &self,
        key: &CanonicalKey,
        create: impl FnOnce() -> QueryEntry,
        mutator: impl FnOnce(&mut QueryEntry) -> R,
    ) -> R {
        let result = self.modify_or_insert(key, create, mutator);
        self.notify(key);
        result
    }

    /// Applies `f` to an existing entry without notifying anyone.
    pub(crate) fn modify<R>(&self, key: &CanonicalKey, f: impl FnOnce(&mut QueryEntry) -> R) -> Option<R> {
        self.entries.get_mut(key.as_str()).map(|mut entry| f(&mut entry))
    }

    /// Like [`upsert`](Self::upsert) but silent.
    ///
    /// A newly inserted entry gets a fresh id, so a key that is removed and
    /// created again is a different entry.
    pub(crate) fn modify_or_insert<R>(
        &self,
        key: &CanonicalKey,
        create: impl FnOnce() -> QueryEntry,
        f: impl FnOnce(&mut QueryEntry) -> R,
    ) -> R {
        let mut entry = self.entries.entry(key.as_str().to_owned()).or_insert_with(|| {
            let mut entry = create();
            entry.id = self.entry_ids.fetch_add(1, Ordering::Relaxed) + 1;
            entry
        });
        f(&mut entry)
    }

    /// Sends the current snapshot of `key` to its listeners.
    pub(crate) fn notify(&self, key: &CanonicalKey) {
        // Listeners are collected before the snapshot is read, so a listener
        // added concurrently either sees this snapshot or reads a newer one itself.
        let listeners = self.listeners_for(key);
        if listeners.is_empty() {
            return;
        }
        // The shard guard is dropped before any listener runs.
        let Some(snapshot) = self.get(key) else {
            return;
        };
        for listener in listeners {
            listener(&snapshot);
        }
    }

    fn notify_removed(&self, key: &CanonicalKey, query_key: &QueryKey) {
        let listeners = self.listeners_for(key);
        if listeners.is_empty() {
            return;
        }
        let snapshot = EntrySnapshot::removed(query_key.clone());
        for listener in listeners {
            listener(&snapshot);
        }
    }

    pub(crate) fn take(&self, key: &CanonicalKey) -> Option<QueryEntry> {
        self.entries.remove(key.as_str()).map(|(_, entry)| entry)
    }

    /// Removes the entry for `key` only if `predicate` holds for it.
    pub(crate) fn take_if(&self, key: &CanonicalKey, predicate: impl FnOnce(&QueryEntry) -> bool) -> Option<QueryEntry> {
        let (_, entry) = self.entries.remove_if(key.as_str(), |_, entry| predicate(entry))?;
        self.notify_removed(&entry.canonical, &entry.key);
        Some(entry)
    }

    /// Removes all entries matching `predicate`, then notifies each removed key once.
    pub(crate) fn take_where(&self, mut predicate: impl FnMut(&QueryEntry) -> bool) -> Vec<QueryEntry> {
        // Collect first: removing while iterating would deadlock on the shard lock.
        let candidates: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let removed: Vec<QueryEntry> = candidates
            .into_iter()
            .filter_map(|key| self.entries.remove_if(&key, |_, entry| predicate(entry)))
            .map(|(_, entry)| entry)
            .collect();

        for entry in &removed {
            self.notify_removed(&entry.canonical, &entry.key);
        }
        removed
    }

    /// Canonical keys of all entries matching `predicate`.
    pub(crate) fn keys_where(&self, mut predicate: impl FnMut(&QueryEntry) -> bool) -> Vec<CanonicalKey> {
        self.entries
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.canonical.clone())
            .collect()
    }

    pub(crate) fn add_listener(&self, key: &CanonicalKey, listener: Listener) -> ListenerId {
        Self::push_listener(&mut self.listeners.lock(), key, listener)
    }

    /// Adds `listener` and passes the current snapshot of `key` to `init`.
    ///
    /// `init` runs under the listener lock: any notification that reaches the
    /// new listener reads its snapshot after `init` has returned, so the
    /// listener never sees an older state than `init` did. `init` must not call
    /// back into the store's listener registry.
    pub(crate) fn add_listener_with(
        &self,
        key: &CanonicalKey,
        listener: Listener,
        init: impl FnOnce(Option<EntrySnapshot>),
    ) -> ListenerId {
        let mut listeners = self.listeners.lock();
        let id = Self::push_listener(&mut listeners, key, listener);
        init(self.get(key));
        id
    }

    fn push_listener(listeners: &mut Listeners, key: &CanonicalKey, listener: Listener) -> ListenerId {
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        listeners
            .by_key
            .entry(key.as_str().to_owned())
            .or_default()
            .push((id, listener));
        id
    }

    pub(crate) fn remove_listener(&self, key: &CanonicalKey, id: ListenerId) {
        let mut listeners = self.listeners.lock();
        if let Some(list) = listeners.by_key.get_mut(key.as_str()) {
            list.retain(|(existing, _)| *existing != id);
            if list.is_empty() {
                listeners.by_key.remove(key.as_str());
            }
        }
    }

    fn listeners_for(&self, key: &CanonicalKey) -> Vec<Listener> {
        self.listeners
            .lock()
            .by_key
            .get(key.as_str())
            .map(|list| list.iter().map(|(_, listener)| listener.clone()).collect())
            .unwrap_or_default()
    }

    /// Draws the next fetch generation. Shared by all keys so a re-created entry
    /// never reuses a number an older fetch still holds.
    pub(crate) fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for QueryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;
    use serde_json::json;
    use std::time::Duration;

    fn create(key: &QueryKey) -> impl FnOnce() -> QueryEntry {
        let key = key.clone();
        move || {
            let canonical = key.canonical().unwrap();
            QueryEntry::new(key, canonical, Duration::ZERO, Duration::from_secs(300))
        }
    }

    fn put(store: &QueryStore, key: &QueryKey, value: i32) {
        let canonical = key.canonical().unwrap();
        store.upsert(&canonical, create(key), |entry| {
            entry.update(Arc::new(value), tokio::time::Instant::now());
        });
    }

    fn recorder(store: &QueryStore, key: &QueryKey) -> Arc<Mutex<Vec<QueryStatus>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.add_listener(
            &key.canonical().unwrap(),
            Arc::new(move |snapshot: &EntrySnapshot| sink.lock().push(snapshot.status())),
        );
        seen
    }

    #[tokio::test]
    async fn test_equal_keys_share_an_entry() {
        let store = QueryStore::new();
        let k1 = query_key!["appointments", json!({"year": 2024, "month": 7})];
        let k2 = query_key!["appointments", json!({"month": 7, "year": 2024})];

        put(&store, &k1, 5);

        let via_k2 = store.get(&k2.canonical().unwrap()).unwrap();
        assert_eq!(via_k2.data::<i32>(), Some(&5));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = QueryStore::new();
        assert!(store.get(&query_key!["nope"].canonical().unwrap()).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_notifies_once() {
        let store = QueryStore::new();
        let key = query_key!["posts", 1];
        let seen = recorder(&store, &key);

        put(&store, &key, 1);
        assert_eq!(*seen.lock(), vec![QueryStatus::Success]);
    }

    #[tokio::test]
    async fn test_modify_is_silent() {
        let store = QueryStore::new();
        let key = query_key!["posts", 1];
        put(&store, &key, 1);
        let seen = recorder(&store, &key);

        store.modify(&key.canonical().unwrap(), |entry| entry.retry_count = 2);
        assert!(seen.lock().is_empty());
        assert_eq!(store.get(&key.canonical().unwrap()).unwrap().retry_count(), 2);
    }

    #[tokio::test]
    async fn test_listeners_run_in_registration_order() {
        let store = QueryStore::new();
        let key = query_key!["posts", 1];
        let canonical = key.canonical().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let order = order.clone();
            store.add_listener(&canonical, Arc::new(move |_: &EntrySnapshot| order.lock().push(n)));
        }

        put(&store, &key, 1);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_removed_listener_is_not_called() {
        let store = QueryStore::new();
        let key = query_key!["posts", 1];
        let canonical = key.canonical().unwrap();
        let calls = Arc::new(Mutex::new(0));

        let counter = calls.clone();
        let id = store.add_listener(&canonical, Arc::new(move |_: &EntrySnapshot| *counter.lock() += 1));
        put(&store, &key, 1);
        store.remove_listener(&canonical, id);
        put(&store, &key, 2);

        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_remove_notifies_idle_snapshot() {
        let store = QueryStore::new();
        let key = query_key!["user"];
        put(&store, &key, 1);
        let seen = recorder(&store, &key);

        let removed = store.remove(&key.canonical().unwrap()).unwrap();
        assert_eq!(removed.data::<i32>(), Some(&1));
        assert_eq!(*seen.lock(), vec![QueryStatus::Idle]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_remove_by_prefix() {
        let store = QueryStore::new();
        let july = query_key!["appointments", 2024, 7];
        let august = query_key!["appointments", 2024, 8];
        let treatments = query_key!["treatments"];
        put(&store, &july, 1);
        put(&store, &august, 2);
        put(&store, &treatments, 3);

        let july_seen = recorder(&store, &july);
        let august_seen = recorder(&store, &august);

        let mut removed = store.remove_by_prefix(&query_key!["appointments"].canonical().unwrap());
        removed.sort_by_key(ToString::to_string);

        assert_eq!(removed, vec![july, august]);
        assert_eq!(store.len(), 1);
        assert!(store.contains(&treatments.canonical().unwrap()));
        assert_eq!(july_seen.lock().len(), 1);
        assert_eq!(august_seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_listener_may_reenter_store() {
        let store = Arc::new(QueryStore::new());
        let key = query_key!["posts", 1];
        let canonical = key.canonical().unwrap();
        let observed = Arc::new(Mutex::new(None));

        let reentrant = store.clone();
        let sink = observed.clone();
        let lookup = canonical.clone();
        store.add_listener(
            &canonical,
            Arc::new(move |_: &EntrySnapshot| {
                *sink.lock() = reentrant.get(&lookup).and_then(|s| s.data::<i32>().copied());
            }),
        );

        put(&store, &key, 9);
        assert_eq!(*observed.lock(), Some(9));
    }

    #[tokio::test]
    async fn test_add_listener_with_sees_current_state() {
        let store = QueryStore::new();
        let key = query_key!["posts", 1];
        let canonical = key.canonical().unwrap();
        put(&store, &key, 4);

        let initial = Arc::new(Mutex::new(None));
        let sink = initial.clone();
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        store.add_listener_with(
            &canonical,
            Arc::new(move |_: &EntrySnapshot| *counter.lock() += 1),
            |snapshot| *sink.lock() = snapshot.and_then(|s| s.data::<i32>().copied()),
        );

        assert_eq!(*initial.lock(), Some(4));
        assert_eq!(*calls.lock(), 0);
        put(&store, &key, 5);
        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_recreated_entry_gets_new_id() {
        let store = QueryStore::new();
        let key = query_key!["user"];
        let canonical = key.canonical().unwrap();

        put(&store, &key, 1);
        let first = store.modify(&canonical, |entry| entry.id).unwrap();
        put(&store, &key, 2);
        assert_eq!(store.modify(&canonical, |entry| entry.id), Some(first));

        store.remove(&canonical);
        put(&store, &key, 3);
        let second = store.modify(&canonical, |entry| entry.id).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_generations_are_monotonic() {
        let store = QueryStore::new();
        let a = store.next_generation();
        let b = store.next_generation();
        assert!(b > a);
    }
}
