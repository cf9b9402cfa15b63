//! Garbage collection of unused entries.
//!
//! An entry is collectable once it has no subscribers, no fetch in flight, and
//! has not been accessed for its cache time. Collection happens in two places:
//! lazily, when a key is looked up again, and in a background sweep started by
//! [`QueryClient::spawn_gc`](crate::QueryClient::spawn_gc).
//!
//! ## Implementation Details
//!
//! The sweep uses `tokio::time::interval` with `MissedTickBehavior::Skip`, so a
//! stalled runtime does not produce a burst of back-to-back sweeps afterwards.

use std::sync::Weak;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::key::{CanonicalKey, QueryKey};
use crate::store::QueryStore;

/// Handle for the running background sweep.
pub(crate) struct Handle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl Handle {
    pub const fn new(token: CancellationToken, join: JoinHandle<()>) -> Self {
        Self { token, join }
    }

    /// Cancel the sweep and wait for the task to finish.
    pub async fn cancel(self) {
        self.token.cancel();
        let _ = self.join.await;
    }
}

/// Removes every collectable entry and returns their keys.
pub(crate) fn sweep(store: &QueryStore, now: Instant) -> Vec<QueryKey> {
    let evicted: Vec<QueryKey> = store
        .take_where(|entry| entry.should_gc(now))
        .into_iter()
        .map(|entry| entry.key)
        .collect();
    for key in &evicted {
        debug!(%key, "evicted unused query");
    }
    evicted
}

/// Removes the entry for `key` if it is collectable. Lookups call this first so
/// an expired entry is never served, whether or not a sweep has run.
pub(crate) fn evict_if_expired(store: &QueryStore, key: &CanonicalKey, now: Instant) -> bool {
    match store.take_if(key, |entry| entry.should_gc(now)) {
        Some(entry) => {
            debug!(key = %entry.key, "evicted expired query on access");
            true
        }
        None => false,
    }
}

/// Starts sweeping `store` every `period` until `token` is cancelled or the store
/// is dropped.
pub(crate) fn spawn(store: Weak<QueryStore>, period: Duration, token: CancellationToken) -> Handle {
    let cancelled = token.clone();
    let join = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; there is nothing to collect yet.
        let mut ticks = IntervalStream::new(ticker).skip(1);

        loop {
            tokio::select! {
                () = cancelled.cancelled() => break,
                tick = ticks.next() => {
                    if tick.is_none() {
                        break;
                    }
                    let Some(store) = store.upgrade() else {
                        break;
                    };
                    let evicted = sweep(&store, Instant::now());
                    trace!(evicted = evicted.len(), remaining = store.len(), "gc sweep");
                }
            }
        }
        debug!("gc sweeper stopped");
    });
    Handle::new(token, join)
}
