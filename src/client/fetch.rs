//! The fetch coordinator.
//!
//! Every fetch runs as a spawned task that owns its retry loop. The entry only
//! records a [`PendingFetch`]: the generation the fetch was started under, its
//! cancellation token, and a shared handle that any number of callers can await.
//!
//! A response is applied only if the entry's generation still equals the one the
//! fetch started with. Starting a forced refetch, cancelling, or patching an entry
//! optimistically moves the generation on, so a slow older response is dropped on
//! arrival no matter when it lands.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::QueryError;
use crate::key::{CanonicalKey, QueryKey};
use crate::retry::RetryPolicy;
use crate::store::{AnyData, QueryStore, QueryStatus};

/// One attempt of a fetch, type-erased.
pub(crate) type AttemptFn = Arc<dyn Fn(FetchContext) -> BoxFuture<'static, Result<AnyData, QueryError>> + Send + Sync>;

/// Combines the entry's current data with a fetched payload at settle time.
pub(crate) type MergeFn = Box<dyn FnOnce(Option<&AnyData>, AnyData) -> AnyData + Send>;

/// Builds the job that refreshes an entry, given its current data.
pub(crate) type RefetchFn = Arc<dyn Fn(Option<&AnyData>) -> FetchJob + Send + Sync>;

/// Builds the job that loads the page after the current data, if there is one.
pub(crate) type NextPageFn = Arc<dyn Fn(&AnyData) -> Option<FetchJob> + Send + Sync>;

pub(crate) type SharedFetch = Shared<BoxFuture<'static, Result<AnyData, FetchFailure>>>;

/// What the fetcher is told about the request it serves.
#[derive(Debug, Clone)]
pub struct FetchContext {
    key: QueryKey,
    attempt: u32,
    signal: CancellationToken,
}

impl FetchContext {
    /// The key being fetched.
    #[must_use]
    pub const fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Zero for the first attempt, then one more for every retry.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Cancelled when the fetch is cancelled through the client. Fetchers may
    /// select on it to abort their I/O early.
    #[must_use]
    pub const fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }
}

pub(crate) struct FetchJob {
    pub attempt: AttemptFn,
    pub merge: Option<MergeFn>,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
}

/// In-flight fetch recorded on the entry.
pub(crate) struct PendingFetch {
    pub generation: u64,
    pub token: CancellationToken,
    pub result: SharedFetch,
}

/// A response that arrived after a newer fetch took over its key.
#[derive(Error, Debug, Clone)]
#[error("response for {key} from generation {generation} was superseded")]
pub(crate) struct StaleResponseDiscarded {
    key: String,
    generation: u64,
}

#[derive(Debug, Clone)]
pub(crate) enum FetchFailure {
    Failed(QueryError),
    Discarded(StaleResponseDiscarded),
}

/// Starts a fetch for an existing entry, or joins the one already in flight.
///
/// With `force`, a new generation starts even if a fetch is pending; the older
/// fetch keeps running but its response will be discarded.
pub(crate) fn start(store: &Arc<QueryStore>, canonical: &CanonicalKey, job: FetchJob, force: bool) -> Option<SharedFetch> {
    let (shared, started) = store.modify(canonical, |entry| {
        if let Some(pending) = &entry.pending {
            if !force {
                trace!(key = %entry.key, generation = pending.generation, "joining in-flight fetch");
                return (pending.result.clone(), false);
            }
        }

        let generation = store.next_generation();
        let token = CancellationToken::new();
        entry.generation = generation;
        entry.retry_count = 0;
        if entry.data.is_none() {
            entry.status = QueryStatus::Loading;
        }
        debug!(key = %entry.key, generation, force, "starting fetch");

        let handle = tokio::spawn(drive(
            Arc::clone(store),
            entry.key.clone(),
            canonical.clone(),
            generation,
            token.clone(),
            job,
        ));
        let result = join(handle, Arc::downgrade(store), entry.key.clone(), canonical.clone(), generation)
            .boxed()
            .shared();

        entry.pending = Some(PendingFetch {
            generation,
            token,
            result: result.clone(),
        });
        (result, true)
    })?;

    if started {
        store.notify(canonical);
    }
    Some(shared)
}

/// Cancels the fetch in flight for `canonical`, if any, and reverts the entry to
/// its state before that fetch started.
pub(crate) fn cancel(store: &QueryStore, canonical: &CanonicalKey) -> bool {
    let cancelled = store
        .modify(canonical, |entry| {
            let pending = entry.pending.take()?;
            pending.token.cancel();
            entry.generation = store.next_generation();
            entry.retry_count = 0;
            entry.status = entry.settled_status();
            Some((entry.key.clone(), pending.generation))
        })
        .flatten();

    match cancelled {
        Some((key, generation)) => {
            debug!(%key, generation, "cancelled in-flight fetch");
            store.notify(canonical);
            true
        }
        None => false,
    }
}

/// Awaits a fetch. If it was superseded, follows whichever fetch replaced it.
pub(crate) async fn wait(store: &QueryStore, canonical: &CanonicalKey, mut shared: SharedFetch) -> Result<AnyData, QueryError> {
    loop {
        match shared.await {
            Ok(data) => return Ok(data),
            Err(FetchFailure::Failed(err)) => return Err(err),
            Err(FetchFailure::Discarded(_)) => {
                let next = store
                    .modify(canonical, |entry| entry.pending.as_ref().map(|p| p.result.clone()))
                    .flatten();
                match next {
                    Some(next) => shared = next,
                    // Nothing replaced it: it was cancelled or patched over.
                    None => {
                        return store
                            .get(canonical)
                            .and_then(|snapshot| snapshot.data)
                            .ok_or(QueryError::Cancelled);
                    }
                }
            }
        }
    }
}

async fn drive(
    store: Arc<QueryStore>,
    key: QueryKey,
    canonical: CanonicalKey,
    generation: u64,
    token: CancellationToken,
    job: FetchJob,
) -> Result<AnyData, FetchFailure> {
    let FetchJob {
        attempt,
        merge,
        retry,
        timeout,
    } = job;
    let mut failures = 0u32;

    let outcome = loop {
        let ctx = FetchContext {
            key: key.clone(),
            attempt: failures,
            signal: token.child_token(),
        };
        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(QueryError::Cancelled),
            result = run_attempt(attempt(ctx), timeout) => result,
        };

        match result {
            Ok(data) => break Ok(data),
            Err(err) if retry.should_retry(failures, &err) => {
                let delay = retry.delay_for(failures);
                failures += 1;

                // Re-read the entry: it may have been superseded or removed while we waited.
                let current = store
                    .modify(&canonical, |entry| {
                        let current = entry.generation == generation;
                        if current {
                            entry.retry_count = failures;
                        }
                        current
                    })
                    .unwrap_or(false);
                if !current {
                    return Err(discarded(&key, generation));
                }

                debug!(%key, generation, attempt = failures, ?delay, error = %err, "fetch failed, retrying");
                tokio::select! {
                    biased;
                    () = token.cancelled() => break Err(QueryError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => break Err(err),
        }
    };

    settle(&store, &key, &canonical, generation, outcome, merge)
}

async fn run_attempt(
    attempt: BoxFuture<'static, Result<AnyData, QueryError>>,
    timeout: Option<Duration>,
) -> Result<AnyData, QueryError> {
    let guarded = AssertUnwindSafe(attempt).catch_unwind().map(|result| {
        result.unwrap_or_else(|_| Err(QueryError::FetchError("fetcher panicked".to_string())))
    });

    match timeout {
        Some(limit) => tokio::time::timeout(limit, guarded)
            .await
            .unwrap_or(Err(QueryError::Timeout(limit))),
        None => guarded.await,
    }
}

async fn join(
    handle: JoinHandle<Result<AnyData, FetchFailure>>,
    store: Weak<QueryStore>,
    key: QueryKey,
    canonical: CanonicalKey,
    generation: u64,
) -> Result<AnyData, FetchFailure> {
    match handle.await {
        Ok(result) => result,
        Err(err) => {
            let failure = QueryError::FetchError(format!("fetch task failed: {err}"));
            match store.upgrade() {
                Some(store) => settle(&store, &key, &canonical, generation, Err(failure), None),
                None => Err(FetchFailure::Failed(failure)),
            }
        }
    }
}

fn settle(
    store: &QueryStore,
    key: &QueryKey,
    canonical: &CanonicalKey,
    generation: u64,
    outcome: Result<AnyData, QueryError>,
    merge: Option<MergeFn>,
) -> Result<AnyData, FetchFailure> {
    let now = Instant::now();
    let applied = store
        .modify(canonical, |entry| {
            if entry.generation != generation {
                return None;
            }
            entry.pending = None;

            Some(match outcome {
                Ok(payload) => {
                    let data = match merge {
                        Some(merge) => merge(entry.data.as_ref(), payload),
                        None => payload,
                    };
                    entry.update(data.clone(), now);
                    Ok((data, entry.persist.clone()))
                }
                Err(QueryError::Cancelled) => {
                    entry.retry_count = 0;
                    entry.status = entry.settled_status();
                    Err(QueryError::Cancelled)
                }
                Err(err) => {
                    entry.status = QueryStatus::Error;
                    entry.error = Some(err.clone());
                    Err(err)
                }
            })
        })
        .flatten();

    let Some(result) = applied else {
        return Err(discarded(key, generation));
    };

    store.notify(canonical);
    match result {
        Ok((data, persist)) => {
            trace!(%key, generation, "fetch succeeded");
            if let Some(persist) = persist {
                persist.save(key, &data);
            }
            Ok(data)
        }
        Err(err) => {
            debug!(%key, generation, error = %err, "fetch settled with error");
            Err(FetchFailure::Failed(err))
        }
    }
}

fn discarded(key: &QueryKey, generation: u64) -> FetchFailure {
    let stale = StaleResponseDiscarded {
        key: key.to_string(),
        generation,
    };
    debug!(%key, generation, "{stale}");
    FetchFailure::Discarded(stale)
}
