//! Scripted fetcher for testing.
//!
//! [`MockFetcher`] answers each call with the next scripted response, so query
//! behavior can be tested deterministically without real I/O. Combine it with
//! `#[tokio::test(start_paused = true)]` and delayed responses resolve in virtual
//! time.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use refetch::prelude::*;
//! use refetch::mock::MockFetcher;
//! use std::time::Duration;
//!
//! # async fn run(client: QueryClient) -> Result<(), QueryError> {
//! let mock = MockFetcher::new();
//! mock.push_ok(1_u32).push_delayed(Duration::from_secs(1), Ok(2));
//!
//! let mut observer = client.query(&query_key!["count"], mock.fetcher(), QueryOptions::default())?;
//! observer.wait_until(QueryResult::is_success).await;
//! assert_eq!(mock.calls(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Controlling Completion Order
//!
//! [`MockFetcher::defer`] hands back a [`Deferred`] that resolves the call only when
//! the test says so, which makes overlapping fetches easy to reorder:
//!
//! ```rust,no_run
//! # use refetch::mock::MockFetcher;
//! # let mock = MockFetcher::<u32>::new();
//! let first = mock.defer();
//! let second = mock.defer();
//! // ... start two fetches ...
//! second.resolve(2);
//! first.resolve(1); // arrives late and is discarded
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::client::fetch::FetchContext;
use crate::error::QueryError;

enum Step<T> {
    Ready(Result<T, QueryError>),
    Delayed(Duration, Result<T, QueryError>),
    Deferred(oneshot::Receiver<Result<T, QueryError>>),
}

struct Inner<T> {
    script: Mutex<VecDeque<Step<T>>>,
    fallback: Mutex<Option<Result<T, QueryError>>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// A fetcher that replays scripted responses in order.
///
/// Cloning shares the script and counters, so the test can keep one handle and
/// give another to the client.
pub struct MockFetcher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for MockFetcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for MockFetcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockFetcher")
            .field("scripted", &self.inner.script.lock().len())
            .field("calls", &self.inner.calls.load(Ordering::SeqCst))
            .field("in_flight", &self.inner.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

impl<T> Default for MockFetcher<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MockFetcher<T>
where
    T: Clone + Send + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                script: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(None),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Answers every call with `result` once the script runs out.
    pub fn always(&self, result: Result<T, QueryError>) -> &Self {
        *self.inner.fallback.lock() = Some(result);
        self
    }

    pub fn push_ok(&self, value: T) -> &Self {
        self.push(Step::Ready(Ok(value)))
    }

    pub fn push_err(&self, error: QueryError) -> &Self {
        self.push(Step::Ready(Err(error)))
    }

    /// Scripts a response that arrives `delay` after the call.
    pub fn push_delayed(&self, delay: Duration, result: Result<T, QueryError>) -> &Self {
        self.push(Step::Delayed(delay, result))
    }

    /// Scripts a response that arrives when the returned handle is resolved.
    #[must_use]
    pub fn defer(&self) -> Deferred<T> {
        let (tx, rx) = oneshot::channel();
        self.push(Step::Deferred(rx));
        Deferred { tx }
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Calls started but not yet answered.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// The most calls that were ever in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    /// Answers one call with the next scripted response.
    pub fn call(&self) -> BoxFuture<'static, Result<T, QueryError>> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.inner.script.lock().pop_front();
        let step = step.unwrap_or_else(|| {
            Step::Ready(
                self.inner
                    .fallback
                    .lock()
                    .clone()
                    .unwrap_or_else(|| Err(QueryError::FetchError("no scripted response".to_string()))),
            )
        });

        let guard = InFlight::enter(Arc::clone(&self.inner));
        async move {
            let _guard = guard;
            match step {
                Step::Ready(result) => result,
                Step::Delayed(delay, result) => {
                    tokio::time::sleep(delay).await;
                    result
                }
                Step::Deferred(rx) => rx
                    .await
                    .unwrap_or_else(|_| Err(QueryError::FetchError("deferred response dropped".to_string()))),
            }
        }
        .boxed()
    }

    /// A fetcher closure to hand to the client.
    pub fn fetcher(&self) -> impl Fn(FetchContext) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync + use<T> {
        let mock = self.clone();
        move |_ctx| mock.call()
    }

    fn push(&self, step: Step<T>) -> &Self {
        self.inner.script.lock().push_back(step);
        self
    }
}

/// Resolves a response scripted with [`MockFetcher::defer`].
#[derive(Debug)]
pub struct Deferred<T> {
    tx: oneshot::Sender<Result<T, QueryError>>,
}

impl<T> Deferred<T> {
    pub fn resolve(self, value: T) {
        let _ = self.tx.send(Ok(value));
    }

    pub fn fail(self, error: QueryError) {
        let _ = self.tx.send(Err(error));
    }
}

struct InFlight<T> {
    inner: Arc<Inner<T>>,
}

impl<T> InFlight<T> {
    fn enter(inner: Arc<Inner<T>>) -> Self {
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self { inner }
    }
}

impl<T> Drop for InFlight<T> {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
