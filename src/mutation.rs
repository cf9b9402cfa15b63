//! Mutations: writes with optimistic updates.
//!
//! A [`Mutation`] bundles the write itself with lifecycle callbacks. Running it
//! through [`QueryClient::mutate`] calls them in a fixed order:
//!
//! 1. `on_mutate(&variables, &scope)` runs synchronously before the write. It may
//!    snapshot and patch cached queries through the [`MutationScope`] and returns a
//!    context value (typically the snapshot).
//! 2. The mutation function runs.
//! 3. `on_success` or `on_error` runs with the context; `on_error` is where a
//!    rollback belongs.
//! 4. `on_settled` always runs last, typically to invalidate related queries.
//!
//! Unlike queries, mutations are one-off operations; nothing is cached. Failures
//! end up in the returned [`MutationResult`], never as a panic or `Err`.
//!
//! # Example
//!
//! ```rust,no_run
//! use refetch::prelude::*;
//!
//! # #[derive(Clone)]
//! # struct User { name: String, email: String }
//! # async fn rename_user(_name: String) -> Result<(), QueryError> { Ok(()) }
//! # async fn run(client: QueryClient) {
//! let rename = Mutation::new(|name: String| rename_user(name))
//!     .on_mutate(|name, scope| {
//!         let previous = scope.get_query_data::<User>(&query_key!["user"]).ok().flatten();
//!         if let Some(user) = &previous {
//!             let _ = scope.set_query_data(&query_key!["user"], User { name: name.clone(), ..user.clone() });
//!         }
//!         previous
//!     })
//!     .on_error(|_err, _name, previous, client| {
//!         if let Some(user) = previous {
//!             let _ = client.set_query_data(&query_key!["user"], user.clone());
//!         }
//!     })
//!     .on_settled(|_, _, _, _, client| {
//!         let _ = client.invalidate_queries(&query_key!["user"]);
//!     });
//!
//! let result = client.mutate(&rename, "Alice".to_string()).await;
//! # drop(result);
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::client::QueryClient;
use crate::error::{MutationError, QueryError};
use crate::key::QueryKey;
use crate::retry::RetryPolicy;

type MutationFn<V, O> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<O, QueryError>> + Send + Sync>;
type OnMutate<V, C> = Box<dyn Fn(&V, &MutationScope<'_>) -> C + Send + Sync>;
type OnSuccess<V, O, C> = Box<dyn Fn(&O, &V, &C, &QueryClient) + Send + Sync>;
type OnError<V, C> = Box<dyn Fn(&MutationError, &V, &C, &QueryClient) + Send + Sync>;
type OnSettled<V, O, C> = Box<dyn Fn(Option<&O>, Option<&MutationError>, &V, &C, &QueryClient) + Send + Sync>;

/// The state of a mutation result.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationState<T> {
    /// Mutation is idle (not yet started).
    Idle,
    /// Mutation is in progress.
    Loading,
    /// Mutation succeeded with a result.
    Success(T),
    /// Mutation failed with an error.
    Error(MutationError),
}

/// A mutation result containing the current state.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResult<T> {
    /// The current state of the mutation.
    pub state: MutationState<T>,
}

impl<T> MutationResult<T> {
    /// Returns the result data if the mutation succeeded, otherwise `None`.
    pub const fn data(&self) -> Option<&T> {
        match &self.state {
            MutationState::Success(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the error if the mutation failed, otherwise `None`.
    pub const fn error(&self) -> Option<&MutationError> {
        match &self.state {
            MutationState::Error(err) => Some(err),
            _ => None,
        }
    }

    pub const fn is_idle(&self) -> bool {
        matches!(self.state, MutationState::Idle)
    }

    /// Returns `true` if the mutation is currently loading.
    pub const fn is_loading(&self) -> bool {
        matches!(self.state, MutationState::Loading)
    }

    /// Returns `true` if the mutation succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self.state, MutationState::Success(_))
    }

    /// Returns `true` if the mutation failed.
    pub const fn is_error(&self) -> bool {
        matches!(self.state, MutationState::Error(_))
    }
}

/// Cache access handed to `on_mutate`.
///
/// Writes through the scope supersede any fetch in flight for the written key, so
/// a response requested before the patch cannot overwrite it.
pub struct MutationScope<'a> {
    client: &'a QueryClient,
}

impl<'a> MutationScope<'a> {
    const fn new(client: &'a QueryClient) -> Self {
        Self { client }
    }

    #[must_use]
    pub const fn client(&self) -> &QueryClient {
        self.client
    }

    pub fn get_query_data<T: Clone + 'static>(&self, key: &QueryKey) -> Result<Option<T>, QueryError> {
        self.client.get_query_data(key)
    }

    /// Patches the cached data of `key`, cancelling its in-flight fetch first.
    pub fn set_query_data<T: Send + Sync + 'static>(&self, key: &QueryKey, data: T) -> Result<(), QueryError> {
        let canonical = key.canonical()?;
        if self.client.cancel_fetch(&canonical) {
            debug!(%key, "optimistic update superseded in-flight fetch");
        }
        self.client.set_query_data(key, data)
    }

    pub fn update_query_data<T, F>(&self, key: &QueryKey, update: F) -> Result<(), QueryError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Option<T>) -> T,
    {
        let current = self.get_query_data::<T>(key)?;
        self.set_query_data(key, update(current))
    }
}

impl fmt::Debug for MutationScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationScope").finish_non_exhaustive()
    }
}

/// A write operation with its lifecycle callbacks.
///
/// `V` is the variables type, `O` the output and `C` the context returned by
/// `on_mutate`. Call [`on_mutate`](Mutation::on_mutate) first when a context is
/// needed; it fixes `C`.
pub struct Mutation<V, O, C = ()> {
    mutation_fn: MutationFn<V, O>,
    on_mutate: OnMutate<V, C>,
    on_success: Option<OnSuccess<V, O, C>>,
    on_error: Option<OnError<V, C>>,
    on_settled: Option<OnSettled<V, O, C>>,
    retry: RetryPolicy,
    state: Mutex<MutationState<O>>,
}

impl<V, O> Mutation<V, O, ()>
where
    V: 'static,
    O: 'static,
{
    /// Creates a mutation around `mutation_fn`. Mutations are not retried unless
    /// [`retry`](Self::retry) says so.
    pub fn new<F, Fut>(mutation_fn: F) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, QueryError>> + Send + 'static,
    {
        Self {
            mutation_fn: Arc::new(move |variables| mutation_fn(variables).boxed()),
            on_mutate: Box::new(|_: &V, _: &MutationScope<'_>| ()),
            on_success: None,
            on_error: None,
            on_settled: None,
            retry: RetryPolicy::none(),
            state: Mutex::new(MutationState::Idle),
        }
    }

    /// Runs before the mutation function and produces the context passed to the
    /// later callbacks.
    pub fn on_mutate<C, F>(self, on_mutate: F) -> Mutation<V, O, C>
    where
        C: 'static,
        F: Fn(&V, &MutationScope<'_>) -> C + Send + Sync + 'static,
    {
        let Self {
            mutation_fn,
            on_success,
            on_error,
            on_settled,
            retry,
            state,
            ..
        } = self;
        // Callbacks registered before the context existed keep ignoring it.
        Mutation {
            mutation_fn,
            on_mutate: Box::new(on_mutate),
            on_success: on_success.map(|callback| -> OnSuccess<V, O, C> {
                Box::new(move |output: &O, variables: &V, _: &C, client: &QueryClient| {
                    callback(output, variables, &(), client);
                })
            }),
            on_error: on_error.map(|callback| -> OnError<V, C> {
                Box::new(move |err: &MutationError, variables: &V, _: &C, client: &QueryClient| {
                    callback(err, variables, &(), client);
                })
            }),
            on_settled: on_settled.map(|callback| -> OnSettled<V, O, C> {
                Box::new(
                    move |output: Option<&O>, err: Option<&MutationError>, variables: &V, _: &C, client: &QueryClient| {
                        callback(output, err, variables, &(), client);
                    },
                )
            }),
            retry,
            state,
        }
    }
}

impl<V, O, C> Mutation<V, O, C> {
    #[must_use]
    pub fn on_success<F>(mut self, on_success: F) -> Self
    where
        F: Fn(&O, &V, &C, &QueryClient) + Send + Sync + 'static,
    {
        self.on_success = Some(Box::new(on_success));
        self
    }

    #[must_use]
    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&MutationError, &V, &C, &QueryClient) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(on_error));
        self
    }

    #[must_use]
    pub fn on_settled<F>(mut self, on_settled: F) -> Self
    where
        F: Fn(Option<&O>, Option<&MutationError>, &V, &C, &QueryClient) + Send + Sync + 'static,
    {
        self.on_settled = Some(Box::new(on_settled));
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = retry.into();
        self
    }

    /// The state of the latest run.
    #[must_use]
    pub fn state(&self) -> MutationResult<O>
    where
        O: Clone,
    {
        MutationResult {
            state: self.state.lock().clone(),
        }
    }

    /// Returns the mutation to idle.
    pub fn reset(&self) {
        *self.state.lock() = MutationState::Idle;
    }

    fn set_state(&self, state: MutationState<O>) {
        *self.state.lock() = state;
    }

    async fn run(&self, variables: &V) -> Result<O, QueryError>
    where
        V: Clone,
    {
        let mut failures = 0;
        loop {
            let attempt = AssertUnwindSafe((self.mutation_fn)(variables.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(QueryError::FetchError("mutation function panicked".to_string())));
            match attempt {
                Ok(output) => return Ok(output),
                Err(err) if self.retry.should_retry(failures, &err) => {
                    let delay = self.retry.delay_for(failures);
                    failures += 1;
                    debug!(attempt = failures, ?delay, error = %err, "mutation failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl<V, O, C> fmt::Debug for Mutation<V, O, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("retry", &self.retry)
            .field("has_on_success", &self.on_success.is_some())
            .field("has_on_error", &self.on_error.is_some())
            .field("has_on_settled", &self.on_settled.is_some())
            .finish_non_exhaustive()
    }
}

impl QueryClient {
    /// Runs `mutation` with `variables`, calling its callbacks in order, and
    /// returns the final state.
    pub async fn mutate<V, O, C>(&self, mutation: &Mutation<V, O, C>, variables: V) -> MutationResult<O>
    where
        V: Clone + Send + Sync,
        O: Clone + Send,
        C: Send,
    {
        if let Err(err) = self.ensure_running() {
            let state = MutationState::Error(MutationError::from(err));
            mutation.set_state(state.clone());
            return MutationResult { state };
        }

        let _running = self.mutation_started();
        mutation.set_state(MutationState::Loading);

        let context = (mutation.on_mutate)(&variables, &MutationScope::new(self));
        let outcome = mutation.run(&variables).await.map_err(MutationError::from);

        match &outcome {
            Ok(output) => {
                debug!("mutation succeeded");
                if let Some(on_success) = &mutation.on_success {
                    on_success(output, &variables, &context, self);
                }
            }
            Err(err) => {
                warn!(error = %err, "mutation failed");
                if let Some(on_error) = &mutation.on_error {
                    on_error(err, &variables, &context, self);
                }
            }
        }
        if let Some(on_settled) = &mutation.on_settled {
            on_settled(outcome.as_ref().ok(), outcome.as_ref().err(), &variables, &context, self);
        }
        drop(context);

        let state = match outcome {
            Ok(output) => MutationState::Success(output),
            Err(err) => MutationState::Error(err),
        };
        mutation.set_state(state.clone());
        MutationResult { state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockFetcher;
    use crate::query::{QueryOptions, QueryResult};
    use crate::query_key;
    use std::time::Duration;

    fn record(log: &Arc<Mutex<Vec<String>>>, event: impl Into<String>) {
        log.lock().push(event.into());
    }

    #[test]
    fn test_mutation_result_predicates() {
        let idle: MutationResult<i32> = MutationResult {
            state: MutationState::Idle,
        };
        assert!(idle.is_idle());
        assert!(!idle.is_loading());

        let success = MutationResult {
            state: MutationState::Success(42),
        };
        assert!(success.is_success());
        assert_eq!(success.data(), Some(&42));

        let error: MutationResult<i32> = MutationResult {
            state: MutationState::Error(MutationError(QueryError::Cancelled)),
        };
        assert!(error.is_error());
        assert_eq!(error.data(), None);
        assert_eq!(error.error(), Some(&MutationError(QueryError::Cancelled)));
    }

    #[tokio::test]
    async fn test_callbacks_run_in_order() {
        let client = QueryClient::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let (a, b, c, d) = (log.clone(), log.clone(), log.clone(), log.clone());
        let mutation = Mutation::new(move |n: u32| {
            record(&a, "mutate");
            async move { Ok(n * 2) }
        })
        .on_mutate(move |n, _scope| {
            record(&b, "on_mutate");
            *n
        })
        .on_success(move |output, _, context, _| {
            record(&c, format!("on_success {output} {context}"));
        })
        .on_settled(move |output, err, _, _, _| {
            record(&d, format!("on_settled {output:?} {}", err.is_some()));
        });

        let result = client.mutate(&mutation, 21).await;
        assert_eq!(result.data(), Some(&42));
        assert_eq!(
            *log.lock(),
            vec!["on_mutate", "mutate", "on_success 42 21", "on_settled Some(42) false"]
        );
        assert_eq!(mutation.state(), result);
    }

    #[tokio::test]
    async fn test_failure_routes_to_on_error() {
        let client = QueryClient::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (log.clone(), log.clone());

        let mutation = Mutation::new(|_: ()| async { Err::<(), _>(QueryError::NetworkError("offline".into())) })
            .on_success(move |_, _, _, _| record(&a, "on_success"))
            .on_error(move |err, _, _, _| record(&b, format!("on_error {err}")));

        let result = client.mutate(&mutation, ()).await;
        assert!(result.is_error());
        assert_eq!(log.lock().len(), 1);
        assert!(log.lock()[0].starts_with("on_error"));
    }

    #[tokio::test]
    async fn test_callbacks_before_on_mutate_are_kept() {
        let client = QueryClient::new();
        let settled = Arc::new(Mutex::new(0));
        let counter = settled.clone();

        let mutation = Mutation::new(|n: u8| async move { Ok(n) })
            .on_settled(move |_, _, _, _, _| *counter.lock() += 1)
            .on_mutate(|_, _| "context");

        client.mutate(&mutation, 1).await;
        assert_eq!(*settled.lock(), 1);
    }

    #[tokio::test]
    async fn test_panicking_mutation_becomes_error() {
        let client = QueryClient::new();
        let mutation = Mutation::new(|_: ()| async {
            if true {
                panic!("boom");
            }
            Ok(())
        });

        let result = client.mutate(&mutation, ()).await;
        assert!(matches!(result.error(), Some(MutationError(QueryError::FetchError(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_is_opt_in() {
        let client = QueryClient::new();
        let mock = MockFetcher::new();
        mock.push_err(QueryError::NetworkError("flaky".into()));

        let calls = mock.clone();
        let once = Mutation::new(move |_: ()| calls.call());
        assert!(client.mutate(&once, ()).await.is_error());
        assert_eq!(mock.calls(), 1);

        mock.push_err(QueryError::NetworkError("flaky".into())).push_ok(1_u8);
        let calls = mock.clone();
        let retried = Mutation::new(move |_: ()| calls.call()).retry(2);
        assert_eq!(client.mutate(&retried, ()).await.data(), Some(&1));
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_is_mutating_counts_running() {
        let client = QueryClient::new();
        let mock = MockFetcher::<u8>::new();
        let deferred = mock.defer();
        let calls = mock.clone();
        let mutation = Arc::new(Mutation::new(move |_: ()| calls.call()));

        let running = {
            let client = client.clone();
            let mutation = mutation.clone();
            tokio::spawn(async move { client.mutate(&mutation, ()).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(client.is_mutating(), 1);
        assert!(mutation.state().is_loading());

        deferred.resolve(3);
        assert_eq!(running.await.unwrap().data(), Some(&3));
        assert_eq!(client.is_mutating(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_patch_supersedes_fetch() {
        let client = QueryClient::new();
        let key = query_key!["todos"];
        let mock = MockFetcher::new();
        mock.push_ok(vec!["a".to_string()]);
        let slow = mock.defer();

        let mut observer = client.query(&key, mock.fetcher(), QueryOptions::default()).unwrap();
        observer.wait_until(QueryResult::is_success).await;
        client.invalidate_queries(&key).unwrap();
        assert!(observer.result().is_fetching);

        let patch_key = key.clone();
        let mutation = Mutation::new(|_: ()| async { Ok(()) }).on_mutate(move |_, scope| {
            scope
                .update_query_data::<Vec<String>, _>(&patch_key, |todos| {
                    let mut todos = todos.unwrap_or_default();
                    todos.push("b".into());
                    todos
                })
                .unwrap();
        });
        client.mutate(&mutation, ()).await;

        slow.resolve(vec!["stale".to_string()]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            client.get_query_data::<Vec<String>>(&key).unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }
}
