//! Paginated queries.
//!
//! An infinite query caches a growing list of pages under one key. The first page
//! is fetched with the initial cursor; every further page is fetched on request
//! with the cursor derived from the last page. A full refetch (invalidation,
//! [`InfiniteQueryObserver::refetch`]) reloads as many pages as were loaded,
//! walking the cursors again from the start, and replaces the whole value at once.
//!
//! # Example
//!
//! ```rust,no_run
//! use refetch::prelude::*;
//!
//! # #[derive(Clone)]
//! # struct FeedPage { items: Vec<String>, next: Option<String> }
//! # async fn fetch_feed(_cursor: Option<String>) -> Result<FeedPage, QueryError> {
//! #     Ok(FeedPage { items: Vec::new(), next: None })
//! # }
//! # async fn run(client: QueryClient) -> Result<(), QueryError> {
//! let feed = client.infinite_query(
//!     &query_key!["feed"],
//!     |cursor: Option<String>, _ctx| fetch_feed(cursor),
//!     InfiniteQueryOptions::new(None, |page: &FeedPage| page.next.clone().map(Some)),
//! )?;
//!
//! while feed.has_next_page() {
//!     feed.fetch_next_page().await?;
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use tracing::trace;

use crate::client::fetch::{AttemptFn, FetchContext, FetchJob, MergeFn, NextPageFn, RefetchFn};
use crate::client::{QueryClient, Registration};
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::query::{QueryObserver, QueryOptions, QueryResult, Settings};
use crate::store::AnyData;

type NextParamFn<P, C> = Arc<dyn Fn(&P) -> Option<C> + Send + Sync>;

/// The pages loaded so far and the cursor that produced each one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfiniteData<P, C> {
    pub pages: Vec<P>,
    pub page_params: Vec<C>,
}

impl<P, C> InfiniteData<P, C> {
    #[must_use]
    pub fn last_page(&self) -> Option<&P> {
        self.pages.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    fn push(&mut self, page: P, param: C) {
        self.pages.push(page);
        self.page_params.push(param);
    }
}

impl<P, C> Default for InfiniteData<P, C> {
    fn default() -> Self {
        Self {
            pages: Vec::new(),
            page_params: Vec::new(),
        }
    }
}

/// Options for [`QueryClient::infinite_query`].
pub struct InfiniteQueryOptions<P, C> {
    initial_page_param: C,
    get_next_page_param: NextParamFn<P, C>,
    query: QueryOptions<InfiniteData<P, C>>,
}

impl<P, C> InfiniteQueryOptions<P, C> {
    /// `get_next_page_param` derives the next cursor from the last page; `None`
    /// means there are no more pages.
    pub fn new<G>(initial_page_param: C, get_next_page_param: G) -> Self
    where
        P: Clone + 'static,
        C: Clone + 'static,
        G: Fn(&P) -> Option<C> + Send + Sync + 'static,
    {
        Self {
            initial_page_param,
            get_next_page_param: Arc::new(get_next_page_param),
            query: QueryOptions::default(),
        }
    }

    /// Staleness, caching, retry and the other per-query options.
    #[must_use]
    pub fn with_options(mut self, options: QueryOptions<InfiniteData<P, C>>) -> Self {
        self.query = options;
        self
    }
}

impl<P, C: fmt::Debug> fmt::Debug for InfiniteQueryOptions<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfiniteQueryOptions")
            .field("initial_page_param", &self.initial_page_param)
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

/// What a subscriber sees of an infinite query.
#[derive(Debug, Clone, PartialEq)]
pub struct InfiniteQueryResult<P, C> {
    pub query: QueryResult<InfiniteData<P, C>>,
    /// Whether the last page yields a cursor.
    pub has_next_page: bool,
}

impl<P, C> InfiniteQueryResult<P, C> {
    /// The loaded pages, empty until the first one arrives.
    #[must_use]
    pub fn pages(&self) -> &[P] {
        self.query.data().map(|data| data.pages.as_slice()).unwrap_or_default()
    }

    fn from_query(query: QueryResult<InfiniteData<P, C>>, get_next_page_param: &NextParamFn<P, C>) -> Self {
        let has_next_page = query
            .data()
            .and_then(InfiniteData::last_page)
            .and_then(|page| get_next_page_param(page))
            .is_some();
        Self { query, has_next_page }
    }
}

/// Subscription handle returned by [`QueryClient::infinite_query`].
pub struct InfiniteQueryObserver<P, C> {
    observer: QueryObserver<InfiniteData<P, C>>,
    get_next_page_param: NextParamFn<P, C>,
    client: QueryClient,
}

impl<P, C> InfiniteQueryObserver<P, C>
where
    P: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn key(&self) -> &QueryKey {
        self.observer.key()
    }

    #[must_use]
    pub fn result(&self) -> InfiniteQueryResult<P, C> {
        InfiniteQueryResult::from_query(self.observer.result(), &self.get_next_page_param)
    }

    #[must_use]
    pub fn has_next_page(&self) -> bool {
        self.result().has_next_page
    }

    /// Waits for the next notification.
    pub async fn changed(&mut self) -> InfiniteQueryResult<P, C> {
        let query = self.observer.changed().await;
        InfiniteQueryResult::from_query(query, &self.get_next_page_param)
    }

    /// Waits until the current or a future result satisfies `predicate`.
    pub async fn wait_until(
        &mut self,
        mut predicate: impl FnMut(&InfiniteQueryResult<P, C>) -> bool,
    ) -> InfiniteQueryResult<P, C> {
        let next = Arc::clone(&self.get_next_page_param);
        let query = self
            .observer
            .wait_until(|query| predicate(&InfiniteQueryResult::from_query(query.clone(), &next)))
            .await;
        InfiniteQueryResult::from_query(query, &self.get_next_page_param)
    }

    /// Loads the page after the last one and waits for it. Does nothing when there
    /// is no next cursor.
    pub async fn fetch_next_page(&self) -> Result<InfiniteQueryResult<P, C>, QueryError> {
        self.client.fetch_next_page(self.key()).await?;
        Ok(self.result())
    }

    /// Reloads every loaded page from the initial cursor.
    pub async fn refetch(&self) -> InfiniteQueryResult<P, C> {
        let query = self.observer.refetch().await;
        InfiniteQueryResult::from_query(query, &self.get_next_page_param)
    }
}

impl<P, C> fmt::Debug for InfiniteQueryObserver<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfiniteQueryObserver")
            .field("observer", &self.observer)
            .finish_non_exhaustive()
    }
}

impl QueryClient {
    /// Subscribes to a paginated query. `fetcher` receives the cursor of the page
    /// to load.
    pub fn infinite_query<P, C, F, Fut>(
        &self,
        key: &QueryKey,
        fetcher: F,
        options: InfiniteQueryOptions<P, C>,
    ) -> Result<InfiniteQueryObserver<P, C>, QueryError>
    where
        P: Clone + Send + Sync + 'static,
        C: Clone + Send + Sync + 'static,
        F: Fn(C, FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<P, QueryError>> + Send + 'static,
    {
        let InfiniteQueryOptions {
            initial_page_param,
            get_next_page_param,
            query,
        } = options;
        let settings = query.settings(self.config());
        let fetcher = Arc::new(fetcher);

        let refetch = full_refetch(
            Arc::clone(&fetcher),
            initial_page_param,
            Arc::clone(&get_next_page_param),
            settings.clone(),
        );
        let next_page = next_page(fetcher, Arc::clone(&get_next_page_param), settings.clone());

        let observer = self.observe(
            key,
            Registration {
                refetch,
                next_page: Some(next_page),
                options: query,
                settings,
            },
            None,
        )?;
        Ok(InfiniteQueryObserver {
            observer,
            get_next_page_param,
            client: self.clone(),
        })
    }

    /// Loads the next page of the infinite query at `key` and waits for it.
    ///
    /// Returns `Ok(false)` without fetching when the last page has no next cursor,
    /// or when the query is disabled or waiting on a dependency. If any fetch of
    /// the key is already in flight, waits for that one instead.
    pub async fn fetch_next_page(&self, key: &QueryKey) -> Result<bool, QueryError> {
        let canonical = key.canonical()?;
        self.ensure_running()?;
        let Some(fetch) = self.start_next_page(&canonical) else {
            trace!(%key, "no next page");
            return Ok(false);
        };
        self.wait_fetch(&canonical, fetch).await?;
        Ok(true)
    }
}

fn full_refetch<P, C, F, Fut>(
    fetcher: Arc<F>,
    initial_page_param: C,
    get_next_page_param: NextParamFn<P, C>,
    settings: Settings,
) -> RefetchFn
where
    P: Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
    F: Fn(C, FetchContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<P, QueryError>> + Send + 'static,
{
    Arc::new(move |current: Option<&AnyData>| {
        let loaded = current
            .and_then(|data| data.downcast_ref::<InfiniteData<P, C>>())
            .map_or(1, |data| data.len().max(1));

        let fetcher = Arc::clone(&fetcher);
        let initial = initial_page_param.clone();
        let next = Arc::clone(&get_next_page_param);
        let attempt: AttemptFn = Arc::new(move |ctx: FetchContext| {
            let fetcher = Arc::clone(&fetcher);
            let next = Arc::clone(&next);
            let mut param = initial.clone();
            async move {
                let mut data = InfiniteData::default();
                while data.len() < loaded {
                    let page = fetcher(param.clone(), ctx.clone()).await?;
                    let following = next(&page);
                    data.push(page, param);
                    match following {
                        Some(cursor) => param = cursor,
                        None => break,
                    }
                }
                Ok(Arc::new(data) as AnyData)
            }
            .boxed()
        });

        FetchJob {
            attempt,
            merge: None,
            retry: settings.retry.clone(),
            timeout: settings.timeout,
        }
    })
}

fn next_page<P, C, F, Fut>(
    fetcher: Arc<F>,
    get_next_page_param: NextParamFn<P, C>,
    settings: Settings,
) -> NextPageFn
where
    P: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
    F: Fn(C, FetchContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<P, QueryError>> + Send + 'static,
{
    Arc::new(move |current: &AnyData| {
        let data = current.downcast_ref::<InfiniteData<P, C>>()?;
        let cursor = get_next_page_param(data.last_page()?)?;

        let fetcher = Arc::clone(&fetcher);
        let param = cursor.clone();
        let attempt: AttemptFn = Arc::new(move |ctx: FetchContext| {
            let page = fetcher(param.clone(), ctx);
            async move { page.await.map(|page| Arc::new(page) as AnyData) }.boxed()
        });

        // Appends to whatever the entry holds when the page lands.
        let merge: MergeFn = Box::new(move |current: Option<&AnyData>, page: AnyData| {
            let mut data = current
                .and_then(|data| data.downcast_ref::<InfiniteData<P, C>>())
                .cloned()
                .unwrap_or_default();
            if let Some(page) = page.downcast_ref::<P>() {
                data.push(page.clone(), cursor);
            }
            Arc::new(data) as AnyData
        });

        Some(FetchJob {
            attempt,
            merge: Some(merge),
            retry: settings.retry.clone(),
            timeout: settings.timeout,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Pages of three numbers; the cursor is the first number of the page.
    fn numbers(limit: u32) -> impl Fn(u32, FetchContext) -> futures::future::Ready<Result<Vec<u32>, QueryError>> {
        move |start, _ctx| futures::future::ready(Ok((start..(start + 3).min(limit)).collect()))
    }

    fn options(limit: u32) -> InfiniteQueryOptions<Vec<u32>, u32> {
        InfiniteQueryOptions::new(0, move |page: &Vec<u32>| {
            page.last().map(|last| last + 1).filter(|next| *next < limit)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_pages_accumulate() {
        let client = QueryClient::new();
        let mut feed = client.infinite_query(&query_key!["numbers"], numbers(7), options(7)).unwrap();

        let first = feed.wait_until(|r| r.query.is_success()).await;
        assert_eq!(first.pages(), &[vec![0, 1, 2]]);
        assert!(first.has_next_page);

        let second = feed.fetch_next_page().await.unwrap();
        assert_eq!(second.pages().len(), 2);
        assert_eq!(second.query.data().unwrap().page_params, vec![0, 3]);

        let third = feed.fetch_next_page().await.unwrap();
        assert_eq!(third.pages()[2], vec![6]);
        assert!(!third.has_next_page);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_next_page_without_cursor_is_noop() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let fetcher = move |start: u32, ctx: FetchContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            numbers(3)(start, ctx)
        };

        let key = query_key!["numbers"];
        let mut feed = client.infinite_query(&key, fetcher, options(3)).unwrap();
        let before = feed.wait_until(|r| r.query.is_success()).await;
        assert!(!before.has_next_page);

        assert!(!client.fetch_next_page(&key).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(feed.result(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_reloads_all_pages() {
        let client = QueryClient::new();
        let mut feed = client.infinite_query(&query_key!["numbers"], numbers(9), options(9)).unwrap();
        feed.wait_until(|r| r.query.is_success()).await;
        feed.fetch_next_page().await.unwrap();

        let refreshed = feed.refetch().await;
        assert_eq!(refreshed.pages(), &[vec![0, 1, 2], vec![3, 4, 5]]);
        assert_eq!(refreshed.query.data().unwrap().page_params, vec![0, 3]);
    }
}
