//! # Refetch - Async Query Cache
//!
//! Refetch keeps the results of asynchronous reads (usually network requests) in a
//! shared cache keyed by structured query keys, in the style of SWR or TanStack
//! Query. It is framework-agnostic: the host application subscribes to queries and
//! reacts to the results it is sent.
//!
//! ## Model
//!
//! 1. **Query keys**: structured, JSON-like keys; equal keys share one cache entry
//!    regardless of object property order
//! 2. **Queries**: subscriptions that serve cached data and refetch it once stale
//! 3. **Fetches**: deduplicated per key, retried with backoff, and ordered by
//!    generation so an older response never overwrites a newer one
//! 4. **Mutations**: writes with optimistic updates and rollback
//! 5. **Garbage collection**: entries nobody watches are dropped after their cache
//!    time
//!
//! ## Core Components
//!
//! - [`QueryClient`]: Owns the cache and runs every operation
//! - [`QueryKey`]: Identity of a cached query
//! - [`QueryObserver`]: Subscription handle returned by [`QueryClient::query`]
//! - [`InfiniteQueryObserver`]: Paginated variant
//! - [`Mutation`]: A write with lifecycle callbacks
//!
//! ## Example
//!
//! ```rust,no_run
//! use refetch::prelude::*;
//! use std::time::Duration;
//!
//! async fn fetch_user(id: u32) -> Result<String, QueryError> {
//!     Ok(format!("user {id}"))
//! }
//!
//! # async fn run() -> Result<(), QueryError> {
//! let client = QueryClient::new();
//! client.spawn_gc();
//!
//! let mut user = client.query(
//!     &query_key!["user", 1],
//!     |_ctx| fetch_user(1),
//!     QueryOptions::default().stale_time(Duration::from_secs(30)),
//! )?;
//!
//! let result = user.wait_until(|r| r.is_success() || r.is_error()).await;
//! println!("{:?}", result.data());
//!
//! client.invalidate_queries(&query_key!["user"])?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! The crate emits [`tracing`] events (fetch lifecycle, retries, evictions,
//! mutations) and never installs a subscriber.

pub mod client;
pub mod config;
pub mod error;
pub mod infinite;
pub mod key;
pub mod mock;
pub mod mutation;
pub mod persist;
pub mod prelude;
pub mod query;
pub mod retry;
pub mod store;

pub use client::QueryClient;
pub use client::fetch::FetchContext;
pub use config::QueryConfig;
pub use error::{InvalidKeyError, MutationError, PersistError, QueryError};
pub use infinite::{InfiniteData, InfiniteQueryObserver, InfiniteQueryOptions, InfiniteQueryResult};
pub use key::{CanonicalKey, QueryKey};
pub use mutation::{Mutation, MutationResult, MutationScope, MutationState};
pub use persist::{JsonFileStorage, MemoryStorage, PersistentStorage};
pub use query::{QueryObserver, QueryOptions, QueryResult};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{EntrySnapshot, QueryStatus, QueryStore};
