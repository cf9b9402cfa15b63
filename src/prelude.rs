//! Prelude module for convenient imports.
//!
//! ```
//! use refetch::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryClient`] and [`QueryConfig`] - The cache and its defaults
//! - [`QueryKey`] and [`query_key!`] - Building keys
//! - [`QueryOptions`], [`QueryObserver`], [`QueryResult`] - Subscribing to queries
//! - [`InfiniteQueryOptions`], [`InfiniteQueryObserver`] - Paginated queries
//! - [`Mutation`], [`MutationResult`] - Writes
//! - [`QueryError`], [`RetryPolicy`] - Errors and retries

pub use crate::client::QueryClient;
pub use crate::client::fetch::FetchContext;
pub use crate::config::QueryConfig;
pub use crate::error::{MutationError, QueryError};
pub use crate::infinite::{InfiniteData, InfiniteQueryObserver, InfiniteQueryOptions, InfiniteQueryResult};
pub use crate::key::QueryKey;
pub use crate::mutation::{Mutation, MutationResult, MutationScope, MutationState};
pub use crate::query::{QueryObserver, QueryOptions, QueryResult};
pub use crate::query_key;
pub use crate::retry::RetryPolicy;
pub use crate::store::QueryStatus;
