//! swrsync: a stale-while-revalidate query cache for interactive clients.
//!
//! Consumers subscribe to cache keys through [`QueryClient::query`] and get
//! cached data immediately while stale entries revalidate in the background.
//! Concurrent fetches of one key are deduplicated, failures are classified and
//! retried with backoff, and mutations invalidate the keys they affect through
//! a declarative rule table.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod fetch;
pub mod invalidation;
pub mod mutation;
pub mod options;
pub mod query;

pub use cache::{make_key, CacheKey, CacheStore, EntityKeys, KeyParam, QueryKey};
pub use client::{ClientConfig, QueryClient};
pub use config::Config;
pub use error::{ErrorCategory, QueryError, RemoteError};
pub use event::{Event, EventHandler};
pub use invalidation::{AffectedIds, InvalidationRules, MutationKind, PrefixTemplate};
pub use mutation::{Mutation, MutationOptions, MutationStatus};
pub use options::QueryOptions;
pub use query::{Query, QueryResult, QueryStatus};
