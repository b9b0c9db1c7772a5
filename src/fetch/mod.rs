//! Fetching: failure classification, retry with backoff, and the executor
//! that deduplicates concurrent fetches of one key.

mod classify;
mod executor;
mod retry;

pub use classify::{
  category_from_code, category_from_status, classify, classify_error, describe, is_retryable,
  Classification,
};
pub use executor::{FetchExecutor, FetchResult, QueryFn, QuerySpec, SharedFetch};
pub use retry::{run_with_retry, RetryDelayFn, RetryFn, RetryOverrides, RetryPolicy, RetryTable};
