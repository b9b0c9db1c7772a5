//! Per-query options.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::DEFAULT_GC_TIME;
use crate::error::QueryError;
use crate::fetch::{RetryDelayFn, RetryFn, RetryOverrides};

pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(30);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Freshness, retention and retry settings for one query.
#[derive(Clone)]
pub struct QueryOptions {
  /// How long fetched data counts as fresh
  pub stale_time: Duration,
  /// How long an unobserved entry survives
  pub gc_time: Duration,
  /// Bound on a single fetch attempt
  pub fetch_timeout: Duration,
  /// Overrides the category policy's retry decision
  pub retry: Option<RetryFn>,
  /// Overrides the category policy's backoff
  pub retry_delay: Option<RetryDelayFn>,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      stale_time: DEFAULT_STALE_TIME,
      gc_time: DEFAULT_GC_TIME,
      fetch_timeout: DEFAULT_FETCH_TIMEOUT,
      retry: None,
      retry_delay: None,
    }
  }
}

impl fmt::Debug for QueryOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryOptions")
      .field("stale_time", &self.stale_time)
      .field("gc_time", &self.gc_time)
      .field("fetch_timeout", &self.fetch_timeout)
      .field("retry", &self.retry.as_ref().map(|_| "custom"))
      .field("retry_delay", &self.retry_delay.as_ref().map(|_| "custom"))
      .finish()
  }
}

impl QueryOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn gc_time(mut self, gc_time: Duration) -> Self {
    self.gc_time = gc_time;
    self
  }

  pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
    self.fetch_timeout = timeout;
    self
  }

  /// Decide retries with `decide(attempt_index, error)` instead of the
  /// category policy.
  pub fn retry<F>(mut self, decide: F) -> Self
  where
    F: Fn(u32, &QueryError) -> bool + Send + Sync + 'static,
  {
    self.retry = Some(Arc::new(decide));
    self
  }

  /// Never retry.
  pub fn no_retry(self) -> Self {
    self.retry(|_, _| false)
  }

  pub fn retry_delay<F>(mut self, delay: F) -> Self
  where
    F: Fn(u32) -> Duration + Send + Sync + 'static,
  {
    self.retry_delay = Some(Arc::new(delay));
    self
  }

  pub(crate) fn retry_overrides(&self) -> RetryOverrides {
    RetryOverrides {
      retry: self.retry.clone(),
      retry_delay: self.retry_delay.clone(),
    }
  }
}
