//! Retry policy with exponential backoff.
//!
//! Each error category has its own [`RetryPolicy`]. The attempt loop in
//! [`run_with_retry`] bounds every attempt with a timeout, classifies
//! failures, and sleeps `base_delay * multiplier^attempt` between attempts.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use serde::Deserialize;
use tracing::{debug, warn};

use super::classify::{classify, describe, is_retryable};
use crate::error::{ErrorCategory, QueryError};

/// Decides whether to retry after the failed attempt `attempt_index` (0-based).
pub type RetryFn = Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>;

/// Delay before the retry that follows failed attempt `attempt_index`.
pub type RetryDelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Retry parameters for one error category.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Maximum number of attempts (including the first one).
  pub max_attempts: u32,
  /// Delay before the first retry.
  #[serde(deserialize_with = "crate::config::deserialize_duration")]
  pub base_delay: Duration,
  /// Growth factor per attempt; values below 1 are treated as 1.
  pub backoff_multiplier: f64,
  /// Cap on any single delay.
  #[serde(deserialize_with = "crate::config::deserialize_duration")]
  pub max_delay: Duration,
  pub is_retryable: bool,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_secs(1),
      backoff_multiplier: 2.0,
      max_delay: Duration::from_secs(30),
      is_retryable: true,
    }
  }
}

impl RetryPolicy {
  /// A policy that gives up after the first failure.
  pub fn never() -> Self {
    Self {
      max_attempts: 1,
      is_retryable: false,
      ..Self::default()
    }
  }

  pub fn with_max_attempts(mut self, attempts: u32) -> Self {
    self.max_attempts = attempts;
    self
  }

  pub fn with_base_delay(mut self, delay: Duration) -> Self {
    self.base_delay = delay;
    self
  }

  pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
    self.backoff_multiplier = multiplier;
    self
  }

  pub fn with_max_delay(mut self, delay: Duration) -> Self {
    self.max_delay = delay;
    self
  }

  /// Whether another attempt is allowed after failed attempt `attempt_index`.
  pub fn allows_retry(&self, attempt_index: u32) -> bool {
    self.is_retryable && attempt_index.saturating_add(1) < self.max_attempts
  }

  /// Calculate the delay for a given attempt number (0-indexed).
  pub fn delay_for(&self, attempt_index: u32) -> Duration {
    let multiplier = self.backoff_multiplier.max(1.0).powi(attempt_index as i32);
    let delay_secs = self.base_delay.as_secs_f64() * multiplier;
    let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
    if capped_secs.is_finite() {
      Duration::from_secs_f64(capped_secs.max(0.0))
    } else {
      self.max_delay
    }
  }
}

/// Policy per error category.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryTable {
  policies: BTreeMap<ErrorCategory, RetryPolicy>,
}

impl Default for RetryTable {
  fn default() -> Self {
    let mut policies = BTreeMap::new();
    for category in ErrorCategory::ALL {
      let policy = match category {
        ErrorCategory::Network | ErrorCategory::Timeout => RetryPolicy::default(),
        // One retry: may be transient, but do not hammer a failing backend
        ErrorCategory::Server => RetryPolicy::default().with_max_attempts(2),
        _ => RetryPolicy::never(),
      };
      debug_assert_eq!(policy.is_retryable, is_retryable(category));
      policies.insert(category, policy);
    }
    Self { policies }
  }
}

impl RetryTable {
  pub fn policy(&self, category: ErrorCategory) -> RetryPolicy {
    self
      .policies
      .get(&category)
      .cloned()
      .unwrap_or_else(RetryPolicy::never)
  }

  pub fn set(&mut self, category: ErrorCategory, policy: RetryPolicy) {
    self.policies.insert(category, policy);
  }

  pub fn with(mut self, category: ErrorCategory, policy: RetryPolicy) -> Self {
    self.set(category, policy);
    self
  }
}

/// Per-call overrides for the retry decision and delay.
#[derive(Clone, Default)]
pub struct RetryOverrides {
  pub retry: Option<RetryFn>,
  pub retry_delay: Option<RetryDelayFn>,
}

/// Outcome of a single attempt, before the retry decision.
fn failure_from(report: &color_eyre::Report, attempts: u32) -> QueryError {
  let classification = classify(report);
  QueryError::new(classification.category, describe(report))
    .with_attempts(attempts)
    .with_retryable(classification.is_retryable)
}

/// Run `operation` until it succeeds, a failure is terminal, or attempts run
/// out.
///
/// `on_retry` is called with the new retry count before each backoff sleep.
pub async fn run_with_retry<T, F, Fut>(
  label: &str,
  table: &RetryTable,
  overrides: &RetryOverrides,
  timeout: Duration,
  mut operation: F,
  mut on_retry: impl FnMut(u32),
) -> std::result::Result<T, QueryError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T>>,
{
  let mut attempt: u32 = 0;
  loop {
    let error = match tokio::time::timeout(timeout, operation()).await {
      Ok(Ok(value)) => {
        if attempt > 0 {
          debug!(label, attempts = attempt + 1, "Fetch succeeded after retries");
        }
        return Ok(value);
      }
      Ok(Err(report)) => failure_from(&report, attempt + 1),
      Err(_) => QueryError::new(
        ErrorCategory::Timeout,
        format!("attempt timed out after {:?}", timeout),
      )
      .with_attempts(attempt + 1)
      .with_retryable(is_retryable(ErrorCategory::Timeout)),
    };

    let policy = table.policy(error.category);
    let retry = match &overrides.retry {
      Some(decide) => decide(attempt, &error),
      None => policy.allows_retry(attempt),
    };
    if !retry {
      warn!(
        label,
        category = %error.category,
        attempts = attempt + 1,
        error = %error.message,
        "Giving up"
      );
      return Err(error);
    }

    let delay = match &overrides.retry_delay {
      Some(delay_for) => delay_for(attempt),
      None => policy.delay_for(attempt),
    };
    attempt += 1;
    on_retry(attempt);
    warn!(
      label,
      category = %error.category,
      attempt,
      ?delay,
      error = %error.message,
      "Attempt failed, retrying"
    );
    tokio::time::sleep(delay).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::RemoteError;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicU32, Ordering};
  use tokio::time::Instant;

  #[test]
  fn test_delay_calculation() {
    let policy = RetryPolicy::default().with_base_delay(Duration::from_secs(1));
    assert_eq!(policy.delay_for(0), Duration::from_secs(1));
    assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    assert_eq!(policy.delay_for(2), Duration::from_secs(4));
  }

  #[test]
  fn test_delay_capped_at_max() {
    let policy = RetryPolicy::default()
      .with_base_delay(Duration::from_secs(10))
      .with_max_delay(Duration::from_secs(30));
    assert_eq!(policy.delay_for(3), Duration::from_secs(30));
    assert_eq!(policy.delay_for(200), Duration::from_secs(30));
  }

  #[test]
  fn test_delays_never_decrease() {
    let policy = RetryPolicy::default()
      .with_base_delay(Duration::from_millis(250))
      .with_backoff_multiplier(1.0);
    let delays: Vec<Duration> = (0..5).map(|i| policy.delay_for(i)).collect();
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
  }

  #[test]
  fn test_default_table() {
    let table = RetryTable::default();
    assert_eq!(table.policy(ErrorCategory::Network).max_attempts, 3);
    assert_eq!(table.policy(ErrorCategory::Server).max_attempts, 2);
    assert!(!table.policy(ErrorCategory::Permission).is_retryable);
    assert!(!table.policy(ErrorCategory::Unknown).is_retryable);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_exhausted_after_max_attempts() {
    let table = RetryTable::default();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut retries = Vec::new();

    let result: std::result::Result<(), QueryError> = run_with_retry(
      "test",
      &table,
      &RetryOverrides::default(),
      Duration::from_secs(10),
      || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(eyre!(RemoteError::new("unreachable").with_status(503))) }
      },
      |n| retries.push(n),
    )
    .await;

    let error = result.unwrap_err();
    assert_eq!(error.category, ErrorCategory::Server);
    assert_eq!(error.attempts, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(retries, vec![1]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_network_retries_with_growing_delays() {
    let table = RetryTable::default();
    let mut attempt_times = Vec::new();

    let result: std::result::Result<(), QueryError> = run_with_retry(
      "test",
      &table,
      &RetryOverrides::default(),
      Duration::from_secs(10),
      || {
        attempt_times.push(Instant::now());
        async { Err(eyre!("connection refused")) }
      },
      |_| {},
    )
    .await;

    assert_eq!(result.unwrap_err().attempts, 3);
    assert_eq!(attempt_times.len(), 3);
    let gaps: Vec<Duration> = attempt_times.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(gaps, vec![Duration::from_secs(1), Duration::from_secs(2)]);
  }

  #[tokio::test]
  async fn test_non_retryable_stops_immediately() {
    let calls = AtomicU32::new(0);
    let result: std::result::Result<(), QueryError> = run_with_retry(
      "test",
      &RetryTable::default(),
      &RetryOverrides::default(),
      Duration::from_secs(10),
      || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(eyre!(RemoteError::new("denied").with_status(403))) }
      },
      |_| {},
    )
    .await;

    assert_eq!(result.unwrap_err().category, ErrorCategory::Permission);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_is_retried_as_timeout() {
    let calls = AtomicU32::new(0);
    let result: std::result::Result<(), QueryError> = run_with_retry(
      "test",
      &RetryTable::default(),
      &RetryOverrides::default(),
      Duration::from_secs(5),
      || {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<Result<()>>()
      },
      |_| {},
    )
    .await;

    let error = result.unwrap_err();
    assert_eq!(error.category, ErrorCategory::Timeout);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_overrides_take_precedence() {
    let overrides = RetryOverrides {
      retry: Some(Arc::new(|attempt, _err: &QueryError| attempt < 4)),
      retry_delay: Some(Arc::new(|_| Duration::from_millis(10))),
    };
    let calls = AtomicU32::new(0);
    let result = run_with_retry(
      "test",
      &RetryTable::default(),
      &overrides,
      Duration::from_secs(5),
      || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
          if n < 4 {
            Err(eyre!("permission denied"))
          } else {
            Ok(n)
          }
        }
      },
      |_| {},
    )
    .await;

    assert_eq!(result.unwrap(), 4);
  }
}
