//! Cache entries and the partial updates applied to them.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::error::QueryError;

/// Default time an unobserved entry survives before eviction.
pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(5 * 60);

/// Fetch state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FetchStatus {
  /// Created but never fetched
  #[default]
  Idle,
  Loading,
  Success,
  Error,
}

/// One cached resource.
///
/// Owned by the [`CacheStore`](super::CacheStore); everything else sees clones.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  /// Last successfully fetched value
  pub data: Option<Arc<Value>>,
  /// When `data` was fetched
  pub fetched_at: Option<Instant>,
  /// Set by invalidation; cleared by a successful fetch
  pub is_stale: bool,
  pub status: FetchStatus,
  /// Last classified failure
  pub error: Option<QueryError>,
  pub subscriber_count: usize,
  /// Retries made by the current fetch
  pub retry_count: u32,
  /// How long the entry survives with no subscribers; the longest window
  /// requested by any observer wins
  pub gc_time: Option<Duration>,
  /// When the subscriber count last dropped to zero (or creation time)
  pub unsubscribed_at: Option<Instant>,
  /// Bumped by every mark-stale; lets a fetch detect invalidation mid-flight
  pub invalidation_seq: u64,
  /// `invalidation_seq` when the current fetch started
  pub fetch_seq: u64,
  /// Store-wide change stamp; a later change always carries a larger one
  pub version: u64,
}

impl CacheEntry {
  pub fn new(now: Instant) -> Self {
    Self {
      data: None,
      fetched_at: None,
      is_stale: false,
      status: FetchStatus::Idle,
      error: None,
      subscriber_count: 0,
      retry_count: 0,
      gc_time: None,
      unsubscribed_at: Some(now),
      invalidation_seq: 0,
      fetch_seq: 0,
      version: 0,
    }
  }

  pub fn has_data(&self) -> bool {
    self.data.is_some()
  }

  pub fn is_fetching(&self) -> bool {
    self.status == FetchStatus::Loading
  }

  /// Age of the data at `now`, if any was fetched.
  pub fn age(&self, now: Instant) -> Option<Duration> {
    self.fetched_at.map(|t| now.saturating_duration_since(t))
  }

  /// Stale if invalidated, never fetched, or older than `stale_time`.
  pub fn is_stale_at(&self, now: Instant, stale_time: Duration) -> bool {
    if self.is_stale {
      return true;
    }
    match self.age(now) {
      Some(age) => age >= stale_time,
      None => true,
    }
  }

  /// True once the GC window has elapsed with nobody subscribed.
  pub fn is_collectable(&self, now: Instant) -> bool {
    if self.subscriber_count > 0 || self.is_fetching() {
      return false;
    }
    self
      .unsubscribed_at
      .map(|t| now.saturating_duration_since(t) >= self.gc_time.unwrap_or(DEFAULT_GC_TIME))
      .unwrap_or(false)
  }

  /// `Success` implies data and a fetch time.
  pub fn check_invariants(&self) -> bool {
    self.status != FetchStatus::Success || (self.data.is_some() && self.fetched_at.is_some())
  }
}

/// Partial update for a [`CacheEntry`].
///
/// Unset fields leave the entry unchanged.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
  pub data: Option<Arc<Value>>,
  pub fetched_at: Option<Instant>,
  pub is_stale: Option<bool>,
  pub status: Option<FetchStatus>,
  /// `Some(None)` clears the error
  pub error: Option<Option<QueryError>>,
  pub retry_count: Option<u32>,
  pub gc_time: Option<Duration>,
  /// Remember the current `invalidation_seq` as the fetch's starting point
  pub starts_fetch: bool,
  /// Leave the entry stale if it was invalidated since the fetch started
  pub settles_fetch: bool,
}

impl EntryPatch {
  pub fn new() -> Self {
    Self::default()
  }

  /// A fetch has started.
  pub fn loading() -> Self {
    Self {
      status: Some(FetchStatus::Loading),
      retry_count: Some(0),
      starts_fetch: true,
      ..Self::default()
    }
  }

  /// A fetch succeeded at `now`.
  pub fn success(data: Arc<Value>, now: Instant) -> Self {
    Self {
      data: Some(data),
      fetched_at: Some(now),
      is_stale: Some(false),
      status: Some(FetchStatus::Success),
      error: Some(None),
      retry_count: Some(0),
      ..Self::default()
    }
  }

  /// A fetch failed for good. Existing data is left in place.
  pub fn failure(error: QueryError) -> Self {
    Self {
      status: Some(FetchStatus::Error),
      error: Some(Some(error)),
      ..Self::default()
    }
  }

  pub fn stale(mut self, is_stale: bool) -> Self {
    self.is_stale = Some(is_stale);
    self
  }

  /// Finish the fetch started by [`loading`](Self::loading). An
  /// invalidation that landed in between keeps the entry stale.
  pub fn settles_fetch(mut self) -> Self {
    self.settles_fetch = true;
    self
  }

  pub fn retry_count(mut self, retry_count: u32) -> Self {
    self.retry_count = Some(retry_count);
    self
  }

  pub fn gc_time(mut self, gc_time: Duration) -> Self {
    self.gc_time = Some(gc_time);
    self
  }

  pub(crate) fn apply(self, entry: &mut CacheEntry) {
    if let Some(data) = self.data {
      entry.data = Some(data);
    }
    if let Some(fetched_at) = self.fetched_at {
      entry.fetched_at = Some(fetched_at);
    }
    if let Some(is_stale) = self.is_stale {
      entry.is_stale = is_stale;
    }
    if let Some(status) = self.status {
      entry.status = status;
    }
    if let Some(error) = self.error {
      entry.error = error;
    }
    if let Some(retry_count) = self.retry_count {
      entry.retry_count = retry_count;
    }
    if let Some(gc_time) = self.gc_time {
      entry.gc_time = Some(entry.gc_time.map_or(gc_time, |current| current.max(gc_time)));
    }
    if self.starts_fetch {
      entry.fetch_seq = entry.invalidation_seq;
    }
    if self.settles_fetch && entry.invalidation_seq != entry.fetch_seq {
      entry.is_stale = true;
    }
    debug_assert!(entry.check_invariants(), "success entry without data");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ErrorCategory;
  use serde_json::json;

  #[test]
  fn new_entry_is_idle_and_stale() {
    let now = Instant::now();
    let entry = CacheEntry::new(now);
    assert_eq!(entry.status, FetchStatus::Idle);
    assert!(entry.is_stale_at(now, Duration::from_secs(60)));
    assert!(entry.check_invariants());
  }

  #[test]
  fn staleness_window() {
    let now = Instant::now();
    let mut entry = CacheEntry::new(now);
    EntryPatch::success(Arc::new(json!(1)), now).apply(&mut entry);

    let stale_time = Duration::from_secs(30);
    assert!(!entry.is_stale_at(now + Duration::from_secs(29), stale_time));
    assert!(entry.is_stale_at(now + Duration::from_secs(31), stale_time));

    EntryPatch::new().stale(true).apply(&mut entry);
    assert!(entry.is_stale_at(now, stale_time));
  }

  #[test]
  fn failure_keeps_existing_data() {
    let now = Instant::now();
    let mut entry = CacheEntry::new(now);
    EntryPatch::success(Arc::new(json!(["T1"])), now).apply(&mut entry);
    EntryPatch::loading().apply(&mut entry);
    EntryPatch::failure(QueryError::new(ErrorCategory::Network, "offline")).apply(&mut entry);

    assert_eq!(entry.status, FetchStatus::Error);
    assert_eq!(entry.data.as_deref(), Some(&json!(["T1"])));
    assert_eq!(entry.error.as_ref().map(|e| e.category), Some(ErrorCategory::Network));
  }

  #[test]
  fn success_clears_error_and_retries() {
    let now = Instant::now();
    let mut entry = CacheEntry::new(now);
    EntryPatch::failure(QueryError::new(ErrorCategory::Server, "boom")).apply(&mut entry);
    EntryPatch::new().retry_count(2).apply(&mut entry);
    EntryPatch::success(Arc::new(json!(null)), now).apply(&mut entry);

    assert!(entry.error.is_none());
    assert_eq!(entry.retry_count, 0);
    assert!(!entry.is_stale);
  }

  #[test]
  fn invalidation_during_fetch_keeps_entry_stale() {
    let now = Instant::now();
    let mut entry = CacheEntry::new(now);
    EntryPatch::loading().apply(&mut entry);
    entry.is_stale = true;
    entry.invalidation_seq += 1;
    EntryPatch::success(Arc::new(json!(["T1"])), now)
      .settles_fetch()
      .apply(&mut entry);
    assert!(entry.is_stale);
    assert_eq!(entry.data.as_deref(), Some(&json!(["T1"])));

    // The next fetch starts after the invalidation and clears it
    EntryPatch::loading().apply(&mut entry);
    EntryPatch::success(Arc::new(json!(["T1", "T2"])), now)
      .settles_fetch()
      .apply(&mut entry);
    assert!(!entry.is_stale);
  }

  #[test]
  fn gc_time_only_grows() {
    let now = Instant::now();
    let mut entry = CacheEntry::new(now);
    EntryPatch::new().gc_time(Duration::from_secs(10)).apply(&mut entry);
    assert_eq!(entry.gc_time, Some(Duration::from_secs(10)));
    EntryPatch::new().gc_time(Duration::from_secs(600)).apply(&mut entry);
    EntryPatch::new().gc_time(Duration::from_secs(1)).apply(&mut entry);
    assert_eq!(entry.gc_time, Some(Duration::from_secs(600)));
  }

  #[test]
  fn collectable_only_without_subscribers() {
    let now = Instant::now();
    let mut entry = CacheEntry::new(now);
    entry.gc_time = Some(Duration::from_secs(10));
    assert!(!entry.is_collectable(now + Duration::from_secs(9)));
    assert!(entry.is_collectable(now + Duration::from_secs(10)));

    entry.subscriber_count = 1;
    assert!(!entry.is_collectable(now + Duration::from_secs(100)));
  }
}
