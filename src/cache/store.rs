//! In-memory cache store.
//!
//! Owns every [`CacheEntry`], fans out change notifications to per-key
//! listeners, and evicts entries nobody has observed for their GC window.
//! All mutation goes through [`CacheStore::upsert`] and
//! [`CacheStore::mark_stale`]; listeners run synchronously after the internal
//! lock is released, so a listener may call back into the store. Deliveries
//! for one key can interleave across threads; every change carries a
//! store-wide [`CacheEntry::version`] so listeners can drop snapshots older
//! than one they have already seen.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use super::entry::{CacheEntry, EntryPatch, FetchStatus};
use super::key::{is_prefix_of, CacheKey};
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";

/// Callback invoked with the entry's new state after every change.
///
/// Must not block on locks held by whoever changed the entry.
pub type Listener = Arc<dyn Fn(&CacheEntry) + Send + Sync>;

struct StoreState {
  entries: HashMap<CacheKey, CacheEntry>,
  listeners: HashMap<CacheKey, Vec<(u64, Listener)>>,
  next_listener_id: u64,
  version: u64,
}

struct Shared {
  state: Mutex<StoreState>,
}

/// Shared handle to the cache. Cloning is cheap; clones see the same entries.
#[derive(Clone)]
pub struct CacheStore {
  shared: Arc<Shared>,
}

/// Pending notification collected under the lock and delivered after it.
struct Notification {
  key: CacheKey,
  entry: CacheEntry,
  listeners: Vec<Listener>,
}

impl Notification {
  fn deliver(self) {
    for listener in &self.listeners {
      listener(&self.entry);
    }
  }
}

/// A change already applied to the store whose listeners have not run yet.
///
/// Lets a caller make the change under its own lock and notify after
/// releasing it.
#[must_use = "listeners only run on deliver"]
pub(crate) struct StagedUpdate {
  store: CacheStore,
  notification: Notification,
  gc_after: Option<Duration>,
}

impl StagedUpdate {
  pub(crate) fn deliver(self) -> CacheEntry {
    if let Some(delay) = self.gc_after {
      self
        .store
        .schedule_gc(self.notification.key.clone(), delay);
    }
    let entry = self.notification.entry.clone();
    self.notification.deliver();
    entry
  }
}

impl CacheStore {
  pub fn new() -> Self {
    Self {
      shared: Arc::new(Shared {
        state: Mutex::new(StoreState {
          entries: HashMap::new(),
          listeners: HashMap::new(),
          next_listener_id: 0,
          version: 0,
        }),
      }),
    }
  }

  fn lock(&self, op: &'static str) -> MutexGuard<'_, StoreState> {
    mutex_lock(&self.shared.state, SOURCE, op)
  }

  /// Look up an entry. Never triggers a fetch.
  ///
  /// # Panics
  ///
  /// Panics on a malformed key, which indicates a key-construction bug.
  pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
    assert_well_formed(key, "get");
    self.lock("get").entries.get(key).cloned()
  }

  /// Apply a partial update, creating the entry if absent, then notify the
  /// key's listeners. Returns the updated entry.
  ///
  /// # Panics
  ///
  /// Panics on a malformed key.
  pub fn upsert(&self, key: &CacheKey, patch: EntryPatch) -> CacheEntry {
    self.stage(key, patch).deliver()
  }

  /// Apply `patch` now and hand back the notification for later delivery.
  pub(crate) fn stage(&self, key: &CacheKey, patch: EntryPatch) -> StagedUpdate {
    assert_well_formed(key, "upsert");
    let now = Instant::now();

    let mut state = self.lock("upsert");
    let version = state.next_version();
    let mut created = false;
    let entry = state.entries.entry(key.clone()).or_insert_with(|| {
      created = true;
      CacheEntry::new(now)
    });
    let was_fetching = entry.is_fetching();
    patch.apply(entry);
    entry.version = version;

    let unobserved = entry.subscriber_count == 0 && !entry.is_fetching();
    let gc_after = (unobserved && (created || was_fetching)).then(|| remaining_gc(entry, now));
    let snapshot = entry.clone();
    let notification = state.notification_for(key, snapshot);
    drop(state);

    StagedUpdate {
      store: self.clone(),
      notification,
      gc_after,
    }
  }

  /// Mark every entry under `prefix` stale. Does not fetch anything.
  ///
  /// Returns the keys that matched.
  pub fn mark_stale(&self, prefix: &CacheKey) -> Vec<CacheKey> {
    let notifications: Vec<Notification> = {
      let mut state = self.lock("mark_stale");
      let keys: Vec<CacheKey> = state
        .entries
        .keys()
        .filter(|k| is_prefix_of(prefix, k))
        .cloned()
        .collect();

      let mut notifications = Vec::with_capacity(keys.len());
      for key in &keys {
        let version = state.next_version();
        let Some(entry) = state.entries.get_mut(key) else {
          continue;
        };
        entry.is_stale = true;
        entry.invalidation_seq += 1;
        entry.version = version;
        let snapshot = entry.clone();
        notifications.push(state.notification_for(key, snapshot));
      }
      notifications
    };

    debug!(prefix = %prefix, matched = notifications.len(), "Marked entries stale");
    let keys = notifications.iter().map(|n| n.key.clone()).collect();
    for notification in notifications {
      notification.deliver();
    }
    keys
  }

  /// Register a listener for `key` and count it as a subscriber.
  ///
  /// The returned handle unsubscribes when dropped or on
  /// [`StoreSubscription::unsubscribe`]; doing both is fine.
  pub fn subscribe(&self, key: &CacheKey, listener: Listener) -> StoreSubscription {
    self.subscribe_with_gc(key, listener, None)
  }

  /// Like [`subscribe`](Self::subscribe), also requesting that the entry
  /// survive at least `gc_time` once unobserved.
  pub fn subscribe_with_gc(
    &self,
    key: &CacheKey,
    listener: Listener,
    gc_time: Option<Duration>,
  ) -> StoreSubscription {
    assert_well_formed(key, "subscribe");
    let now = Instant::now();
    let mut state = self.lock("subscribe");

    let id = state.next_listener_id;
    state.next_listener_id += 1;

    let entry = state
      .entries
      .entry(key.clone())
      .or_insert_with(|| CacheEntry::new(now));
    entry.subscriber_count += 1;
    entry.unsubscribed_at = None;
    if let Some(gc_time) = gc_time {
      EntryPatch::new().gc_time(gc_time).apply(entry);
    }
    let count = entry.subscriber_count;

    state
      .listeners
      .entry(key.clone())
      .or_default()
      .push((id, listener));
    drop(state);

    debug!(key = %key, subscribers = count, "Subscribed");
    StoreSubscription {
      store: Arc::downgrade(&self.shared),
      key: key.clone(),
      id,
      active: AtomicBool::new(true),
    }
  }

  fn release(&self, key: &CacheKey, id: u64) {
    let now = Instant::now();
    let gc_after = {
      let mut state = self.lock("unsubscribe");
      if let Some(listeners) = state.listeners.get_mut(key) {
        listeners.retain(|(listener_id, _)| *listener_id != id);
        if listeners.is_empty() {
          state.listeners.remove(key);
        }
      }

      match state.entries.get_mut(key) {
        Some(entry) => {
          entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
          if entry.subscriber_count == 0 {
            entry.unsubscribed_at = Some(now);
            Some(remaining_gc(entry, now))
          } else {
            None
          }
        }
        None => None,
      }
    };

    if let Some(delay) = gc_after {
      debug!(key = %key, "Last subscriber left");
      self.schedule_gc(key.clone(), delay);
    }
  }

  /// Evict every entry whose GC window has elapsed with no subscribers.
  ///
  /// Returns the evicted keys.
  pub fn gc(&self) -> Vec<CacheKey> {
    let now = Instant::now();
    let mut state = self.lock("gc");
    let evicted: Vec<CacheKey> = state
      .entries
      .iter()
      .filter(|(_, entry)| entry.is_collectable(now))
      .map(|(key, _)| key.clone())
      .collect();

    for key in &evicted {
      state.entries.remove(key);
      state.listeners.remove(key);
    }
    drop(state);

    if !evicted.is_empty() {
      debug!(evicted = evicted.len(), "Garbage collected cache entries");
    }
    evicted
  }

  /// Evict a single key if it is collectable right now.
  fn collect_key(&self, key: &CacheKey) -> bool {
    let now = Instant::now();
    let mut state = self.lock("collect_key");
    let collectable = state
      .entries
      .get(key)
      .is_some_and(|entry| entry.is_collectable(now));
    if collectable {
      state.entries.remove(key);
      state.listeners.remove(key);
      debug!(key = %key, "Evicted unobserved entry");
    }
    collectable
  }

  /// Run a one-shot eviction check for `key` after `delay`.
  ///
  /// Without a tokio runtime this is a no-op; the periodic [`gc`](Self::gc)
  /// still bounds memory.
  fn schedule_gc(&self, key: CacheKey, delay: Duration) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      return;
    };
    let store = Arc::downgrade(&self.shared);
    handle.spawn(async move {
      tokio::time::sleep(delay).await;
      if let Some(shared) = store.upgrade() {
        CacheStore { shared }.collect_key(&key);
      }
    });
  }

  /// Insert previously persisted data for an unknown or data-less key.
  ///
  /// Returns false when the key already holds data, which is never replaced.
  pub fn hydrate(&self, key: &CacheKey, data: Value, fetched_at: Instant, is_stale: bool) -> bool {
    assert_well_formed(key, "hydrate");
    if self.get(key).is_some_and(|e| e.has_data()) {
      return false;
    }
    self.upsert(
      key,
      EntryPatch::success(Arc::new(data), fetched_at).stale(is_stale),
    );
    true
  }

  /// Keys currently matching `prefix`.
  pub fn keys_matching(&self, prefix: &CacheKey) -> Vec<CacheKey> {
    let state = self.lock("keys_matching");
    let mut keys: Vec<CacheKey> = state
      .entries
      .keys()
      .filter(|k| is_prefix_of(prefix, k))
      .cloned()
      .collect();
    keys.sort();
    keys
  }

  /// Keys under `prefix` with at least one subscriber.
  pub fn subscribed_keys_matching(&self, prefix: &CacheKey) -> Vec<CacheKey> {
    let state = self.lock("subscribed_keys_matching");
    let mut keys: Vec<CacheKey> = state
      .entries
      .iter()
      .filter(|(k, e)| e.subscriber_count > 0 && is_prefix_of(prefix, k))
      .map(|(k, _)| k.clone())
      .collect();
    keys.sort();
    keys
  }

  pub fn subscribed_keys(&self) -> Vec<CacheKey> {
    self.subscribed_keys_matching(&CacheKey::root())
  }

  /// Clone of every entry, sorted by key.
  pub fn snapshot(&self) -> Vec<(CacheKey, CacheEntry)> {
    let state = self.lock("snapshot");
    let mut entries: Vec<(CacheKey, CacheEntry)> = state
      .entries
      .iter()
      .map(|(k, e)| (k.clone(), e.clone()))
      .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
  }

  pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
    let mut state = self.lock("remove");
    state.listeners.remove(key);
    state.entries.remove(key)
  }

  /// Drop every entry and listener.
  pub fn clear(&self) {
    let mut state = self.lock("clear");
    state.entries.clear();
    state.listeners.clear();
  }

  pub fn len(&self) -> usize {
    self.lock("len").entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Count of entries in each fetch status, for diagnostics.
  pub fn status_counts(&self) -> HashMap<FetchStatus, usize> {
    let state = self.lock("status_counts");
    let mut counts = HashMap::new();
    for entry in state.entries.values() {
      *counts.entry(entry.status).or_insert(0) += 1;
    }
    counts
  }
}

impl Default for CacheStore {
  fn default() -> Self {
    Self::new()
  }
}

impl StoreState {
  fn next_version(&mut self) -> u64 {
    self.version += 1;
    self.version
  }

  fn notification_for(&self, key: &CacheKey, entry: CacheEntry) -> Notification {
    let listeners: Vec<Listener> = self
      .listeners
      .get(key)
      .map(|ls| ls.iter().map(|(_, l)| Arc::clone(l)).collect())
      .unwrap_or_default();
    Notification {
      key: key.clone(),
      entry,
      listeners,
    }
  }
}

/// Unsubscribe handle returned by [`CacheStore::subscribe`].
pub struct StoreSubscription {
  store: Weak<Shared>,
  key: CacheKey,
  id: u64,
  active: AtomicBool,
}

impl StoreSubscription {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Stop receiving notifications and decrement the subscriber count.
  /// Calling this more than once is a no-op.
  pub fn unsubscribe(&self) {
    if !self.active.swap(false, Ordering::SeqCst) {
      return;
    }
    if let Some(shared) = self.store.upgrade() {
      CacheStore { shared }.release(&self.key, self.id);
    }
  }
}

impl Drop for StoreSubscription {
  fn drop(&mut self) {
    self.unsubscribe();
  }
}

impl std::fmt::Debug for StoreSubscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StoreSubscription")
      .field("key", &self.key)
      .field("active", &self.active.load(Ordering::SeqCst))
      .finish()
  }
}

fn assert_well_formed(key: &CacheKey, op: &str) {
  assert!(
    key.is_well_formed(),
    "CacheStore::{} called with malformed key {}",
    op,
    key
  );
}

fn remaining_gc(entry: &CacheEntry, now: Instant) -> Duration {
  let gc_time = entry.gc_time.unwrap_or(super::entry::DEFAULT_GC_TIME);
  let idle = entry
    .unsubscribed_at
    .map(|t| now.saturating_duration_since(t))
    .unwrap_or_default();
  gc_time.saturating_sub(idle)
}
