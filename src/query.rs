//! Query handles: a consumer's view of one cache entry.
//!
//! Inspired by TanStack Query. A [`Query<T>`] subscribes to its key in the
//! cache, starts a fetch when the entry is missing or stale, and exposes the
//! decoded data together with loading and error state.
//!
//! # Example
//!
//! ```ignore
//! let teams = EntityKeys::new("team");
//! let remote = remote.clone();
//! let mut query = client.query(teams.scope("byEvent", ["E1"]), move || {
//!     let remote = remote.clone();
//!     async move { remote.teams_by_event("E1").await }
//! });
//!
//! // Wait for something to change, then render
//! query.changed().await;
//! match query.status() {
//!     QueryStatus::Loading => render_spinner(),
//!     QueryStatus::Success => render_teams(query.data().unwrap()),
//!     QueryStatus::Error => render_error(query.error().unwrap()),
//! }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::{mutex_lock, CacheEntry, CacheKey, FetchStatus, StoreSubscription};
use crate::client::QueryClient;
use crate::error::{ErrorCategory, QueryError};
use crate::fetch::QuerySpec;

/// What a consumer should render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// No data yet
  Loading,
  /// Data is available
  Success,
  /// The last fetch failed; stale data may still be present
  Error,
}

/// Snapshot of a query's state.
#[derive(Debug)]
pub struct QueryResult<T> {
  pub data: Option<Arc<T>>,
  pub status: QueryStatus,
  pub error: Option<QueryError>,
  pub is_fetching: bool,
  pub is_stale: bool,
  pub fetched_at: Option<Instant>,
}

// Manual impl: `T` itself need not be Clone
impl<T> Clone for QueryResult<T> {
  fn clone(&self) -> Self {
    Self {
      data: self.data.clone(),
      status: self.status,
      error: self.error.clone(),
      is_fetching: self.is_fetching,
      is_stale: self.is_stale,
      fetched_at: self.fetched_at,
    }
  }
}

impl<T> QueryResult<T> {
  fn loading() -> Self {
    Self {
      data: None,
      status: QueryStatus::Loading,
      error: None,
      is_fetching: false,
      is_stale: true,
      fetched_at: None,
    }
  }

  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }
}

/// Decode cached JSON into the consumer's type.
pub(crate) fn decode<T: DeserializeOwned>(value: &Value) -> Result<T, QueryError> {
  serde_json::from_value(value.clone()).map_err(|e| {
    QueryError::new(
      ErrorCategory::Unknown,
      format!("cached value has unexpected shape: {}", e),
    )
  })
}

/// Last decoded value, reused while the entry keeps the same data.
struct Decoded<T> {
  raw: Arc<Value>,
  value: Arc<T>,
}

/// Translates entry changes into `QueryResult`s for one subscriber.
///
/// Notifications for one key may arrive out of order across threads, so a
/// snapshot older than the last one published is dropped.
struct Projector<T> {
  stale_time: Duration,
  state: Mutex<Projection<T>>,
}

struct Projection<T> {
  version: Option<u64>,
  decoded: Option<Decoded<T>>,
}

impl<T: DeserializeOwned> Projector<T> {
  fn new(stale_time: Duration) -> Self {
    Self {
      stale_time,
      state: Mutex::new(Projection {
        version: None,
        decoded: None,
      }),
    }
  }

  /// Publish `entry` to `sender` unless a newer snapshot already went out.
  fn publish(&self, entry: &CacheEntry, sender: &watch::Sender<QueryResult<T>>) {
    let mut state = mutex_lock(&self.state, "query", "publish");
    if state.version.is_some_and(|seen| entry.version < seen) {
      return;
    }
    state.version = Some(entry.version);
    sender.send_replace(self.project(entry, &mut state.decoded));
  }

  fn project(&self, entry: &CacheEntry, decoded: &mut Option<Decoded<T>>) -> QueryResult<T> {
    let mut decode_error = None;
    let data = match &entry.data {
      Some(raw) => match decoded.as_ref() {
        Some(cached) if Arc::ptr_eq(&cached.raw, raw) => Some(cached.value.clone()),
        _ => match decode::<T>(raw) {
          Ok(value) => {
            let value = Arc::new(value);
            *decoded = Some(Decoded {
              raw: raw.clone(),
              value: value.clone(),
            });
            Some(value)
          }
          Err(e) => {
            decode_error = Some(e);
            None
          }
        },
      },
      None => None,
    };

    let status = if decode_error.is_some() || entry.status == FetchStatus::Error {
      QueryStatus::Error
    } else if data.is_some() {
      QueryStatus::Success
    } else {
      QueryStatus::Loading
    };

    QueryResult {
      data,
      status,
      error: decode_error.or_else(|| entry.error.clone()),
      is_fetching: entry.is_fetching(),
      is_stale: entry.is_stale_at(Instant::now(), self.stale_time),
      fetched_at: entry.fetched_at,
    }
  }
}

/// A subscription to one cache key.
///
/// Dropping the handle unsubscribes; a fetch already running keeps going and
/// still populates the cache.
pub struct Query<T> {
  client: QueryClient,
  key: CacheKey,
  spec: QuerySpec,
  projector: Arc<Projector<T>>,
  state: Arc<watch::Sender<QueryResult<T>>>,
  receiver: watch::Receiver<QueryResult<T>>,
  subscription: Option<StoreSubscription>,
}

impl<T> Query<T>
where
  T: DeserializeOwned + Send + Sync + 'static,
{
  pub(crate) fn mount(client: QueryClient, key: CacheKey, spec: QuerySpec) -> Self {
    let (sender, receiver) = watch::channel(QueryResult::loading());
    let mut query = Self {
      client,
      key,
      projector: Arc::new(Projector::new(spec.options.stale_time)),
      spec,
      state: Arc::new(sender),
      receiver,
      subscription: None,
    };
    query.attach();
    query
  }

  /// Subscribe to the current key and fetch if the entry needs it.
  fn attach(&mut self) {
    let store = self.client.store();
    let existing = store.get(&self.key);

    let state = self.state.clone();
    let projector = self.projector.clone();
    self.subscription = Some(store.subscribe_with_gc(
      &self.key,
      Arc::new(move |entry: &CacheEntry| {
        projector.publish(entry, &state);
      }),
      Some(self.spec.options.gc_time),
    ));

    let now = Instant::now();
    let needs_fetch = match &existing {
      None => true,
      Some(entry) => !entry.has_data() || entry.is_stale_at(now, self.spec.options.stale_time),
    };

    if needs_fetch {
      debug!(key = %self.key, cached = existing.is_some(), "Query mounted, fetching");
      drop(self.client.executor().fetch(&self.key, self.spec.clone()));
    } else {
      debug!(key = %self.key, "Query mounted on fresh data");
      self.client.executor().register(&self.key, self.spec.clone());
    }

    if let Some(entry) = store.get(&self.key) {
      self.projector.publish(&entry, &self.state);
    }
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Latest snapshot.
  pub fn result(&self) -> QueryResult<T> {
    self.receiver.borrow().clone()
  }

  pub fn data(&self) -> Option<Arc<T>> {
    self.receiver.borrow().data.clone()
  }

  pub fn status(&self) -> QueryStatus {
    self.receiver.borrow().status
  }

  pub fn error(&self) -> Option<QueryError> {
    self.receiver.borrow().error.clone()
  }

  pub fn is_fetching(&self) -> bool {
    self.receiver.borrow().is_fetching
  }

  /// Whether the data is stale right now.
  pub fn is_stale(&self) -> bool {
    self
      .client
      .store()
      .get(&self.key)
      .map_or(true, |entry| {
        entry.is_stale_at(Instant::now(), self.spec.options.stale_time)
      })
  }

  /// Wait until the state changes.
  pub async fn changed(&mut self) {
    // The sender lives as long as this handle, so this cannot fail
    let _ = self.receiver.changed().await;
  }

  /// Wait until no fetch is running and there is data or an error.
  pub async fn settled(&mut self) -> QueryResult<T> {
    loop {
      {
        let current = self.receiver.borrow_and_update();
        if !current.is_fetching && !current.is_loading() {
          return current.clone();
        }
      }
      self.changed().await;
    }
  }

  /// Fetch now, regardless of freshness.
  pub async fn refetch(&self) -> Result<Arc<T>, QueryError> {
    let value = self
      .client
      .executor()
      .fetch(&self.key, self.spec.clone())
      .await?;
    decode::<T>(&value).map(Arc::new)
  }

  /// Point the handle at another key, e.g. when a route parameter changes.
  ///
  /// The old key loses this subscriber; the new key is subscribed and fetched
  /// like a fresh mount.
  pub fn set_key(&mut self, key: CacheKey, spec: QuerySpec) {
    if key == self.key {
      return;
    }
    debug!(from = %self.key, to = %key, "Query key changed");
    self.subscription = None;
    self.key = key;
    self.projector = Arc::new(Projector::new(spec.options.stale_time));
    self.spec = spec;
    self.state.send_replace(QueryResult::loading());
    self.attach();
  }
}

impl<T: fmt::Debug> fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &*self.receiver.borrow())
      .finish_non_exhaustive()
  }
}
