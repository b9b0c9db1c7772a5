//! The query client: one explicitly constructed handle that ties the cache,
//! the fetch executor and the invalidation router together.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cache::{CacheKey, CacheStore, EntryPatch, QueryKey};
use crate::error::QueryError;
use crate::event::Event;
use crate::fetch::{FetchExecutor, QuerySpec, RetryTable};
use crate::invalidation::{AffectedIds, InvalidationRouter, InvalidationRules, MutationKind};
use crate::mutation::{Mutation, MutationOptions};
use crate::options::QueryOptions;
use crate::query::{decode, Query};

/// Everything needed to build a [`QueryClient`].
#[derive(Clone, Default)]
pub struct ClientConfig {
  /// Options for keys without a resource override
  pub defaults: QueryOptions,
  /// Overrides by entity type (a key's first segment)
  pub resources: HashMap<String, QueryOptions>,
  pub retry: RetryTable,
  pub rules: InvalidationRules,
}

impl ClientConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_defaults(mut self, defaults: QueryOptions) -> Self {
    self.defaults = defaults;
    self
  }

  pub fn with_resource(mut self, entity: impl Into<String>, options: QueryOptions) -> Self {
    self.resources.insert(entity.into(), options);
    self
  }

  pub fn with_retry(mut self, retry: RetryTable) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_rules(mut self, rules: InvalidationRules) -> Self {
    self.rules = rules;
    self
  }
}

struct Inner {
  store: CacheStore,
  executor: FetchExecutor,
  router: InvalidationRouter,
  defaults: QueryOptions,
  resources: HashMap<String, QueryOptions>,
  online: AtomicBool,
}

/// Shared handle to the cache and everything that feeds it.
///
/// Cloning is cheap. Create one at startup and pass it to every consumer;
/// call [`clear`](Self::clear) at teardown.
#[derive(Clone)]
pub struct QueryClient {
  inner: Arc<Inner>,
}

impl QueryClient {
  pub fn new(config: ClientConfig) -> Self {
    let store = CacheStore::new();
    let executor = FetchExecutor::new(store.clone(), config.retry);
    let router = InvalidationRouter::new(config.rules, executor.clone());
    Self {
      inner: Arc::new(Inner {
        store,
        executor,
        router,
        defaults: config.defaults,
        resources: config.resources,
        online: AtomicBool::new(true),
      }),
    }
  }

  pub fn store(&self) -> &CacheStore {
    &self.inner.store
  }

  pub fn executor(&self) -> &FetchExecutor {
    &self.inner.executor
  }

  pub fn router(&self) -> &InvalidationRouter {
    &self.inner.router
  }

  /// Options for a key: the resource override for its entity type, or the
  /// client defaults.
  pub fn options_for(&self, key: &CacheKey) -> QueryOptions {
    key
      .entity_type()
      .and_then(|entity| self.inner.resources.get(entity))
      .unwrap_or(&self.inner.defaults)
      .clone()
  }

  /// Subscribe to `key`, fetching with `fetcher` when needed.
  pub fn query<T, F, Fut>(&self, key: impl QueryKey, fetcher: F) -> Query<T>
  where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let key = key.cache_key();
    let options = self.options_for(&key);
    self.query_with_options(key, fetcher, options)
  }

  pub fn query_with_options<T, F, Fut>(
    &self,
    key: impl QueryKey,
    fetcher: F,
    options: QueryOptions,
  ) -> Query<T>
  where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    Query::mount(self.clone(), key.cache_key(), QuerySpec::typed(fetcher, options))
  }

  /// Return fresh cached data, or fetch and wait for it.
  pub async fn fetch_query<T, F, Fut>(
    &self,
    key: impl QueryKey,
    fetcher: F,
  ) -> std::result::Result<T, QueryError>
  where
    T: Serialize + DeserializeOwned,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let key = key.cache_key();
    let options = self.options_for(&key);
    if let Some(entry) = self.store().get(&key) {
      if let Some(data) = entry.data.as_ref() {
        if !entry.is_stale_at(Instant::now(), options.stale_time) {
          debug!(key = %key, "Cache hit");
          return decode(data);
        }
      }
    }
    let value = self
      .executor()
      .fetch(&key, QuerySpec::typed(fetcher, options))
      .await?;
    decode(&value)
  }

  /// Warm the cache for `key` in the background. No-op when fresh.
  pub fn prefetch<T, F, Fut>(&self, key: impl QueryKey, fetcher: F)
  where
    T: Serialize,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let key = key.cache_key();
    let options = self.options_for(&key);
    let fresh = self
      .store()
      .get(&key)
      .is_some_and(|e| e.has_data() && !e.is_stale_at(Instant::now(), options.stale_time));
    if !fresh {
      debug!(key = %key, "Prefetching");
      drop(self.executor().fetch(&key, QuerySpec::typed(fetcher, options)));
    }
  }

  /// Cached data for `key`, without fetching. Stale data is returned too.
  pub fn get_query_data<T: DeserializeOwned>(&self, key: &impl QueryKey) -> Option<T> {
    let entry = self.store().get(&key.cache_key())?;
    decode(entry.data.as_ref()?).ok()
  }

  /// Write data into the cache as if it had just been fetched, e.g. for an
  /// optimistic update.
  pub fn set_query_data<T: Serialize>(&self, key: &impl QueryKey, value: &T) -> Result<()> {
    let key = key.cache_key();
    let value = serde_json::to_value(value)
      .map_err(|e| eyre!("Failed to serialize data for {}: {}", key, e))?;
    self
      .store()
      .upsert(&key, EntryPatch::success(Arc::new(value), Instant::now()));
    Ok(())
  }

  /// Apply the invalidation rules for a mutation.
  pub fn invalidate(
    &self,
    entity: &str,
    kind: MutationKind,
    ids: &AffectedIds,
  ) -> BTreeSet<CacheKey> {
    self.router().invalidate(entity, kind, ids)
  }

  pub fn invalidate_prefix(&self, prefix: &CacheKey) -> BTreeSet<CacheKey> {
    self.router().invalidate_prefix(prefix)
  }

  /// Connectivity came back: refetch every subscribed entry.
  ///
  /// Returns how many fetches were started or joined.
  pub fn on_reconnect(&self) -> usize {
    let refetched = self
      .store()
      .subscribed_keys()
      .iter()
      .filter(|key| self.executor().refetch(key))
      .count();
    info!(refetched, "Reconnected, refetching subscribed queries");
    refetched
  }

  /// The application regained focus: refetch subscribed entries that are
  /// stale.
  pub fn on_focus(&self) -> usize {
    let now = Instant::now();
    let mut refetched = 0;
    for key in self.store().subscribed_keys() {
      let stale_time = self
        .executor()
        .spec_for(&key)
        .map(|spec| spec.options.stale_time)
        .unwrap_or_else(|| self.options_for(&key).stale_time);
      let due = self
        .store()
        .get(&key)
        .is_some_and(|e| !e.is_fetching() && e.is_stale_at(now, stale_time));
      if due && self.executor().refetch(&key) {
        refetched += 1;
      }
    }
    debug!(refetched, "Focus regained");
    refetched
  }

  /// Record connectivity. Going from offline to online triggers
  /// [`on_reconnect`](Self::on_reconnect).
  pub fn set_online(&self, online: bool) {
    let was_online = self.inner.online.swap(online, Ordering::SeqCst);
    if !was_online && online {
      self.on_reconnect();
    } else if was_online && !online {
      info!("Went offline, serving cached data");
    }
  }

  pub fn is_online(&self) -> bool {
    self.inner.online.load(Ordering::SeqCst)
  }

  /// Evict unobserved entries past their GC window.
  pub fn gc(&self) -> Vec<CacheKey> {
    let evicted = self.store().gc();
    let pruned = self.executor().prune();
    if pruned > 0 {
      debug!(pruned, "Dropped fetchers of evicted entries");
    }
    evicted
  }

  /// React to an external trigger.
  pub fn handle_event(&self, event: Event) {
    match event {
      Event::Tick => {
        self.gc();
      }
      Event::Connectivity(online) => self.set_online(online),
      Event::Visibility(true) => {
        self.on_focus();
      }
      Event::Visibility(false) => {}
    }
  }

  /// Build a mutation handle.
  pub fn mutation<V, T, F, Fut>(&self, options: MutationOptions<V, T>, mutate_fn: F) -> Mutation<V, T>
  where
    V: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    Mutation::new(self.clone(), options, mutate_fn)
  }

  /// Drop every entry and registered fetcher.
  pub fn clear(&self) {
    let keys: Vec<CacheKey> = self.store().snapshot().into_iter().map(|(k, _)| k).collect();
    self.executor().forget(&keys);
    self.store().clear();
    debug!(entries = keys.len(), "Query client cleared");
  }
}
