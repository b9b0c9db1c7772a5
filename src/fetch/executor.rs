//! Fetch execution with in-flight deduplication.
//!
//! At most one fetch per key runs at a time. Callers that ask for a key that
//! is already being fetched receive a handle to the same shared future, and
//! therefore the same outcome. Each fetch is driven by its own tokio task so
//! it completes even when every caller stops waiting.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use color_eyre::eyre::eyre;
use color_eyre::Result;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::retry::{run_with_retry, RetryTable};
use crate::cache::{mutex_lock, CacheEntry, CacheKey, CacheStore, EntryPatch};
use crate::error::{ErrorCategory, QueryError};
use crate::options::QueryOptions;

const SOURCE: &str = "fetch::executor";

/// Type-erased fetcher: produces the remote value as JSON.
pub type QueryFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Outcome shared by everyone waiting on one fetch.
pub type FetchResult = std::result::Result<Arc<Value>, QueryError>;

/// Handle to an in-flight (or finished) fetch. Clone to await it elsewhere.
pub type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// How to fetch one key, and with which options.
#[derive(Clone)]
pub struct QuerySpec {
  pub query_fn: QueryFn,
  pub options: QueryOptions,
}

impl QuerySpec {
  /// Wrap a fetcher that already produces JSON.
  pub fn new<F, Fut>(fetcher: F, options: QueryOptions) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    Self {
      query_fn: Arc::new(move || fetcher().boxed()),
      options,
    }
  }

  /// Wrap a fetcher returning any serializable value.
  pub fn typed<T, F, Fut>(fetcher: F, options: QueryOptions) -> Self
  where
    T: Serialize,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    Self::new(
      move || {
        let fut = fetcher();
        async move { Ok(serde_json::to_value(fut.await?)?) }
      },
      options,
    )
  }
}

struct InFlight {
  fetch: SharedFetch,
  generation: u64,
}

struct Inner {
  store: CacheStore,
  retry: RetryTable,
  in_flight: Mutex<HashMap<CacheKey, InFlight>>,
  /// Last spec used per key, for invalidation-driven refetches
  registered: Mutex<HashMap<CacheKey, QuerySpec>>,
  generation: AtomicU64,
}

/// Runs fetches against a [`CacheStore`].
#[derive(Clone)]
pub struct FetchExecutor {
  inner: Arc<Inner>,
}

impl FetchExecutor {
  pub fn new(store: CacheStore, retry: RetryTable) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        retry,
        in_flight: Mutex::new(HashMap::new()),
        registered: Mutex::new(HashMap::new()),
        generation: AtomicU64::new(0),
      }),
    }
  }

  pub fn store(&self) -> &CacheStore {
    &self.inner.store
  }

  pub fn retry_table(&self) -> &RetryTable {
    &self.inner.retry
  }

  /// Fetch `key`, joining the in-flight fetch if there is one.
  ///
  /// The entry is marked loading before this returns. Must be called from
  /// within a tokio runtime.
  pub fn fetch(&self, key: &CacheKey, spec: QuerySpec) -> SharedFetch {
    self.register(key, spec.clone());

    let mut in_flight = mutex_lock(&self.inner.in_flight, SOURCE, "fetch");
    if let Some(existing) = in_flight.get(key) {
      debug!(key = %key, "Joining in-flight fetch");
      return existing.fetch.clone();
    }

    let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
    // Loading lands in the store before anyone can poll the fetch
    let loading = self.inner.store.stage(key, EntryPatch::loading());
    let fetch = run(self.clone(), key.clone(), spec, generation)
      .boxed()
      .shared();
    in_flight.insert(
      key.clone(),
      InFlight {
        fetch: fetch.clone(),
        generation,
      },
    );
    drop(in_flight);
    loading.deliver();

    debug!(key = %key, generation, "Fetch started");
    tokio::spawn(fetch.clone());
    fetch
  }

  /// Refetch `key` with the spec it was last fetched with.
  ///
  /// Returns false when no fetcher is known for the key.
  pub fn refetch(&self, key: &CacheKey) -> bool {
    match self.spec_for(key) {
      Some(spec) => {
        drop(self.fetch(key, spec));
        true
      }
      None => false,
    }
  }

  pub fn is_in_flight(&self, key: &CacheKey) -> bool {
    mutex_lock(&self.inner.in_flight, SOURCE, "is_in_flight").contains_key(key)
  }

  pub fn spec_for(&self, key: &CacheKey) -> Option<QuerySpec> {
    mutex_lock(&self.inner.registered, SOURCE, "spec_for")
      .get(key)
      .cloned()
  }

  pub fn register(&self, key: &CacheKey, spec: QuerySpec) {
    mutex_lock(&self.inner.registered, SOURCE, "register").insert(key.clone(), spec);
  }

  /// Drop registered fetchers for keys that left the cache.
  pub fn forget<'a>(&self, keys: impl IntoIterator<Item = &'a CacheKey>) {
    let mut registered = mutex_lock(&self.inner.registered, SOURCE, "forget");
    for key in keys {
      registered.remove(key);
    }
  }

  /// Drop registered fetchers whose entries are gone, including entries
  /// evicted by a GC timer. Returns how many were dropped.
  pub fn prune(&self) -> usize {
    let live: HashSet<CacheKey> = self
      .inner
      .store
      .keys_matching(&CacheKey::root())
      .into_iter()
      .collect();
    let mut registered = mutex_lock(&self.inner.registered, SOURCE, "prune");
    let before = registered.len();
    registered.retain(|key, _| live.contains(key));
    before - registered.len()
  }

  /// Run a one-off operation under the retry policy, without caching or
  /// deduplication. Used for mutations.
  pub async fn execute<T, F, Fut>(
    &self,
    label: &str,
    options: &QueryOptions,
    mut operation: F,
  ) -> std::result::Result<T, QueryError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    run_with_retry(
      label,
      &self.inner.retry,
      &options.retry_overrides(),
      options.fetch_timeout,
      || catch_panic(panic::catch_unwind(AssertUnwindSafe(&mut operation))),
      |_| {},
    )
    .await
  }

  /// Settle the fetch of `generation` and notify once the in-flight table is
  /// unlocked. Returns the entry as the patch left it.
  fn finish(&self, key: &CacheKey, generation: u64, patch: EntryPatch) -> CacheEntry {
    let mut in_flight = mutex_lock(&self.inner.in_flight, SOURCE, "finish");
    if in_flight
      .get(key)
      .is_some_and(|current| current.generation == generation)
    {
      in_flight.remove(key);
    }
    let update = self.inner.store.stage(key, patch);
    drop(in_flight);
    update.deliver()
  }
}

/// Turn a panicking fetcher into an ordinary failure, whether it panicked
/// while building its future or while it was polled.
async fn catch_panic<T>(started: std::thread::Result<impl Future<Output = Result<T>>>) -> Result<T> {
  let Ok(fut) = started else {
    return Err(eyre!("query function panicked"));
  };
  match AssertUnwindSafe(fut).catch_unwind().await {
    Ok(result) => result,
    Err(_) => Err(eyre!("query function panicked")),
  }
}

/// Settles a fetch that never reached a result, so its key is not left
/// loading with a dead entry in the in-flight table.
struct Settle {
  executor: FetchExecutor,
  key: CacheKey,
  generation: u64,
  armed: bool,
}

impl Drop for Settle {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    warn!(key = %self.key, generation = self.generation, "Fetch ended without a result");
    let error = QueryError::new(ErrorCategory::Unknown, "fetch ended without a result");
    self
      .executor
      .finish(&self.key, self.generation, EntryPatch::failure(error));
  }
}

async fn run(executor: FetchExecutor, key: CacheKey, spec: QuerySpec, generation: u64) -> FetchResult {
  let mut settle = Settle {
    executor: executor.clone(),
    key: key.clone(),
    generation,
    armed: true,
  };
  let label = key.to_string();
  let store = executor.store().clone();
  let query_fn = spec.query_fn.clone();

  let result = run_with_retry(
    &label,
    executor.retry_table(),
    &spec.options.retry_overrides(),
    spec.options.fetch_timeout,
    || catch_panic(panic::catch_unwind(AssertUnwindSafe(|| query_fn()))),
    |retries| {
      store.upsert(&key, EntryPatch::new().retry_count(retries));
    },
  )
  .await;
  settle.armed = false;

  match result {
    Ok(value) => {
      let data = Arc::new(value);
      // An invalidation that landed while we were fetching may describe a
      // write our response predates: the entry keeps the data but stays stale.
      let entry = executor.finish(
        &key,
        generation,
        EntryPatch::success(data.clone(), Instant::now()).settles_fetch(),
      );

      if entry.is_stale {
        let observed = entry.subscriber_count > 0;
        info!(key = %key, observed, "Invalidated during fetch");
        if observed {
          executor.refetch(&key);
        }
      } else {
        debug!(key = %key, "Fetch succeeded");
      }
      Ok(data)
    }
    Err(error) => {
      executor.finish(&key, generation, EntryPatch::failure(error.clone()));
      Err(error)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{make_key, FetchStatus};
  use crate::error::RemoteError;
  use color_eyre::Report;
  use serde_json::json;
  use std::fmt;
  use std::sync::atomic::AtomicU32;
  use std::time::Duration;

  #[derive(Debug)]
  struct UnprintableError;

  impl fmt::Display for UnprintableError {
    fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
      panic!("cannot render this error")
    }
  }

  impl std::error::Error for UnprintableError {}

  fn executor() -> FetchExecutor {
    FetchExecutor::new(CacheStore::new(), RetryTable::default())
  }

  fn counting_spec(calls: Arc<AtomicU32>, value: Value) -> QuerySpec {
    QuerySpec::new(
      move || {
        let calls = calls.clone();
        let value = value.clone();
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(50)).await;
          Ok(value)
        }
      },
      QueryOptions::default(),
    )
  }

  #[tokio::test(start_paused = true)]
  async fn concurrent_fetches_share_one_call() {
    let exec = executor();
    let key = make_key("team", ["byEvent", "E1"]);
    let calls = Arc::new(AtomicU32::new(0));
    let spec = counting_spec(calls.clone(), json!(["T1", "T2"]));

    let first = exec.fetch(&key, spec.clone());
    let second = exec.fetch(&key, spec);
    assert!(exec.is_in_flight(&key));
    assert!(exec.store().get(&key).unwrap().is_fetching());

    let (a, b) = tokio::join!(first, second);
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let entry = exec.store().get(&key).unwrap();
    assert_eq!(entry.status, FetchStatus::Success);
    assert_eq!(entry.data.as_deref(), Some(&json!(["T1", "T2"])));
    assert!(!exec.is_in_flight(&key));
  }

  #[tokio::test(start_paused = true)]
  async fn sequential_fetches_call_again() {
    let exec = executor();
    let key = make_key("team", ["all"]);
    let calls = Arc::new(AtomicU32::new(0));
    let spec = counting_spec(calls.clone(), json!(1));

    exec.fetch(&key, spec.clone()).await.unwrap();
    exec.fetch(&key, spec).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn failure_keeps_previous_data() {
    let exec = executor();
    let key = make_key("team", ["all"]);
    exec
      .fetch(&key, counting_spec(Arc::new(AtomicU32::new(0)), json!(["T1"])))
      .await
      .unwrap();

    let failing = QuerySpec::new(
      || async { Err(eyre!(RemoteError::new("forbidden").with_status(403))) },
      QueryOptions::default(),
    );
    let error = exec.fetch(&key, failing).await.unwrap_err();
    assert_eq!(error.category, ErrorCategory::Permission);
    assert_eq!(error.attempts, 1);

    let entry = exec.store().get(&key).unwrap();
    assert_eq!(entry.status, FetchStatus::Error);
    assert_eq!(entry.data.as_deref(), Some(&json!(["T1"])));
  }

  #[tokio::test(start_paused = true)]
  async fn retries_are_recorded_then_reset() {
    let exec = executor();
    let key = make_key("team", ["all"]);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let spec = QuerySpec::new(
      move || {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
          if n == 0 {
            Err(eyre!("connection refused"))
          } else {
            Ok(json!("ok"))
          }
        }
      },
      QueryOptions::default(),
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = exec.store().subscribe(
      &key,
      Arc::new(move |entry: &CacheEntry| sink.lock().unwrap().push(entry.retry_count)),
    );

    exec.fetch(&key, spec).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(seen.lock().unwrap().contains(&1));
    assert_eq!(exec.store().get(&key).unwrap().retry_count, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn invalidated_mid_flight_stays_stale() {
    let exec = executor();
    let key = make_key("team", ["byEvent", "E1"]);
    let calls = Arc::new(AtomicU32::new(0));

    let pending = exec.fetch(&key, counting_spec(calls.clone(), json!(["T1"])));
    exec.store().mark_stale(&CacheKey::from_segments(["team"]));
    pending.await.unwrap();

    let entry = exec.store().get(&key).unwrap();
    assert!(entry.has_data());
    assert!(entry.is_stale);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn invalidated_mid_flight_refetches_when_observed() {
    let exec = executor();
    let key = make_key("team", ["byEvent", "E1"]);
    let calls = Arc::new(AtomicU32::new(0));
    let _sub = exec.store().subscribe(&key, Arc::new(|_: &CacheEntry| {}));

    let pending = exec.fetch(&key, counting_spec(calls.clone(), json!(["T1"])));
    exec.store().mark_stale(&key);
    pending.await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let entry = exec.store().get(&key).unwrap();
    assert!(!entry.is_stale);
    assert_eq!(entry.status, FetchStatus::Success);
  }

  #[tokio::test]
  async fn panicking_fetcher_becomes_unknown_error() {
    let exec = executor();
    let key = make_key("team", ["all"]);
    let spec = QuerySpec::new(
      || async {
        if true {
          panic!("boom");
        }
        Ok(json!(null))
      },
      QueryOptions::default(),
    );
    let error = exec.fetch(&key, spec).await.unwrap_err();
    assert_eq!(error.category, ErrorCategory::Unknown);
    assert!(!exec.is_in_flight(&key));
  }

  #[tokio::test]
  async fn fetcher_panicking_before_its_future_is_contained() {
    let exec = executor();
    let key = make_key("team", ["all"]);
    let spec = QuerySpec {
      query_fn: Arc::new(|| -> BoxFuture<'static, Result<Value>> { panic!("no future for you") }),
      options: QueryOptions::default(),
    };
    let error = exec.fetch(&key, spec).await.unwrap_err();
    assert_eq!(error.category, ErrorCategory::Unknown);
    assert!(!exec.is_in_flight(&key));
    assert_eq!(exec.store().get(&key).unwrap().status, FetchStatus::Error);

    // The key is usable again
    let value = exec
      .fetch(&key, counting_spec(Arc::new(AtomicU32::new(0)), json!(1)))
      .await
      .unwrap();
    assert_eq!(*value, json!(1));
  }

  #[tokio::test]
  async fn unprintable_error_settles_the_entry() {
    let exec = executor();
    let key = make_key("team", ["all"]);
    let spec = QuerySpec::new(
      || async { Err(Report::new(UnprintableError)) },
      QueryOptions::default(),
    );
    let error = exec.fetch(&key, spec).await.unwrap_err();
    assert_eq!(error.category, ErrorCategory::Unknown);
    assert_eq!(error.message, "unprintable error");

    let entry = exec.store().get(&key).unwrap();
    assert_eq!(entry.status, FetchStatus::Error);
    assert!(!exec.is_in_flight(&key));
  }

  #[tokio::test]
  async fn listeners_may_call_back_into_the_executor() {
    let exec = executor();
    let key = make_key("team", ["all"]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let listener = {
      let exec = exec.clone();
      let key = key.clone();
      let seen = seen.clone();
      Arc::new(move |entry: &CacheEntry| {
        seen
          .lock()
          .unwrap()
          .push((entry.status, exec.is_in_flight(&key)));
      })
    };
    let _sub = exec.store().subscribe(&key, listener);

    exec
      .fetch(&key, counting_spec(Arc::new(AtomicU32::new(0)), json!(1)))
      .await
      .unwrap();
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.first(), Some(&(FetchStatus::Loading, true)));
    assert_eq!(seen.last(), Some(&(FetchStatus::Success, false)));
  }

  #[tokio::test]
  async fn refetch_needs_registered_spec() {
    let exec = executor();
    let key = make_key("team", ["all"]);
    assert!(!exec.refetch(&key));

    exec.register(&key, counting_spec(Arc::new(AtomicU32::new(0)), json!(1)));
    assert!(exec.refetch(&key));
    exec.forget([&key]);
    assert!(exec.spec_for(&key).is_none());
  }

  #[tokio::test]
  async fn execute_does_not_touch_the_cache() {
    let exec = executor();
    let out = exec
      .execute("createTeam", &QueryOptions::default().no_retry(), || async {
        Ok(7)
      })
      .await
      .unwrap();
    assert_eq!(out, 7);
    assert!(exec.store().is_empty());
  }

  #[tokio::test]
  async fn execute_contains_a_panicking_operation() {
    let exec = executor();
    let error = exec
      .execute("createTeam", &QueryOptions::default().no_retry(), || {
        if true {
          panic!("bad input");
        }
        async { Ok(()) }
      })
      .await
      .unwrap_err();
    assert_eq!(error.category, ErrorCategory::Unknown);
  }
}
