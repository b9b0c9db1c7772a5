//! Mutation handles.
//!
//! A [`Mutation`] runs a write against the remote and, once it succeeds,
//! invalidates whatever the write may have changed through the client's
//! invalidation rules.

use std::future::Future;
use std::sync::Arc;

use color_eyre::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::invalidation::{AffectedIds, MutationKind};
use crate::options::QueryOptions;

type MutateFn<V, T> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<T>> + Send + Sync>;
type AffectedIdsFn<V, T> = Arc<dyn Fn(&V, &T) -> AffectedIds + Send + Sync>;

/// What a mutation writes, and how it is retried.
pub struct MutationOptions<V, T> {
  pub entity: String,
  pub kind: MutationKind,
  affected_ids: AffectedIdsFn<V, T>,
  /// Mutations are not retried unless asked to
  pub options: QueryOptions,
}

impl<V: 'static, T: 'static> MutationOptions<V, T> {
  pub fn new(entity: impl Into<String>, kind: MutationKind) -> Self {
    Self {
      entity: entity.into(),
      kind,
      affected_ids: Arc::new(|_: &V, _: &T| AffectedIds::new()),
      options: QueryOptions::default().no_retry(),
    }
  }

  /// Derive the ids that fill invalidation templates from the variables and
  /// the mutation's output.
  pub fn affected_ids<F>(mut self, f: F) -> Self
  where
    F: Fn(&V, &T) -> AffectedIds + Send + Sync + 'static,
  {
    self.affected_ids = Arc::new(f);
    self
  }

  pub fn options(mut self, options: QueryOptions) -> Self {
    self.options = options;
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationStatus {
  #[default]
  Idle,
  Pending,
  Success,
  Error,
}

/// State of the most recent call.
#[derive(Debug)]
pub struct MutationState<T> {
  pub status: MutationStatus,
  pub data: Option<Arc<T>>,
  pub error: Option<QueryError>,
}

impl<T> Clone for MutationState<T> {
  fn clone(&self) -> Self {
    Self {
      status: self.status,
      data: self.data.clone(),
      error: self.error.clone(),
    }
  }
}

impl<T> Default for MutationState<T> {
  fn default() -> Self {
    Self {
      status: MutationStatus::Idle,
      data: None,
      error: None,
    }
  }
}

/// Handle for one kind of write. Clones share state.
pub struct Mutation<V, T> {
  client: QueryClient,
  options: Arc<MutationOptions<V, T>>,
  mutate_fn: MutateFn<V, T>,
  state: Arc<watch::Sender<MutationState<T>>>,
}

impl<V, T> Clone for Mutation<V, T> {
  fn clone(&self) -> Self {
    Self {
      client: self.client.clone(),
      options: self.options.clone(),
      mutate_fn: self.mutate_fn.clone(),
      state: self.state.clone(),
    }
  }
}

impl<V, T> Mutation<V, T>
where
  V: Clone + Send + Sync + 'static,
  T: Send + Sync + 'static,
{
  pub(crate) fn new<F, Fut>(client: QueryClient, options: MutationOptions<V, T>, mutate_fn: F) -> Self
  where
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let (state, _) = watch::channel(MutationState::default());
    Self {
      client,
      options: Arc::new(options),
      mutate_fn: Arc::new(move |vars| mutate_fn(vars).boxed()),
      state: Arc::new(state),
    }
  }

  /// Run the mutation and wait for it. On success the affected queries are
  /// invalidated before this returns.
  pub async fn mutate_async(&self, vars: V) -> std::result::Result<Arc<T>, QueryError> {
    self.state.send_replace(MutationState {
      status: MutationStatus::Pending,
      data: None,
      error: None,
    });

    let label = format!("{}:{}", self.options.entity, self.options.kind);
    let mutate_fn = self.mutate_fn.clone();
    let result = self
      .client
      .executor()
      .execute(&label, &self.options.options, || mutate_fn(vars.clone()))
      .await;

    match result {
      Ok(output) => {
        let ids = (self.options.affected_ids)(&vars, &output);
        self
          .client
          .invalidate(&self.options.entity, self.options.kind, &ids);
        let output = Arc::new(output);
        self.state.send_replace(MutationState {
          status: MutationStatus::Success,
          data: Some(output.clone()),
          error: None,
        });
        Ok(output)
      }
      Err(error) => {
        warn!(mutation = %label, category = %error.category, "Mutation failed");
        self.state.send_replace(MutationState {
          status: MutationStatus::Error,
          data: None,
          error: Some(error.clone()),
        });
        Err(error)
      }
    }
  }

  /// Fire and forget. The outcome lands in the handle's state.
  pub fn mutate(&self, vars: V) -> JoinHandle<std::result::Result<Arc<T>, QueryError>> {
    let this = self.clone();
    tokio::spawn(async move { this.mutate_async(vars).await })
  }

  pub fn state(&self) -> MutationState<T> {
    self.state.borrow().clone()
  }

  /// Watch state changes.
  pub fn subscribe(&self) -> watch::Receiver<MutationState<T>> {
    self.state.subscribe()
  }

  pub fn is_pending(&self) -> bool {
    self.state.borrow().status == MutationStatus::Pending
  }

  pub fn error(&self) -> Option<QueryError> {
    self.state.borrow().error.clone()
  }

  pub fn data(&self) -> Option<Arc<T>> {
    self.state.borrow().data.clone()
  }

  /// Back to idle; forgets the last outcome.
  pub fn reset(&self) {
    self.state.send_replace(MutationState::default());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::make_key;
  use crate::client::ClientConfig;
  use crate::error::{ErrorCategory, RemoteError};
  use crate::invalidation::{InvalidationRules, PrefixTemplate};
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  #[derive(Clone)]
  struct NewTeam {
    event_id: String,
    name: String,
  }

  fn client() -> QueryClient {
    QueryClient::new(ClientConfig::new().with_rules(InvalidationRules::new().on(
      "team",
      MutationKind::Create,
      [PrefixTemplate::new(["team", "byEvent", "{eventId}"])],
    )))
  }

  fn create_team() -> MutationOptions<NewTeam, String> {
    MutationOptions::new("team", MutationKind::Create)
      .affected_ids(|vars: &NewTeam, _id: &String| AffectedIds::new().with("eventId", &vars.event_id))
  }

  #[tokio::test(start_paused = true)]
  async fn success_invalidates_affected_queries() {
    let client = client();
    let key = make_key("team", ["byEvent", "E1"]);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut query = client.query(key.clone(), move || {
      let counter = counter.clone();
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(vec!["T1".to_string()])
      }
    });
    query.settled().await;

    let mutation = client.mutation(create_team(), |vars: NewTeam| async move {
      Ok(format!("{}-id", vars.name))
    });
    let id = mutation
      .mutate_async(NewTeam {
        event_id: "E1".into(),
        name: "T3".into(),
      })
      .await
      .unwrap();

    assert_eq!(*id, "T3-id");
    assert_eq!(mutation.state().status, MutationStatus::Success);
    assert!(query.is_fetching());
    query.settled().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn failure_is_recorded_and_not_retried() {
    let client = client();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mutation = client.mutation(create_team(), move |_vars: NewTeam| {
      counter.fetch_add(1, Ordering::SeqCst);
      async { Err::<String, _>(eyre!(RemoteError::new("service unavailable").with_status(503))) }
    });

    let error = mutation
      .mutate_async(NewTeam {
        event_id: "E1".into(),
        name: "T3".into(),
      })
      .await
      .unwrap_err();
    assert_eq!(error.category, ErrorCategory::Server);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(mutation.error().map(|e| e.category), Some(ErrorCategory::Server));
    assert!(mutation.data().is_none());

    mutation.reset();
    assert_eq!(mutation.state().status, MutationStatus::Idle);
    assert!(mutation.error().is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn mutate_runs_in_background() {
    let client = client();
    let mutation = client.mutation(create_team(), |vars: NewTeam| async move {
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok(vars.name)
    });

    let handle = mutation.mutate(NewTeam {
      event_id: "E2".into(),
      name: "T4".into(),
    });
    tokio::task::yield_now().await;
    assert!(mutation.is_pending());

    handle.await.unwrap().unwrap();
    assert!(!mutation.is_pending());
    assert_eq!(mutation.data().as_deref().map(String::as_str), Some("T4"));
  }
}
