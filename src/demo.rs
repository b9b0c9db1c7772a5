//! A simulated remote and a scripted walk through the cache's behaviour.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use color_eyre::eyre::{eyre, Report};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use swrsync::{
  AffectedIds, EntityKeys, InvalidationRules, MutationKind, MutationOptions, PrefixTemplate,
  QueryClient, RemoteError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
  pub id: String,
  pub event_id: String,
  pub name: String,
}

#[derive(Debug, Clone)]
pub struct NewTeam {
  pub event_id: String,
  pub name: String,
}

/// In-process stand-in for a slow, flaky backend.
pub struct SimulatedRemote {
  teams: Mutex<BTreeMap<String, Vec<Team>>>,
  latency: Duration,
  failures_left: AtomicU32,
  calls: AtomicU32,
}

impl SimulatedRemote {
  pub fn new(latency: Duration) -> Self {
    Self {
      teams: Mutex::new(BTreeMap::new()),
      latency,
      failures_left: AtomicU32::new(0),
      calls: AtomicU32::new(0),
    }
  }

  /// Refuse the next `n` reads with a connection error.
  pub fn fail_first(self, n: u32) -> Self {
    self.failures_left.store(n, Ordering::SeqCst);
    self
  }

  pub fn seed(&self, event_id: &str, names: &[&str]) {
    let mut teams = self.teams.lock().unwrap_or_else(|e| e.into_inner());
    let list = teams.entry(event_id.to_string()).or_default();
    for name in names {
      list.push(Team {
        id: format!("T{}", list.len() + 1),
        event_id: event_id.to_string(),
        name: name.to_string(),
      });
    }
  }

  /// Number of reads served or refused so far.
  pub fn calls(&self) -> u32 {
    self.calls.load(Ordering::SeqCst)
  }

  pub async fn teams_by_event(&self, event_id: &str) -> Result<Vec<Team>> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(self.latency).await;

    let refuse = self
      .failures_left
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok();
    if refuse {
      return Err(
        Report::new(io::Error::from(io::ErrorKind::ConnectionRefused))
          .wrap_err(format!("GET /events/{}/teams", event_id)),
      );
    }

    let teams = self.teams.lock().unwrap_or_else(|e| e.into_inner());
    Ok(teams.get(event_id).cloned().unwrap_or_default())
  }

  pub async fn create_team(&self, new_team: NewTeam) -> Result<Team> {
    tokio::time::sleep(self.latency).await;
    if new_team.name.trim().is_empty() {
      return Err(eyre!(RemoteError::new("team name is required").with_status(422)));
    }

    let mut teams = self.teams.lock().unwrap_or_else(|e| e.into_inner());
    let list = teams.entry(new_team.event_id.clone()).or_default();
    let team = Team {
      id: format!("T{}", list.len() + 1),
      event_id: new_team.event_id,
      name: new_team.name,
    };
    list.push(team.clone());
    Ok(team)
  }
}

pub fn team_keys() -> EntityKeys {
  EntityKeys::new("team")
}

/// Rules used when the config file declares none.
pub fn default_rules() -> InvalidationRules {
  InvalidationRules::new().on_any(
    "team",
    [PrefixTemplate::new(["team", "byEvent", "{eventId}"])],
  )
}

fn names(teams: &[Team]) -> String {
  teams
    .iter()
    .map(|t| format!("{}:{}", t.id, t.name))
    .collect::<Vec<_>>()
    .join(", ")
}

/// Observe a team list, add a team, and watch the list revalidate.
pub async fn run(client: &QueryClient, remote: Arc<SimulatedRemote>, event_id: &str) -> Result<()> {
  let key = team_keys().scope("byEvent", [event_id]);
  let fetcher = {
    let remote = remote.clone();
    let event_id = event_id.to_string();
    move || {
      let remote = remote.clone();
      let event_id = event_id.clone();
      async move { remote.teams_by_event(&event_id).await }
    }
  };

  println!("subscribing to {}", key);
  let mut first = client.query(key.clone(), fetcher.clone());
  let result = first.settled().await;
  match (&result.data, &result.error) {
    (Some(teams), _) => println!("  loaded [{}]", names(teams)),
    (None, Some(error)) => println!("  failed: {}", error),
    (None, None) => println!("  no data"),
  }

  let second = client.query(key.clone(), fetcher.clone());
  println!(
    "second subscriber: fetching={} data=[{}] (remote calls so far: {})",
    second.is_fetching(),
    second.data().map(|t| names(&t)).unwrap_or_default(),
    remote.calls()
  );

  let create = client.mutation(
    MutationOptions::new("team", MutationKind::Create)
      .affected_ids(|vars: &NewTeam, _team: &Team| AffectedIds::new().with("eventId", &vars.event_id)),
    {
      let remote = remote.clone();
      move |vars: NewTeam| {
        let remote = remote.clone();
        async move { remote.create_team(vars).await }
      }
    },
  );

  let created = create
    .mutate_async(NewTeam {
      event_id: event_id.to_string(),
      name: "Night Owls".to_string(),
    })
    .await?;
  println!("created {} ({})", created.id, created.name);

  let result = first.settled().await;
  println!(
    "after invalidation: [{}] (remote calls: {})",
    result.data.as_deref().map(|t| names(t)).unwrap_or_default(),
    remote.calls()
  );

  let rejected = create
    .mutate_async(NewTeam {
      event_id: event_id.to_string(),
      name: String::new(),
    })
    .await;
  if let Err(error) = rejected {
    println!("invalid create rejected: {}", error);
  }

  info!(entries = client.store().len(), "Demo finished");
  drop(second);
  Ok(())
}
