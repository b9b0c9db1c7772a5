mod demo;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use swrsync::cache::SqlitePersister;
use swrsync::config::{Config, LogConfig};
use swrsync::{Event, EventHandler, QueryClient};

#[derive(Parser, Debug)]
#[command(name = "swrsync")]
#[command(about = "A stale-while-revalidate query cache for interactive clients")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/swrsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the cache against a simulated remote
  Demo {
    /// Refuse the first N remote reads with a connection error
    #[arg(long, default_value_t = 0)]
    fail_first: u32,

    /// Restore the cache from disk before and save it after
    #[arg(long)]
    persist: bool,

    /// Event whose teams are listed
    #[arg(long, default_value = "E1")]
    event: String,
  },
  /// List persisted cache entries
  Inspect {
    /// Print entries as JSON
    #[arg(long)]
    json: bool,
  },
  /// Delete persisted cache entries
  Clear,
}

/// Install the global subscriber. Keep the returned guard alive to flush
/// file logs.
fn init_tracing(log: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = match EnvFilter::try_from_env("SWRSYNC_LOG") {
    Ok(filter) => filter,
    Err(_) => EnvFilter::try_new(log.filter.as_deref().unwrap_or("info"))?,
  };

  match &log.dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "swrsync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()?;
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()?;
      Ok(None)
    }
  }
}

fn open_persister(config: &Config) -> Result<SqlitePersister> {
  match &config.persistence.path {
    Some(path) => SqlitePersister::open(path),
    None => SqlitePersister::open_default(),
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_tracing(&config.log)?;

  match args.command {
    Command::Demo {
      fail_first,
      persist,
      event,
    } => {
      let mut client_config = config.client_config();
      if config.invalidation.is_empty() {
        client_config.rules = demo::default_rules();
      }
      let client = QueryClient::new(client_config);

      let persister = if persist || config.persistence.enabled {
        let persister = open_persister(&config)?;
        let restored = persister.load(client.store(), config.persistence.max_age)?;
        println!("restored {} entries from disk", restored);
        Some(persister)
      } else {
        None
      };

      // Drive GC and reconnect handling the way an application loop would
      let mut events = EventHandler::new(Duration::from_secs(1));
      let triggers = events.sender();
      let loop_client = client.clone();
      let event_loop = tokio::spawn(async move {
        while let Some(event) = events.next().await {
          loop_client.handle_event(event);
        }
      });

      let remote = Arc::new(demo::SimulatedRemote::new(Duration::from_millis(200)).fail_first(fail_first));
      remote.seed(&event, &["Early Birds"]);
      demo::run(&client, remote, &event).await?;

      // Simulate a dropped connection coming back
      triggers.send(Event::Connectivity(false))?;
      triggers.send(Event::Connectivity(true))?;
      tokio::time::sleep(Duration::from_millis(500)).await;

      if let Some(persister) = persister {
        let saved = persister.save(client.store())?;
        println!("saved {} entries to disk", saved);
      }
      event_loop.abort();
      client.clear();
    }
    Command::Inspect { json } => {
      let persister = open_persister(&config)?;
      let entries = persister.entries()?;
      if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
      } else {
        for entry in &entries {
          println!("{}  fetched {}", entry.key, entry.fetched_at.to_rfc3339());
        }
        println!("{} entries", entries.len());
      }
    }
    Command::Clear => {
      let persister = open_persister(&config)?;
      let deleted = persister.clear()?;
      println!("deleted {} entries", deleted);
    }
  }

  Ok(())
}
