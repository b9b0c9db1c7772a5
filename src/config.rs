use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::ClientConfig;
use crate::error::ErrorCategory;
use crate::fetch::{RetryPolicy, RetryTable};
use crate::invalidation::{InvalidationRules, RuleConfig};
use crate::options::QueryOptions;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Options for every resource without an override
  pub defaults: OptionsConfig,
  /// Per entity type overrides, merged over `defaults`
  pub resources: HashMap<String, OptionsConfig>,
  /// Retry policy per error category, replacing the built-in one
  pub retry: BTreeMap<ErrorCategory, RetryPolicy>,
  pub invalidation: Vec<RuleConfig>,
  pub persistence: PersistenceConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OptionsConfig {
  #[serde(deserialize_with = "deserialize_optional_duration")]
  pub stale_time: Option<Duration>,
  #[serde(deserialize_with = "deserialize_optional_duration")]
  pub gc_time: Option<Duration>,
  #[serde(deserialize_with = "deserialize_optional_duration")]
  pub fetch_timeout: Option<Duration>,
}

impl OptionsConfig {
  fn apply(&self, options: QueryOptions) -> QueryOptions {
    QueryOptions {
      stale_time: self.stale_time.unwrap_or(options.stale_time),
      gc_time: self.gc_time.unwrap_or(options.gc_time),
      fetch_timeout: self.fetch_timeout.unwrap_or(options.fetch_timeout),
      ..options
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
  pub enabled: bool,
  /// Database file (default: $XDG_DATA_HOME/swrsync/cache.db)
  pub path: Option<PathBuf>,
  /// Persisted entries older than this are dropped on load
  #[serde(deserialize_with = "deserialize_duration")]
  pub max_age: Duration,
}

impl Default for PersistenceConfig {
  fn default() -> Self {
    Self {
      enabled: false,
      path: None,
      max_age: Duration::from_secs(24 * 60 * 60),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Directory for daily log files; stderr when unset
  pub dir: Option<PathBuf>,
  /// Filter directive used when SWRSYNC_LOG is not set (e.g. "swrsync=debug")
  pub filter: Option<String>,
}

/// Parse durations written as `250ms`, `30s`, `5m`, `1h` or bare seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
  let s = s.trim();
  let split = s
    .find(|c: char| !c.is_ascii_digit())
    .unwrap_or(s.len());
  let (number, unit) = s.split_at(split);
  let value: u64 = number
    .parse()
    .map_err(|_| eyre!("Invalid duration '{}': expected a number followed by ms, s, m or h", s))?;

  let duration = match unit.trim() {
    "ms" => Duration::from_millis(value),
    "" | "s" => Duration::from_secs(value),
    "m" => Duration::from_secs(value * 60),
    "h" => Duration::from_secs(value * 60 * 60),
    other => return Err(eyre!("Invalid duration unit '{}' in '{}'", other, s)),
  };
  Ok(duration)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
  Seconds(u64),
  Text(String),
}

impl RawDuration {
  fn into_duration(self) -> Result<Duration> {
    match self {
      RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
      RawDuration::Text(text) => parse_duration(&text),
    }
  }
}

pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
  D: Deserializer<'de>,
{
  RawDuration::deserialize(deserializer)?
    .into_duration()
    .map_err(serde::de::Error::custom)
}

fn deserialize_optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
  D: Deserializer<'de>,
{
  Option::<RawDuration>::deserialize(deserializer)?
    .map(RawDuration::into_duration)
    .transpose()
    .map_err(serde::de::Error::custom)
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swrsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swrsync/config.yaml
  ///
  /// Without a file the built-in defaults apply.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("swrsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swrsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Client settings described by this config.
  pub fn client_config(&self) -> ClientConfig {
    let defaults = self.defaults.apply(QueryOptions::default());
    let resources = self
      .resources
      .iter()
      .map(|(entity, overrides)| (entity.clone(), overrides.apply(defaults.clone())))
      .collect();
    let retry = self
      .retry
      .iter()
      .fold(RetryTable::default(), |table, (category, policy)| {
        table.with(*category, policy.clone())
      });

    ClientConfig {
      defaults,
      resources,
      retry,
      rules: InvalidationRules::from_config(&self.invalidation),
    }
  }
}
