//! SQLite snapshot of the cache, so a restart can serve the last known data
//! while it revalidates.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::key::CacheKey;
use super::store::CacheStore;

/// One row of the persisted cache.
#[derive(Debug, Clone, Serialize)]
pub struct PersistedEntry {
  pub key: CacheKey,
  pub data: Value,
  pub fetched_at: DateTime<Utc>,
}

/// SQLite-backed persistence for [`CacheStore`] contents.
pub struct SqlitePersister {
  conn: Mutex<Connection>,
}

impl SqlitePersister {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;
    Self::with_connection(conn)
  }

  /// Open the database at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("swrsync").join("cache.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Write every entry holding data. Returns the number of rows written.
  pub fn save(&self, store: &CacheStore) -> Result<usize> {
    let now = Instant::now();
    let wall_now = Utc::now();
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let mut written = 0;
    for (key, entry) in store.snapshot() {
      let (Some(data), Some(fetched_at)) = (entry.data.as_ref(), entry.fetched_at) else {
        continue;
      };
      let age = chrono::Duration::from_std(now.saturating_duration_since(fetched_at))
        .map_err(|e| eyre!("Entry age out of range for {}: {}", key, e))?;
      let key_json =
        serde_json::to_string(&key).map_err(|e| eyre!("Failed to serialize key: {}", e))?;
      let blob =
        serde_json::to_vec(data.as_ref()).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;

      tx.execute(
        "INSERT OR REPLACE INTO query_cache (key_hash, key_json, entity_type, data, fetched_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          key.digest(),
          key_json,
          key.entity_type().unwrap_or_default(),
          blob,
          (wall_now - age).to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to store entry {}: {}", key, e))?;
      written += 1;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    debug!(written, "Persisted cache");
    Ok(written)
  }

  /// Read every persisted row.
  pub fn entries(&self) -> Result<Vec<PersistedEntry>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT key_json, data, fetched_at FROM query_cache ORDER BY key_json")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, Vec<u8>, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    let mut entries = Vec::with_capacity(rows.len());
    for (key_json, blob, fetched_at) in rows {
      match decode_row(&key_json, &blob, &fetched_at) {
        Ok(entry) => entries.push(entry),
        Err(e) => warn!(key = %key_json, error = %e, "Skipping unreadable cache row"),
      }
    }
    Ok(entries)
  }

  /// Hydrate `store` with persisted rows no older than `max_age`.
  ///
  /// Restored entries are marked stale so the first subscriber revalidates
  /// them. Older rows are deleted. Returns the number of entries restored.
  pub fn load(&self, store: &CacheStore, max_age: Duration) -> Result<usize> {
    let wall_now = Utc::now();
    let now = Instant::now();
    let mut restored = 0;
    let mut expired = Vec::new();

    for entry in self.entries()? {
      let age = (wall_now - entry.fetched_at).to_std().unwrap_or(Duration::ZERO);
      if age > max_age || !entry.key.is_well_formed() {
        expired.push(entry.key.digest());
        continue;
      }
      let fetched_at = now.checked_sub(age).unwrap_or(now);
      if store.hydrate(&entry.key, entry.data, fetched_at, true) {
        restored += 1;
      }
    }

    if !expired.is_empty() {
      let conn = self.conn()?;
      for hash in &expired {
        conn
          .execute("DELETE FROM query_cache WHERE key_hash = ?", params![hash])
          .map_err(|e| eyre!("Failed to delete expired entry: {}", e))?;
      }
    }

    debug!(restored, expired = expired.len(), "Loaded persisted cache");
    Ok(restored)
  }

  /// Delete every row. Returns the number deleted.
  pub fn clear(&self) -> Result<usize> {
    let conn = self.conn()?;
    conn
      .execute("DELETE FROM query_cache", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))
  }
}

fn decode_row(key_json: &str, blob: &[u8], fetched_at: &str) -> Result<PersistedEntry> {
  let key: CacheKey =
    serde_json::from_str(key_json).map_err(|e| eyre!("Failed to parse key: {}", e))?;
  let data: Value =
    serde_json::from_slice(blob).map_err(|e| eyre!("Failed to deserialize entry: {}", e))?;
  let fetched_at = DateTime::parse_from_rfc3339(fetched_at)
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", fetched_at, e))?
    .with_timezone(&Utc);
  Ok(PersistedEntry {
    key,
    data,
    fetched_at,
  })
}

/// Schema for the persisted cache.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS query_cache (
    key_hash TEXT PRIMARY KEY,
    key_json TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    data BLOB NOT NULL,
    fetched_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_query_cache_entity ON query_cache(entity_type);
"#;
