//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::entry::{CacheEntrySummary, CachedResponse};
use crate::manifest::CacheName;
use crate::worker::{FetchRequest, FetchResponse};

/// Trait for cache storage backends.
///
/// Each operation is atomic on its own; there is no locking across calls.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the named store if it does not exist yet.
  fn open(&self, name: &CacheName) -> Result<()>;

  /// Record that the named store finished activation, creating it if needed.
  fn mark_activated(&self, name: &CacheName) -> Result<()>;

  /// Whether the named store exists and finished activation.
  fn is_activated(&self, name: &CacheName) -> Result<bool>;

  /// Names of all stores, oldest first.
  fn keys(&self) -> Result<Vec<CacheName>>;

  /// Delete a store and everything in it. Returns false if it did not exist.
  fn delete(&self, name: &CacheName) -> Result<bool>;

  /// Look the request up in every store, oldest store first.
  fn match_any(&self, request: &FetchRequest) -> Result<Option<CachedResponse>>;

  /// Look the request up in one store.
  fn match_in(&self, name: &CacheName, request: &FetchRequest) -> Result<Option<CachedResponse>>;

  /// Store one response, replacing any previous entry for the same request.
  fn put(&self, name: &CacheName, request: &FetchRequest, response: &FetchResponse) -> Result<()>;

  /// Store several responses in one transaction. Either all are written or none.
  fn put_all(&self, name: &CacheName, entries: &[(FetchRequest, FetchResponse)]) -> Result<()>;

  /// List the entries of one store in key order.
  fn entries(&self, name: &CacheName) -> Result<Vec<CacheEntrySummary>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the storage at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Storage that lives only as long as the value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("eosd-web").join("cache.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per cache generation; id gives creation order
CREATE TABLE IF NOT EXISTS cache_stores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    -- Set once the generation is installed and active; NULL after a failed install
    activated_at TEXT
);

CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    body_sha256 TEXT NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, method, url),
    FOREIGN KEY (cache_name) REFERENCES cache_stores(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_url ON cache_entries(method, url);
"#;

/// Only GET requests can be stored or matched.
fn is_storable(request: &FetchRequest) -> bool {
  request.method == Method::GET
}

fn insert_store(conn: &Connection, name: &CacheName) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
      params![name.as_str()],
    )
    .map_err(|e| eyre!("Failed to create cache store {}: {}", name, e))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  name: &CacheName,
  request: &FetchRequest,
  response: &FetchResponse,
) -> Result<()> {
  if !is_storable(request) {
    return Err(eyre!(
      "Cannot cache {} request for {}",
      request.method,
      request.url
    ));
  }

  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
  let digest = hex::encode(Sha256::digest(&response.body));

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries (cache_name, method, url, status, headers, body, body_sha256, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        name.as_str(),
        request.method.as_str(),
        request.cache_url(),
        response.status,
        headers,
        response.body.as_ref(),
        digest
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in {}: {}", request.url, name, e))?;

  Ok(())
}

type EntryRow = (String, u16, String, Vec<u8>, String);

fn row_to_cached(row: EntryRow) -> Result<CachedResponse> {
  let (cache_name, status, headers, body, stored_at) = row;
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;

  Ok(CachedResponse {
    cache_name: CacheName::new(cache_name)?,
    status,
    headers,
    body: body.into(),
    stored_at: parse_datetime(&stored_at)?,
  })
}

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &CacheName) -> Result<()> {
    let conn = self.lock()?;
    insert_store(&conn, name)
  }

  fn mark_activated(&self, name: &CacheName) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO cache_stores (name, activated_at) VALUES (?, datetime('now'))
         ON CONFLICT(name) DO UPDATE SET activated_at = excluded.activated_at",
        params![name.as_str()],
      )
      .map_err(|e| eyre!("Failed to mark cache store {} active: {}", name, e))?;
    Ok(())
  }

  fn is_activated(&self, name: &CacheName) -> Result<bool> {
    let conn = self.lock()?;
    let activated: Option<Option<String>> = conn
      .query_row(
        "SELECT activated_at FROM cache_stores WHERE name = ?",
        params![name.as_str()],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache store {}: {}", name, e))?;
    Ok(activated.flatten().is_some())
  }

  fn keys(&self) -> Result<Vec<CacheName>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names: Vec<String> = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache stores: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read cache store name: {}", e))?;

    names.into_iter().map(CacheName::new).collect()
  }

  fn delete(&self, name: &CacheName) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![name.as_str()],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute(
        "DELETE FROM cache_stores WHERE name = ?",
        params![name.as_str()],
      )
      .map_err(|e| eyre!("Failed to delete cache store {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_any(&self, request: &FetchRequest) -> Result<Option<CachedResponse>> {
    if !is_storable(request) {
      return Ok(None);
    }

    let conn = self.lock()?;
    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT e.cache_name, e.status, e.headers, e.body, e.stored_at
         FROM cache_entries e
         INNER JOIN cache_stores s ON s.name = e.cache_name
         WHERE e.method = ? AND e.url = ?
         ORDER BY s.id
         LIMIT 1",
        params![request.method.as_str(), request.cache_url()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to match {}: {}", request.url, e))?;

    row.map(row_to_cached).transpose()
  }

  fn match_in(&self, name: &CacheName, request: &FetchRequest) -> Result<Option<CachedResponse>> {
    if !is_storable(request) {
      return Ok(None);
    }

    let conn = self.lock()?;
    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT cache_name, status, headers, body, stored_at
         FROM cache_entries
         WHERE cache_name = ? AND method = ? AND url = ?",
        params![name.as_str(), request.method.as_str(), request.cache_url()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to match {} in {}: {}", request.url, name, e))?;

    row.map(row_to_cached).transpose()
  }

  fn put(&self, name: &CacheName, request: &FetchRequest, response: &FetchResponse) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    insert_store(&tx, name)?;
    insert_entry(&tx, name, request, response)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn put_all(&self, name: &CacheName, entries: &[(FetchRequest, FetchResponse)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    insert_store(&tx, name)?;
    for (request, response) in entries {
      // Dropping the transaction on error rolls every earlier insert back
      insert_entry(&tx, name, request, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn entries(&self, name: &CacheName) -> Result<Vec<CacheEntrySummary>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT method, url, status, length(body), body_sha256, stored_at
         FROM cache_entries
         WHERE cache_name = ?
         ORDER BY url, method",
      )
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let rows: Vec<(String, String, u16, i64, String, String)> = stmt
      .query_map(params![name.as_str()], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    rows
      .into_iter()
      .map(|(method, url, status, size, body_sha256, stored_at)| {
        Ok(CacheEntrySummary {
          method,
          url,
          status,
          size: usize::try_from(size).unwrap_or_default(),
          body_sha256,
          stored_at: parse_datetime(&stored_at)?,
        })
      })
      .collect()
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
