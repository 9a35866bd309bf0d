//! Cache storage trait with in-memory and SQLite implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::types::{CachedEntry, CachedResponse, RequestKey, ResponseKind};

/// Trait for cache storage backends.
///
/// A backend holds any number of named stores. Every mutation of a single
/// entry is atomic: a refresh replaces the whole entry, never part of it.
pub trait CacheStorage: Send + Sync {
  /// Create the store if it does not exist yet.
  fn open_store(&self, name: &str) -> Result<()>;

  /// Names of all stores, in creation order.
  fn store_names(&self) -> Result<Vec<String>>;

  /// Delete a store and all its entries. Returns false if it did not exist.
  fn delete_store(&self, name: &str) -> Result<bool>;

  /// Look up a single entry.
  fn get(&self, store: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Replace the entry for `key`, creating the store if needed.
  fn put(&self, store: &str, key: &RequestKey, response: &CachedResponse) -> Result<()>;

  /// Write a batch of entries; either all of them land or none do.
  fn put_all(&self, store: &str, entries: &[(RequestKey, CachedResponse)]) -> Result<()>;

  /// Keys currently held by a store (empty if the store does not exist).
  fn keys(&self, store: &str) -> Result<Vec<RequestKey>>;
}

/// Run a storage call on the blocking thread pool.
///
/// Backends are synchronous and may hold a lock across disk I/O.
pub async fn run_blocking<S, T, F>(storage: &Arc<S>, call: F) -> Result<T>
where
  S: CacheStorage + ?Sized + 'static,
  T: Send + 'static,
  F: FnOnce(&S) -> Result<T> + Send + 'static,
{
  let storage = Arc::clone(storage);
  tokio::task::spawn_blocking(move || call(storage.as_ref()))
    .await
    .map_err(|e| eyre!("Storage task failed: {}", e))?
}

#[derive(Debug, Clone)]
struct MemoryEntry {
  key: RequestKey,
  response: CachedResponse,
  cached_at: DateTime<Utc>,
}

/// Storage kept entirely in process memory.
/// Used for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStorage {
  stores: Mutex<Vec<(String, HashMap<String, MemoryEntry>)>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_stores<R>(
    &self,
    f: impl FnOnce(&mut Vec<(String, HashMap<String, MemoryEntry>)>) -> R,
  ) -> Result<R> {
    let mut stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(f(&mut stores))
  }
}

fn memory_store<'a>(
  stores: &'a mut Vec<(String, HashMap<String, MemoryEntry>)>,
  name: &str,
) -> &'a mut HashMap<String, MemoryEntry> {
  let idx = match stores.iter().position(|(n, _)| n == name) {
    Some(idx) => idx,
    None => {
      stores.push((name.to_string(), HashMap::new()));
      stores.len() - 1
    }
  };
  &mut stores[idx].1
}

impl CacheStorage for MemoryStorage {
  fn open_store(&self, name: &str) -> Result<()> {
    self.with_stores(|stores| {
      memory_store(stores, name);
    })
  }

  fn store_names(&self) -> Result<Vec<String>> {
    self.with_stores(|stores| stores.iter().map(|(n, _)| n.clone()).collect())
  }

  fn delete_store(&self, name: &str) -> Result<bool> {
    self.with_stores(|stores| {
      let before = stores.len();
      stores.retain(|(n, _)| n != name);
      stores.len() != before
    })
  }

  fn get(&self, store: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    self.with_stores(|stores| {
      stores
        .iter()
        .find(|(n, _)| n == store)
        .and_then(|(_, entries)| entries.get(&key.cache_hash()))
        .map(|e| CachedEntry {
          response: e.response.clone(),
          cached_at: e.cached_at,
        })
    })
  }

  fn put(&self, store: &str, key: &RequestKey, response: &CachedResponse) -> Result<()> {
    self.with_stores(|stores| {
      let entries = memory_store(stores, store);
      let hash = key.cache_hash();
      entries.remove(&hash);
      entries.insert(
        hash,
        MemoryEntry {
          key: key.clone(),
          response: response.clone(),
          cached_at: Utc::now(),
        },
      );
    })
  }

  fn put_all(&self, store: &str, batch: &[(RequestKey, CachedResponse)]) -> Result<()> {
    // A single lock acquisition makes the batch atomic.
    self.with_stores(|stores| {
      let entries = memory_store(stores, store);
      let now = Utc::now();
      for (key, response) in batch {
        entries.insert(
          key.cache_hash(),
          MemoryEntry {
            key: key.clone(),
            response: response.clone(),
            cached_at: now,
          },
        );
      }
    })
  }

  fn keys(&self, store: &str) -> Result<Vec<RequestKey>> {
    self.with_stores(|stores| {
      let mut keys: Vec<RequestKey> = stores
        .iter()
        .find(|(n, _)| n == store)
        .map(|(_, entries)| entries.values().map(|e| e.key.clone()).collect())
        .unwrap_or_default();
      keys.sort_by(|a, b| a.url.cmp(&b.url).then_with(|| a.method.cmp(&b.method)));
      keys
    })
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (creating if needed) the storage at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

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

    Ok(data_dir.join("swcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named stores; rowid preserves creation order
CREATE TABLE IF NOT EXISTS cache_stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Captured responses, one row per (store, request)
CREATE TABLE IF NOT EXISTS cache_entries (
    store_name TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    kind TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store_name, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_store ON cache_entries(store_name);
"#;

/// Replace one entry inside an open transaction.
fn write_entry(
  conn: &Connection,
  store: &str,
  key: &RequestKey,
  response: &CachedResponse,
) -> Result<()> {
  let hash = key.cache_hash();
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "DELETE FROM cache_entries WHERE store_name = ? AND key_hash = ?",
      params![store, hash],
    )
    .map_err(|e| eyre!("Failed to delete old cache entry: {}", e))?;

  conn
    .execute(
      "INSERT INTO cache_entries
         (store_name, key_hash, method, url, status, status_text, kind, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        store,
        hash,
        key.method,
        key.url,
        response.status,
        response.status_text,
        response.kind.as_str(),
        headers,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;

  Ok(())
}

fn ensure_store(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_stores (name, created_at) VALUES (?, datetime('now'))",
      params![name],
    )
    .map_err(|e| eyre!("Failed to open cache store {}: {}", name, e))?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_store(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    ensure_store(&conn, name)
  }

  fn store_names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to list cache stores: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read cache store name: {}", e))?;

    Ok(names)
  }

  fn delete_store(&self, name: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE store_name = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache store {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get(&self, store: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(u16, String, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, status_text, kind, headers, body, cached_at FROM cache_entries
         WHERE store_name = ? AND key_hash = ?",
        params![store, key.cache_hash()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry {}: {}", key, e))?;

    match row {
      Some((status, status_text, kind, headers, body, cached_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CachedEntry {
          response: CachedResponse {
            status,
            status_text,
            headers,
            body,
            kind: ResponseKind::parse(&kind)?,
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, store: &str, key: &RequestKey, response: &CachedResponse) -> Result<()> {
    self.put_all(store, std::slice::from_ref(&(key.clone(), response.clone())))
  }

  fn put_all(&self, store: &str, entries: &[(RequestKey, CachedResponse)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_store(&tx, store)?;
    for (key, response) in entries {
      write_entry(&tx, store, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn keys(&self, store: &str) -> Result<Vec<RequestKey>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT method, url FROM cache_entries
         WHERE store_name = ?
         ORDER BY url, method",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![store], |row| {
        Ok(RequestKey {
          method: row.get(0)?,
          url: row.get(1)?,
        })
      })
      .map_err(|e| eyre!("Failed to query cache keys: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read cache key: {}", e))?;

    Ok(keys)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key(path: &str) -> RequestKey {
    RequestKey::parse("GET", &format!("https://example.org{}", path)).unwrap()
  }

  fn temp_db(name: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
      .duration_since(std::time::UNIX_EPOCH)
      .unwrap()
      .as_nanos();
    std::env::temp_dir().join(format!(
      "swcache-{}-{}-{}.db",
      name,
      std::process::id(),
      nanos
    ))
  }

  fn exercise_backend(storage: &dyn CacheStorage) {
    storage.open_store("static-v1").unwrap();
    storage.open_store("static-v1").unwrap();
    storage.open_store("dynamic-v1").unwrap();
    assert_eq!(
      storage.store_names().unwrap(),
      vec!["static-v1".to_string(), "dynamic-v1".to_string()]
    );

    let index =
      CachedResponse::new(200, "<html>index</html>").with_header("Content-Type", "text/html");
    storage.put("static-v1", &key("/index.html"), &index).unwrap();

    let entry = storage.get("static-v1", &key("/index.html")).unwrap().unwrap();
    assert_eq!(entry.response, index);
    assert!(storage.get("dynamic-v1", &key("/index.html")).unwrap().is_none());

    // Replace, never duplicate
    let updated = CachedResponse::new(200, "<html>v2</html>");
    storage.put("static-v1", &key("/index.html"), &updated).unwrap();
    assert_eq!(storage.keys("static-v1").unwrap().len(), 1);
    assert_eq!(
      storage.get("static-v1", &key("/index.html")).unwrap().unwrap().response,
      updated
    );

    // Put into unknown store creates it
    storage.put("other", &key("/a.png"), &updated).unwrap();
    assert!(storage.store_names().unwrap().contains(&"other".to_string()));

    assert!(storage.delete_store("other").unwrap());
    assert!(!storage.delete_store("other").unwrap());
    assert!(storage.keys("other").unwrap().is_empty());
    assert!(storage.get("other", &key("/a.png")).unwrap().is_none());
  }

  #[test]
  fn test_memory_storage() {
    exercise_backend(&MemoryStorage::new());
  }

  #[test]
  fn test_sqlite_storage() {
    let path = temp_db("basic");
    let storage = SqliteStorage::open_at(&path).unwrap();
    exercise_backend(&storage);
    drop(storage);
    let _ = std::fs::remove_file(path);
  }

  #[test]
  fn test_sqlite_persists_across_reopen() {
    let path = temp_db("reopen");
    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage
        .put_all(
          "static-v4",
          &[
            (key("/"), CachedResponse::new(200, "root")),
            (key("/offline.html"), CachedResponse::new(200, "offline")),
          ],
        )
        .unwrap();
    }

    let storage = SqliteStorage::open_at(&path).unwrap();
    assert_eq!(storage.store_names().unwrap(), vec!["static-v4".to_string()]);
    let keys = storage.keys("static-v4").unwrap();
    assert_eq!(keys.len(), 2);
    assert_eq!(
      storage.get("static-v4", &key("/offline.html")).unwrap().unwrap().response.body,
      b"offline".to_vec()
    );
    drop(storage);
    let _ = std::fs::remove_file(path);
  }

  #[tokio::test]
  async fn test_run_blocking_reaches_sqlite() {
    let path = temp_db("blocking");
    let storage = Arc::new(SqliteStorage::open_at(&path).unwrap());

    let entry = (key("/img/a.png"), CachedResponse::new(200, "img"));
    run_blocking(&storage, move |s| s.put("dynamic-v2", &entry.0, &entry.1))
      .await
      .unwrap();
    let keys = run_blocking(&storage, |s| s.keys("dynamic-v2")).await.unwrap();
    assert_eq!(keys, vec![key("/img/a.png")]);

    let missing = run_blocking(&storage, |s| s.get("dynamic-v2", &key("/none"))).await;
    assert!(missing.unwrap().is_none());

    drop(storage);
    let _ = std::fs::remove_file(path);
  }
}
