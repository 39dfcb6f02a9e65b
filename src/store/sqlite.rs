//! SQLite-backed store.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

use super::traits::Store;
use crate::identifier::Identifier;
use crate::resource::Resource;

/// Store that keeps JSON-serialized resources in an in-memory SQLite
/// database.
///
/// Every call runs on the blocking pool, so callers see the latency of a
/// real backing medium. The database lives only as long as the store.
/// Reads deserialize a fresh value each time, so two reads of an unchanged
/// entry are equal but not pointer-identical.
pub struct SqliteStore {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
  /// Open an empty store.
  pub fn open() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    let store = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    store.run_migrations()?;

    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(RESOURCE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  /// Run `f` against the connection on the blocking pool.
  async fn with_conn<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      f(&conn)
    })
    .await
    .map_err(|e| eyre!("Cache database task failed: {}", e))?
  }
}

const RESOURCE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS resources (
    id_hash TEXT PRIMARY KEY,
    category TEXT,
    entry_key TEXT NOT NULL,
    status TEXT NOT NULL,
    data BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_resources_category
    ON resources(category, entry_key);
"#;

#[async_trait]
impl Store for SqliteStore {
  async fn get(&self, id: &Identifier) -> Result<Option<Arc<Resource>>> {
    let hash = id.cache_hash();
    let display = id.to_string();

    self
      .with_conn(move |conn| {
        let data: Option<Vec<u8>> = conn
          .query_row(
            "SELECT data FROM resources WHERE id_hash = ?",
            params![hash],
            |row| row.get(0),
          )
          .optional()
          .map_err(|e| eyre!("Failed to read {}: {}", display, e))?;

        match data {
          Some(data) => {
            let resource: Resource = serde_json::from_slice(&data)
              .map_err(|e| eyre!("Failed to deserialize {}: {}", display, e))?;
            Ok(Some(Arc::new(resource)))
          }
          None => Ok(None),
        }
      })
      .await
  }

  async fn set(&self, id: &Identifier, resource: Arc<Resource>) -> Result<()> {
    let id = id.clone();
    let data =
      serde_json::to_vec(&*resource).map_err(|e| eyre!("Failed to serialize {}: {}", id, e))?;
    let status = serde_json::to_value(resource.status)?
      .as_str()
      .unwrap_or_default()
      .to_string();

    self
      .with_conn(move |conn| {
        conn
          .execute(
            "INSERT OR REPLACE INTO resources (id_hash, category, entry_key, status, data)
             VALUES (?, ?, ?, ?, ?)",
            params![id.cache_hash(), id.category, id.key, status, data],
          )
          .map_err(|e| eyre!("Failed to store {}: {}", id, e))?;
        Ok(())
      })
      .await
  }

  async fn remove(&self, id: &Identifier) -> Result<()> {
    let id = id.clone();
    self
      .with_conn(move |conn| {
        conn
          .execute(
            "DELETE FROM resources WHERE id_hash = ?",
            params![id.cache_hash()],
          )
          .map_err(|e| eyre!("Failed to remove {}: {}", id, e))?;
        Ok(())
      })
      .await
  }

  async fn entries(&self) -> Result<Vec<(Identifier, Arc<Resource>)>> {
    self
      .with_conn(|conn| {
        let mut stmt = conn
          .prepare("SELECT category, entry_key, data FROM resources ORDER BY category, entry_key")
          .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

        let rows: Vec<(Option<String>, String, Vec<u8>)> = stmt
          .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
          .map_err(|e| eyre!("Failed to query entries: {}", e))?
          .collect::<rusqlite::Result<_>>()
          .map_err(|e| eyre!("Failed to read entry row: {}", e))?;

        rows
          .into_iter()
          .map(|(category, key, data)| {
            let id = Identifier { category, key };
            let resource: Resource = serde_json::from_slice(&data)
              .map_err(|e| eyre!("Failed to deserialize {}: {}", id, e))?;
            Ok((id, Arc::new(resource)))
          })
          .collect()
      })
      .await
  }
}
