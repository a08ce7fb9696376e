//! SQLite Map Store
//!
//! Implements MapStore with one row per map holding its JSON dump.
//! Queries run on the blocking pool.

use crate::domain::ports::MapStore;
use crate::error::StoreError;
use crate::map::{Delta, MapOptions, VersionedMap};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS maps (
    id      TEXT PRIMARY KEY,
    version INTEGER NOT NULL,
    dump    TEXT NOT NULL
)";

/// SQLite-backed map store.
#[derive(Clone)]
pub struct SqliteMapStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMapStore {
    /// Open (or create) the database file and make sure the table exists.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("spawn_blocking error: {}", e)))?
    }

    fn load(tx: &Transaction<'_>, name: &str) -> Result<Option<(u64, Delta)>, StoreError> {
        let row: Option<(i64, String)> = tx
            .query_row(
                "SELECT version, dump FROM maps WHERE id = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(backend)?;
        match row {
            Some((version, dump)) => {
                let dump: Delta = serde_json::from_str(&dump).map_err(backend)?;
                Ok(Some((version as u64, dump)))
            }
            None => Ok(None),
        }
    }

    fn save(tx: &Transaction<'_>, name: &str, version: u64, dump: &Delta) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(dump).map_err(backend)?;
        tx.execute(
            "INSERT OR REPLACE INTO maps (id, version, dump) VALUES (?1, ?2, ?3)",
            params![name, version as i64, encoded],
        )
        .map_err(backend)?;
        Ok(())
    }
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl MapStore for SqliteMapStore {
    async fn create(&self, name: &str, dump: &Delta) -> Result<(), StoreError> {
        let name = name.to_string();
        let dump = dump.clone();
        self.run(move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            if Self::load(&tx, &name)?.is_some() {
                return Err(StoreError::AlreadyExists(name));
            }
            let version = dump.carried_version().unwrap_or(0);
            Self::save(&tx, &name, version, &dump)?;
            tx.commit().map_err(backend)
        })
        .await
    }

    async fn read(&self, name: &str) -> Result<Delta, StoreError> {
        let name = name.to_string();
        self.run(move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            match Self::load(&tx, &name)? {
                Some((_, dump)) => Ok(dump),
                None => Err(StoreError::NotFound(name)),
            }
        })
        .await
    }

    async fn update(&self, name: &str, delta: &Delta) -> Result<(), StoreError> {
        let name = name.to_string();
        let delta = delta.clone();
        self.run(move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            let (version, dump) =
                Self::load(&tx, &name)?.ok_or_else(|| StoreError::NotFound(name.clone()))?;
            if version != delta.version {
                return Err(StoreError::VersionMismatch {
                    expected: delta.version,
                    actual: version,
                });
            }
            let map = VersionedMap::from_dump(&dump, MapOptions::default()).map_err(backend)?;
            map.apply_changes(&delta).map_err(backend)?;
            Self::save(&tx, &name, map.version(), &map.dump())?;
            tx.commit().map_err(backend)
        })
        .await
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let name = name.to_string();
        self.run(move |conn| {
            conn.execute("DELETE FROM maps WHERE id = ?1", params![name])
                .map_err(backend)?;
            Ok(())
        })
        .await
    }
}
