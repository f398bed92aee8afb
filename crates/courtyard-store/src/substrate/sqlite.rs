// ABOUTME: SQLite-backed substrate with the same quota accounting as the in-memory one.
// ABOUTME: A single kv table in WAL mode; change notifications stay within the process.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, params};
use tokio::sync::broadcast;

use crate::substrate::{
    DEFAULT_CAPACITY_BYTES, Substrate, SubstrateChange, SubstrateError, next_context_id,
};

/// A durable substrate backed by a SQLite file. Quota is enforced the same
/// way as in memory: summed key and value lengths against a fixed ceiling.
pub struct SqliteSubstrate {
    conn: Mutex<Connection>,
    capacity: usize,
    context: u64,
    changes_tx: broadcast::Sender<SubstrateChange>,
}

impl SqliteSubstrate {
    /// Open or create the backing database at the given path with the
    /// default 5 MiB capacity.
    pub fn open(path: &Path) -> Result<Self, SubstrateError> {
        Self::open_with_capacity(path, DEFAULT_CAPACITY_BYTES)
    }

    pub fn open_with_capacity(path: &Path, capacity: usize) -> Result<Self, SubstrateError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        let (changes_tx, _) = broadcast::channel(256);
        Ok(Self {
            conn: Mutex::new(conn),
            capacity,
            context: next_context_id(),
            changes_tx,
        })
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_locked(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
        match conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get::<_, String>(0)
        }) {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn broadcast(&self, key: &str, old_value: Option<String>, new_value: Option<String>) {
        let _ = self.changes_tx.send(SubstrateChange {
            context: self.context,
            key: key.to_string(),
            old_value,
            new_value,
        });
    }
}

impl Substrate for SqliteSubstrate {
    fn get(&self, key: &str) -> Result<Option<String>, SubstrateError> {
        let conn = self.lock_conn();
        Ok(Self::get_locked(&conn, key)?)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SubstrateError> {
        let old = {
            let conn = self.lock_conn();
            let used: i64 = conn.query_row(
                "SELECT COALESCE(SUM(LENGTH(key) + LENGTH(value)), 0) FROM kv WHERE key != ?1",
                params![key],
                |row| row.get(0),
            )?;
            let needed = used as usize + key.len() + value.len();
            if needed > self.capacity {
                return Err(SubstrateError::QuotaExceeded {
                    needed,
                    capacity: self.capacity,
                });
            }

            let old = Self::get_locked(&conn, key)?;
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            old
        };
        self.broadcast(key, old, Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<Option<String>, SubstrateError> {
        let old = {
            let conn = self.lock_conn();
            let old = Self::get_locked(&conn, key)?;
            if old.is_some() {
                conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            }
            old
        };
        if old.is_some() {
            self.broadcast(key, old.clone(), None);
        }
        Ok(old)
    }

    fn keys(&self) -> Result<Vec<String>, SubstrateError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT key FROM kv")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    fn used(&self) -> Result<usize, SubstrateError> {
        let conn = self.lock_conn();
        let used: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(key) + LENGTH(value)), 0) FROM kv",
            [],
            |row| row.get(0),
        )?;
        Ok(used as usize)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn context_id(&self) -> u64 {
        self.context
    }

    fn changes(&self) -> broadcast::Receiver<SubstrateChange> {
        self.changes_tx.subscribe()
    }
}
