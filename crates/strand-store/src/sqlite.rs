//! SQLite-backed store — one key-value table, JSON values as text.

use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tracing::debug;

use crate::{StateStore, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS engine_state (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);
";

/// Durable store over a single SQLite file.
///
/// The connection is mutex-guarded; reads and writes are short
/// single-statement transactions, so contention stays negligible at the
/// engine's persistence rate (one flush per step).
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Fully in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let text: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT value FROM engine_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?
        };
        match text {
            None => Ok(None),
            Some(t) => serde_json::from_str(&t)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let text = value.to_string();
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO engine_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
            params![key, text],
        )?;
        debug!(key, bytes = text.len(), "state persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn get_absent_is_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let value = json!({"settings": {"maxSteps": 3}, "durable": null});
        store.set("chat:u1", value.clone()).await.unwrap();
        assert_eq!(store.get("chat:u1").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn upsert_replaces_value() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set("k", json!(1)).await.unwrap();
        store.set("k", json!({"v": 2})).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.set("k", json!("v")).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!("v")));
    }

    #[tokio::test]
    async fn corrupt_value_is_reported() {
        let store = SqliteStore::open_in_memory().unwrap();
        {
            let conn = store.conn.lock();
            let _ = conn
                .execute(
                    "INSERT INTO engine_state (key, value) VALUES ('bad', 'not json')",
                    [],
                )
                .unwrap();
        }
        let err = store.get("bad").await.unwrap_err();
        assert!(err.to_string().contains("corrupt"));
    }
}
