//! # strand-store
//!
//! Durable store contract for conversation state and working-memory
//! snapshots.
//!
//! The engine only needs `get`/`set` over JSON values keyed by
//! conversation id — no wire or on-disk format is mandated beyond what
//! the chosen backend uses internally.
//!
//! - **[`MemoryStore`]**: `DashMap`-backed, for tests and ephemeral runs
//! - **[`SqliteStore`]**: single-file SQLite key-value table
//!
//! ## Crate Position
//!
//! Leaf contract crate. Depended on by: strand-runtime.

#![deny(unsafe_code)]

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend I/O or query failure.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored value could not be (de)serialized.
    #[error("corrupt stored value for key {key}: {reason}")]
    Corrupt {
        /// Key whose value failed to decode.
        key: String,
        /// Decode failure detail.
        reason: String,
    },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Durable key-value store for engine state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch the value for `key`, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Write `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
}
