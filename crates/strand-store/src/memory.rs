//! In-memory store backed by a `DashMap`.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::{StateStore, StoreError};

/// Ephemeral store for tests and single-process deployments that do not
/// need durability across restarts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Value>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let _ = self.entries.insert(key.to_string(), value);
        Ok(())
    }
}
