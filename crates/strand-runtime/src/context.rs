//! Conversation state — the durable identity that outlives individual runs.
//!
//! `ConversationState` is keyed by the composite conversation id and
//! persisted through the [`StateStore`]; working-memory snapshots are
//! flushed under a sibling `{id}:memory` key after every step.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use strand_core::ids::ConversationId;
use strand_core::memory::WorkingMemory;
use strand_store::{StateStore, StoreError};

use crate::contracts::{Conversation, ConversationSettings};
use crate::errors::RuntimeError;

/// Durable per-conversation state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    /// Composite id (`kind:canonical-args`).
    pub id: ConversationId,
    /// Conversation kind.
    pub kind: String,
    /// The arguments the conversation was resolved with.
    pub arguments: Value,
    /// Behavior knobs captured at creation.
    pub settings: ConversationSettings,
    /// Opaque collaborator-owned payload; the engine never interprets it.
    pub durable: Value,
    /// Related conversations, for collaborators that fan out.
    pub linked: Vec<ConversationId>,
}

/// Loads, creates, and persists conversation state and memory snapshots.
pub struct ContextManager {
    store: Arc<dyn StateStore>,
}

impl ContextManager {
    /// Manager over `store`.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Load the state for `def` + `args`, creating and persisting a fresh
    /// one when none exists.
    pub async fn resolve_or_create(
        &self,
        def: &dyn Conversation,
        args: &Value,
    ) -> Result<ConversationState, RuntimeError> {
        let id = ConversationId::derive(def.kind(), &def.derive_key(args));
        if let Some(value) = self.store.get(id.as_str()).await? {
            let state = decode(id.as_str(), value)?;
            debug!(conversation_id = %id, "conversation state loaded");
            return Ok(state);
        }
        let state = ConversationState {
            id: id.clone(),
            kind: def.kind().to_string(),
            arguments: args.clone(),
            settings: def.settings(),
            durable: Value::Null,
            linked: Vec::new(),
        };
        self.persist(&state).await?;
        debug!(conversation_id = %id, "conversation state created");
        Ok(state)
    }

    /// Write the state snapshot to the store.
    pub async fn persist(&self, state: &ConversationState) -> Result<(), RuntimeError> {
        let value = encode(state.id.as_str(), state)?;
        self.store.set(state.id.as_str(), value).await?;
        Ok(())
    }

    /// Flush a working-memory snapshot under the `{id}:memory` key.
    pub async fn flush_memory(
        &self,
        id: &ConversationId,
        memory: &WorkingMemory,
    ) -> Result<(), RuntimeError> {
        let key = memory_key(id);
        let value = memory.snapshot().map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set(&key, value).await?;
        Ok(())
    }

    /// Load the flushed memory snapshot for `id`, if one exists.
    pub async fn load_memory(
        &self,
        id: &ConversationId,
    ) -> Result<Option<WorkingMemory>, RuntimeError> {
        let key = memory_key(id);
        match self.store.get(&key).await? {
            None => Ok(None),
            Some(value) => {
                let memory = WorkingMemory::from_snapshot(value).map_err(|e| {
                    StoreError::Corrupt {
                        key,
                        reason: e.to_string(),
                    }
                })?;
                Ok(Some(memory))
            }
        }
    }
}

fn memory_key(id: &ConversationId) -> String {
    format!("{id}:memory")
}

fn encode(key: &str, state: &ConversationState) -> Result<Value, StoreError> {
    serde_json::to_value(state).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode(key: &str, value: Value) -> Result<ConversationState, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
