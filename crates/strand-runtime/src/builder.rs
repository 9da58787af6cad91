//! Engine builder — all collaborator composition happens here, before
//! startup.
//!
//! `build()` freezes the registrations into one immutable snapshot inside
//! the engine; nothing registers or unregisters after that. Tools and
//! outputs share the element-tag namespace, so a name may be used at most
//! once across both.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use strand_llm::ModelProvider;
use strand_store::{MemoryStore, StateStore};

use crate::assembler::THOUGHT_TAG;
use crate::contracts::{Conversation, Output, Tool};
use crate::engine::Engine;
use crate::errors::RuntimeError;
use crate::scheduler;

/// Frozen registration snapshot.
pub(crate) struct Registries {
    pub(crate) tools: HashMap<String, Arc<dyn Tool>>,
    pub(crate) outputs: HashMap<String, Arc<dyn Output>>,
    pub(crate) conversations: HashMap<String, Arc<dyn Conversation>>,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    tools: HashMap<String, Arc<dyn Tool>>,
    outputs: HashMap<String, Arc<dyn Output>>,
    conversations: HashMap<String, Arc<dyn Conversation>>,
    provider: Option<Arc<dyn ModelProvider>>,
    store: Option<Arc<dyn StateStore>>,
    scheduler_limit: usize,
    invalid: Option<RuntimeError>,
}

impl EngineBuilder {
    /// Empty builder with the default scheduler limit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            outputs: HashMap::new(),
            conversations: HashMap::new(),
            provider: None,
            store: None,
            scheduler_limit: scheduler::DEFAULT_LIMIT,
            invalid: None,
        }
    }

    /// Register a tool under its element tag.
    #[must_use]
    pub fn register_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        let name = tool.name().to_string();
        if self.tag_taken(&name) {
            let _ = self
                .invalid
                .get_or_insert(RuntimeError::DuplicateRegistration(name));
            return self;
        }
        let _ = self.tools.insert(name, tool);
        self
    }

    /// Register an output channel under its element tag.
    #[must_use]
    pub fn register_output(mut self, output: Arc<dyn Output>) -> Self {
        let name = output.name().to_string();
        if self.tag_taken(&name) {
            let _ = self
                .invalid
                .get_or_insert(RuntimeError::DuplicateRegistration(name));
            return self;
        }
        let _ = self.outputs.insert(name, output);
        self
    }

    /// Register a conversation kind.
    #[must_use]
    pub fn register_conversation(mut self, conversation: Arc<dyn Conversation>) -> Self {
        let kind = conversation.kind().to_string();
        if self.conversations.contains_key(&kind) {
            let _ = self
                .invalid
                .get_or_insert(RuntimeError::DuplicateRegistration(kind));
            return self;
        }
        let _ = self.conversations.insert(kind, conversation);
        self
    }

    /// Set the model provider. Required.
    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the durable store. Defaults to an in-memory store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the scheduler's concurrent-task ceiling.
    #[must_use]
    pub fn scheduler_limit(mut self, limit: usize) -> Self {
        self.scheduler_limit = limit;
        self
    }

    /// Freeze the registrations and construct the engine.
    pub fn build(self) -> Result<Engine, RuntimeError> {
        if let Some(err) = self.invalid {
            return Err(err);
        }
        let provider = self.provider.ok_or(RuntimeError::MissingProvider)?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn StateStore>);
        info!(
            tools = self.tools.len(),
            outputs = self.outputs.len(),
            conversations = self.conversations.len(),
            scheduler_limit = self.scheduler_limit,
            "engine built"
        );
        Ok(Engine::from_parts(
            Registries {
                tools: self.tools,
                outputs: self.outputs,
                conversations: self.conversations,
            },
            provider,
            store,
            self.scheduler_limit,
        ))
    }

    fn tag_taken(&self, name: &str) -> bool {
        name == THOUGHT_TAG || self.tools.contains_key(name) || self.outputs.contains_key(name)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
