//! Engine facade — the public entry point collaborators call.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::instrument;

use strand_core::ids::ConversationId;
use strand_core::logs::Log;
use strand_llm::ModelProvider;
use strand_store::StateStore;

use crate::builder::{EngineBuilder, Registries};
use crate::context::ContextManager;
use crate::errors::RuntimeError;
use crate::events::{EngineEvent, EventEmitter};
use crate::orchestrator::{RunResult, StepOrchestrator};
use crate::registry::{RunRegistry, StartOrJoin};
use crate::scheduler::TaskScheduler;

/// What happened to a delivered event.
#[derive(Debug)]
pub enum SendOutcome {
    /// This call started the run, drove it, and it completed.
    Completed(RunResult),
    /// An already-active run absorbed the event; it will be folded in at
    /// that run's next step boundary.
    Joined {
        /// The absorbing run's id, for correlating subscribed events.
        run_id: strand_core::ids::RunId,
    },
}

/// The execution engine. Cheap to clone-by-Arc internally; collaborators
/// share one instance.
pub struct Engine {
    registries: Arc<Registries>,
    registry: Arc<RunRegistry>,
    context: Arc<ContextManager>,
    emitter: Arc<EventEmitter>,
    orchestrator: StepOrchestrator,
}

impl Engine {
    /// Start composing an engine.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub(crate) fn from_parts(
        registries: Registries,
        provider: Arc<dyn ModelProvider>,
        store: Arc<dyn StateStore>,
        scheduler_limit: usize,
    ) -> Self {
        let registries = Arc::new(registries);
        let registry = Arc::new(RunRegistry::new());
        let context = Arc::new(ContextManager::new(store));
        let emitter = Arc::new(EventEmitter::new());
        let scheduler = Arc::new(TaskScheduler::new(scheduler_limit));
        let orchestrator = StepOrchestrator::new(
            Arc::clone(&registries),
            provider,
            scheduler,
            Arc::clone(&context),
            Arc::clone(&registry),
            Arc::clone(&emitter),
        );
        Self {
            registries,
            registry,
            context,
            emitter,
            orchestrator,
        }
    }

    /// Deliver an external event to the conversation identified by
    /// `kind` + `args`, starting a run when none is active.
    ///
    /// The call that starts a run drives it to completion and returns its
    /// result; callers that land on an active run return immediately with
    /// [`SendOutcome::Joined`].
    #[instrument(skip_all, fields(kind = %kind, source = %source))]
    pub async fn send(
        &self,
        kind: &str,
        args: &Value,
        source: &str,
        content: &str,
    ) -> Result<SendOutcome, RuntimeError> {
        let def = self
            .registries
            .conversations
            .get(kind)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownConversation(kind.to_string()))?;
        let state = self.context.resolve_or_create(def.as_ref(), args).await?;
        let event = Log::input(0, source, content);

        match self.registry.start_or_join(state.id.as_str(), event) {
            StartOrJoin::Joined { run_id } => Ok(SendOutcome::Joined { run_id }),
            StartOrJoin::Started(started) => {
                let result = self.orchestrator.run(def, state, started).await?;
                Ok(SendOutcome::Completed(result))
            }
        }
    }

    /// Fire the abort signal of the active run for `kind` + `args`.
    /// Returns false when no run is active.
    pub fn abort(&self, kind: &str, args: &Value) -> Result<bool, RuntimeError> {
        let def = self
            .registries
            .conversations
            .get(kind)
            .ok_or_else(|| RuntimeError::UnknownConversation(kind.to_string()))?;
        let id = ConversationId::derive(kind, &def.derive_key(args));
        Ok(self.registry.abort(id.as_str()))
    }

    /// Whether a run is currently active for `kind` + `args`.
    pub fn has_active_run(&self, kind: &str, args: &Value) -> Result<bool, RuntimeError> {
        let def = self
            .registries
            .conversations
            .get(kind)
            .ok_or_else(|| RuntimeError::UnknownConversation(kind.to_string()))?;
        let id = ConversationId::derive(kind, &def.derive_key(args));
        Ok(self.registry.has_active(id.as_str()))
    }

    /// Subscribe to engine lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.emitter.subscribe()
    }
}
