//! Runtime error surface.

use strand_core::errors::EngineError;
use strand_llm::ProviderError;
use strand_store::StoreError;
use thiserror::Error;

use crate::scheduler::SchedulerError;

/// Errors surfaced by the runtime's public API.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No conversation registered under this kind.
    #[error("unknown conversation kind: {0}")]
    UnknownConversation(String),

    /// No tool registered under this name.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Two registrations under the same name at build time.
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// A builder was finalized without a model provider.
    #[error("engine builder is missing a model provider")]
    MissingProvider,

    /// Engine-core failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Durable store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Provider failure before streaming began.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Task scheduler failure.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}
