//! Engine error taxonomy.
//!
//! Containment policy:
//!
//! - [`EngineError::Validation`] and [`EngineError::ToolExecution`] are
//!   contained at the element level — the step continues.
//! - [`EngineError::Parse`] is a warning in lenient mode and fatal to the
//!   step in strict mode.
//! - [`EngineError::ModelCall`] unwinds to the orchestrator's top-level
//!   error handling, which defers to the conversation's error hook.
//! - [`EngineError::Concurrency`] is a programming-level invariant breach,
//!   never user-recoverable.

use thiserror::Error;

/// Errors produced by the Strand engine core.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or unterminated stream element at end of input.
    #[error("parse error: {0}")]
    Parse(String),

    /// Element content failed its declared schema.
    #[error("validation failed for {element}: {reason}")]
    Validation {
        /// Element tag that failed.
        element: String,
        /// What the schema check rejected.
        reason: String,
    },

    /// A tool handler failed after exhausting its retries.
    #[error("tool {tool} failed after {attempts} attempt(s): {reason}")]
    ToolExecution {
        /// Tool name.
        tool: String,
        /// Total attempts made.
        attempts: u32,
        /// Last error seen.
        reason: String,
    },

    /// The model provider stream failed.
    #[error("model call failed: {0}")]
    ModelCall(String),

    /// Internal single-flight or ownership invariant breach.
    #[error("concurrency invariant violated: {0}")]
    Concurrency(String),

    /// The run's abort signal fired.
    #[error("cancelled")]
    Cancelled,

    /// Durable store failure surfaced through the engine.
    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    /// Whether this error is contained at the element level (the step
    /// keeps going) rather than unwinding the run.
    pub fn is_contained(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::ToolExecution { .. })
    }
}
