//! # strand-runtime
//!
//! The execution engine: run loop, stream assembly, task scheduling, and
//! orchestration.
//!
//! - **Engine**: Public facade — deliver events, abort runs, subscribe.
//! - **Step orchestrator**: Render prompt → call model → assemble stream →
//!   dispatch elements → settle tools → flush and persist
//! - **Stream assembler**: Chunk-invariant element parsing over the tag
//!   grammar
//! - **Task scheduler**: Bounded concurrency, priority queue, retries,
//!   cancellation
//! - **Run registry**: Single-flight table; concurrent sends join, never
//!   fork
//! - **Context manager**: Durable conversation state and memory snapshots
//!
//! ## Crate Position
//!
//! Aggregation layer. Depends on: strand-core, strand-llm, strand-store.

#![deny(unsafe_code)]

pub mod assembler;
pub mod builder;
pub mod context;
pub mod contracts;
pub mod engine;
pub mod errors;
pub mod events;
pub mod orchestrator;
pub mod registry;
pub mod resolver;
pub mod scheduler;

// Re-export main public API
pub use assembler::{ElementEvent, StreamAssembler, THOUGHT_TAG};
pub use builder::EngineBuilder;
pub use context::{ContextManager, ConversationState};
pub use contracts::{
    Conversation, ConversationSettings, ErrorDisposition, Output, ParamField, ParamKind,
    ParamSchema, RunContext, SpecRole, Tool, ToolError, ToolSpec,
};
pub use engine::{Engine, SendOutcome};
pub use errors::RuntimeError;
pub use events::{BaseEvent, EngineEvent, EventEmitter};
pub use orchestrator::RunResult;
pub use registry::{RunRegistry, StartOrJoin, StartedRun};
pub use scheduler::{Priority, SchedulerError, TaskOptions, TaskOutcome, TaskScheduler};
