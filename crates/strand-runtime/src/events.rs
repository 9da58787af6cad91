//! Engine lifecycle events and the broadcast emitter.
//!
//! Events are the message-passing boundary through which collaborators
//! observe the engine: input adapters, UIs, and audit sinks subscribe
//! here. The engine never calls back into a collaborator directly.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// Common fields for all engine events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseEvent {
    /// Conversation this event belongs to.
    pub conversation_id: String,
    /// ISO 8601 timestamp.
    pub timestamp: String,
}

impl BaseEvent {
    /// Create a new base event with the current UTC timestamp.
    #[must_use]
    pub fn now(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Engine lifecycle events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A run started for a conversation.
    RunStart {
        /// Common fields.
        base: BaseEvent,
        /// Run id.
        run_id: String,
    },
    /// A step began.
    StepStart {
        /// Common fields.
        base: BaseEvent,
        /// Run id.
        run_id: String,
        /// Step index.
        step: u32,
    },
    /// The assembler completed (or abandoned) an element.
    ElementParsed {
        /// Common fields.
        base: BaseEvent,
        /// Run id.
        run_id: String,
        /// Element tag.
        tag: String,
        /// Whether the closing delimiter was seen.
        done: bool,
    },
    /// A tool handler was scheduled.
    ToolStart {
        /// Common fields.
        base: BaseEvent,
        /// Run id.
        run_id: String,
        /// Tool name.
        name: String,
        /// Pairing id.
        call_id: String,
    },
    /// A tool call settled.
    ToolEnd {
        /// Common fields.
        base: BaseEvent,
        /// Run id.
        run_id: String,
        /// Tool name.
        name: String,
        /// Pairing id.
        call_id: String,
        /// Whether the handler ultimately failed.
        is_error: bool,
        /// Total attempts made.
        attempts: u32,
        /// Wall-clock duration in milliseconds.
        duration_ms: u64,
    },
    /// An output handler ran.
    OutputEmitted {
        /// Common fields.
        base: BaseEvent,
        /// Run id.
        run_id: String,
        /// Output name.
        name: String,
    },
    /// A step closed (tools settled, memory flushed).
    StepEnd {
        /// Common fields.
        base: BaseEvent,
        /// Run id.
        run_id: String,
        /// Step index.
        step: u32,
    },
    /// The run hit an error that reached top-level handling.
    RunError {
        /// Common fields.
        base: BaseEvent,
        /// Run id.
        run_id: String,
        /// Error description.
        error: String,
    },
    /// The run completed and its entry was removed from the registry.
    RunEnd {
        /// Common fields.
        base: BaseEvent,
        /// Run id.
        run_id: String,
        /// Steps executed.
        steps: u32,
        /// Total logs accumulated.
        log_count: usize,
    },
}

impl EngineEvent {
    /// The conversation id carried by this event.
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::RunStart { base, .. }
            | Self::StepStart { base, .. }
            | Self::ElementParsed { base, .. }
            | Self::ToolStart { base, .. }
            | Self::ToolEnd { base, .. }
            | Self::OutputEmitted { base, .. }
            | Self::StepEnd { base, .. }
            | Self::RunError { base, .. }
            | Self::RunEnd { base, .. } => &base.conversation_id,
        }
    }

    /// Stable event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStart { .. } => "run_start",
            Self::StepStart { .. } => "step_start",
            Self::ElementParsed { .. } => "element_parsed",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::OutputEmitted { .. } => "output_emitted",
            Self::StepEnd { .. } => "step_end",
            Self::RunError { .. } => "run_error",
            Self::RunEnd { .. } => "run_end",
        }
    }
}

/// Fan-out side of the event boundary.
///
/// Emitting never awaits and never applies backpressure to the run loop;
/// a receiver that falls more than a channel's worth behind observes a
/// lag error and misses the overwritten events.
pub struct EventEmitter {
    tx: broadcast::Sender<EngineEvent>,
    emit_count: AtomicU64,
}

impl EventEmitter {
    /// Emitter with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Emitter with an explicit channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            emit_count: AtomicU64::new(0),
        }
    }

    /// Deliver `event` to every live subscriber, returning how many
    /// received it. Zero subscribers is not an error; the engine emits
    /// unconditionally.
    pub fn emit(&self, event: EngineEvent) -> usize {
        let _ = self.emit_count.fetch_add(1, Ordering::Relaxed);
        self.tx.send(event).unwrap_or(0)
    }

    /// A receiver that sees events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Live subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Total events emitted since construction.
    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
