//! The run log — a closed sum type over everything that happens in a run.
//!
//! Each variant carries a [`LogMeta`] with the fields shared by every log
//! entry. Dispatch over log kinds is always an exhaustive `match`; there is
//! no runtime type inspection anywhere in the engine.
//!
//! Invariant: every [`Log::ToolCall`] eventually has exactly one terminal
//! [`Log::ToolResult`] (success or error) in the same run's working memory,
//! or the run aborts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::LogId;

/// Fields common to all log variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMeta {
    /// Unique, never-reused id.
    pub id: LogId,
    /// Index of the step that produced this entry.
    pub step: u32,
    /// Whether this entry has been folded into a completed step.
    pub processed: bool,
    /// ISO 8601 creation timestamp.
    pub created_at: String,
}

impl LogMeta {
    /// New metadata for an entry produced by step `step`.
    #[must_use]
    pub fn new(step: u32) -> Self {
        Self {
            id: LogId::new(),
            step,
            processed: false,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// One immutable record of something that happened during a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Log {
    /// An external event delivered to the conversation.
    InputEvent {
        /// Shared fields.
        meta: LogMeta,
        /// Channel or collaborator the event came from.
        source: String,
        /// Event payload text.
        content: String,
    },
    /// Free-running model text outside any recognized element.
    Thought {
        /// Shared fields.
        meta: LogMeta,
        /// Thought text.
        content: String,
    },
    /// The model invoked a tool.
    ToolCall {
        /// Shared fields.
        meta: LogMeta,
        /// Tool name.
        name: String,
        /// Pairing id connecting this call to its result.
        call_id: String,
        /// Parsed arguments.
        arguments: Value,
    },
    /// Terminal outcome of a tool call.
    ToolResult {
        /// Shared fields.
        meta: LogMeta,
        /// Tool name.
        name: String,
        /// Pairing id of the originating call.
        call_id: String,
        /// Result payload (or error description when `is_error`).
        value: Value,
        /// Whether the handler ultimately failed.
        is_error: bool,
        /// Total attempts made, including retries.
        attempts: u32,
    },
    /// A structured output emitted toward a collaborator channel.
    OutputEvent {
        /// Shared fields.
        meta: LogMeta,
        /// Output name.
        name: String,
        /// Attributes parsed from the element's opening delimiter.
        attributes: BTreeMap<String, String>,
        /// Element text content.
        content: String,
        /// Handler result, if the handler produced one.
        value: Value,
    },
    /// Marks one prompt→response cycle.
    StepMarker {
        /// Shared fields.
        meta: LogMeta,
        /// Step index, 0-based.
        index: u32,
        /// The rendered prompt sent to the model.
        prompt: String,
        /// The raw model response, filled in when the step's stream ends.
        response: String,
    },
}

impl Log {
    /// An external input event.
    #[must_use]
    pub fn input(step: u32, source: impl Into<String>, content: impl Into<String>) -> Self {
        Self::InputEvent {
            meta: LogMeta::new(step),
            source: source.into(),
            content: content.into(),
        }
    }

    /// A model thought.
    #[must_use]
    pub fn thought(step: u32, content: impl Into<String>) -> Self {
        Self::Thought {
            meta: LogMeta::new(step),
            content: content.into(),
        }
    }

    /// A tool call with a fresh pairing id.
    #[must_use]
    pub fn tool_call(step: u32, name: impl Into<String>, arguments: Value) -> Self {
        Self::ToolCall {
            meta: LogMeta::new(step),
            name: name.into(),
            call_id: format!("call_{}", uuid::Uuid::now_v7()),
            arguments,
        }
    }

    /// A successful tool result paired to `call_id`.
    #[must_use]
    pub fn tool_result(
        step: u32,
        name: impl Into<String>,
        call_id: impl Into<String>,
        value: Value,
        attempts: u32,
    ) -> Self {
        Self::ToolResult {
            meta: LogMeta::new(step),
            name: name.into(),
            call_id: call_id.into(),
            value,
            is_error: false,
            attempts,
        }
    }

    /// A failed tool result paired to `call_id`.
    #[must_use]
    pub fn tool_error(
        step: u32,
        name: impl Into<String>,
        call_id: impl Into<String>,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self::ToolResult {
            meta: LogMeta::new(step),
            name: name.into(),
            call_id: call_id.into(),
            value: Value::String(error.into()),
            is_error: true,
            attempts,
        }
    }

    /// A structured output event.
    #[must_use]
    pub fn output(
        step: u32,
        name: impl Into<String>,
        attributes: BTreeMap<String, String>,
        content: impl Into<String>,
    ) -> Self {
        Self::OutputEvent {
            meta: LogMeta::new(step),
            name: name.into(),
            attributes,
            content: content.into(),
            value: Value::Null,
        }
    }

    /// A step marker for step `index` with its rendered prompt.
    #[must_use]
    pub fn step_marker(index: u32, prompt: impl Into<String>) -> Self {
        Self::StepMarker {
            meta: LogMeta::new(index),
            index,
            prompt: prompt.into(),
            response: String::new(),
        }
    }

    /// Shared metadata.
    pub fn meta(&self) -> &LogMeta {
        match self {
            Self::InputEvent { meta, .. }
            | Self::Thought { meta, .. }
            | Self::ToolCall { meta, .. }
            | Self::ToolResult { meta, .. }
            | Self::OutputEvent { meta, .. }
            | Self::StepMarker { meta, .. } => meta,
        }
    }

    /// Shared metadata, mutable.
    pub fn meta_mut(&mut self) -> &mut LogMeta {
        match self {
            Self::InputEvent { meta, .. }
            | Self::Thought { meta, .. }
            | Self::ToolCall { meta, .. }
            | Self::ToolResult { meta, .. }
            | Self::OutputEvent { meta, .. }
            | Self::StepMarker { meta, .. } => meta,
        }
    }

    /// Stable discriminant name, used in logging and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InputEvent { .. } => "input_event",
            Self::Thought { .. } => "thought",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::OutputEvent { .. } => "output_event",
            Self::StepMarker { .. } => "step_marker",
        }
    }

    /// Entry id.
    pub fn id(&self) -> &LogId {
        &self.meta().id
    }

    /// Whether this entry has been folded into a completed step.
    pub fn is_processed(&self) -> bool {
        self.meta().processed
    }

    /// Mark the entry as processed. Entries are immutable once processed.
    pub fn mark_processed(&mut self) {
        self.meta_mut().processed = true;
    }
}
