//! Collaborator contracts — the traits tools, outputs, and conversations
//! implement to plug into the engine.
//!
//! All composition happens at build time through the
//! [`crate::builder::EngineBuilder`]; the engine only ever sees these
//! traits, never concrete collaborator types.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use strand_core::errors::EngineError;
use strand_core::ids::{ConversationId, RunId};
use strand_core::logs::Log;
use strand_core::memory::WorkingMemory;

use crate::context::ConversationState;

/// Expected JSON shape of a parameter field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// JSON string.
    String,
    /// JSON number.
    Number,
    /// JSON boolean.
    Bool,
    /// JSON object.
    Object,
    /// JSON array.
    Array,
    /// Any JSON value.
    Any,
}

impl ParamKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }
}

/// One declared parameter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamField {
    /// Field name.
    pub name: String,
    /// Expected shape.
    pub kind: ParamKind,
    /// Whether the field must be present.
    pub required: bool,
}

impl ParamField {
    /// A required field.
    #[must_use]
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    /// An optional field.
    #[must_use]
    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// Declared parameter shape for a tool or output.
///
/// Small, auditable checks only: presence of required fields and the JSON
/// type of fields that are present. Unknown fields pass through.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSchema {
    /// Declared fields.
    pub fields: Vec<ParamField>,
}

impl ParamSchema {
    /// A schema with no declared fields; everything validates.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Schema from a field list.
    #[must_use]
    pub fn new(fields: Vec<ParamField>) -> Self {
        Self { fields }
    }

    /// Check `args` against the declared fields.
    pub fn validate(&self, args: &Value) -> Result<(), String> {
        if self.fields.is_empty() {
            return Ok(());
        }
        let Some(map) = args.as_object() else {
            return Err("arguments must be a JSON object".to_string());
        };
        for field in &self.fields {
            match map.get(&field.name) {
                None if field.required => {
                    return Err(format!("missing required field: {}", field.name));
                }
                None => {}
                Some(value) if !field.kind.accepts(value) => {
                    return Err(format!(
                        "field {} must be a {}",
                        field.name,
                        field.kind.describe()
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Per-invocation context handed to tool and output handlers.
#[derive(Clone, Debug)]
pub struct RunContext {
    /// Conversation the run belongs to.
    pub conversation_id: ConversationId,
    /// Run id.
    pub run_id: RunId,
    /// Step index at invocation time.
    pub step: u32,
    /// Run-level abort signal; long handlers should observe it.
    pub cancel: CancellationToken,
}

/// Failure raised by a tool or output handler.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The handler failed; the text lands on the failed result log.
    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    /// Convenience constructor.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A side-effecting capability the model can invoke mid-run.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Registered element tag.
    fn name(&self) -> &str;

    /// Declared argument shape.
    fn schema(&self) -> ParamSchema {
        ParamSchema::empty()
    }

    /// Extra attempts after the first failure.
    fn retries(&self) -> u32 {
        0
    }

    /// Whether the tool is offered in this conversation's prompts.
    fn enabled(&self, _state: &ConversationState) -> bool {
        true
    }

    /// Run the tool. Called once per attempt.
    async fn execute(&self, args: Value, ctx: &RunContext) -> Result<Value, ToolError>;
}

/// A structured output channel toward a collaborator.
#[async_trait]
pub trait Output: Send + Sync {
    /// Registered element tag.
    fn name(&self) -> &str;

    /// Declared attribute shape.
    fn schema(&self) -> ParamSchema {
        ParamSchema::empty()
    }

    /// Whether the output is offered in this conversation's prompts.
    fn enabled(&self, _state: &ConversationState) -> bool {
        true
    }

    /// Deliver the emitted content.
    async fn emit(
        &self,
        content: String,
        attributes: &BTreeMap<String, String>,
        ctx: &RunContext,
    ) -> Result<Value, ToolError>;
}

/// Whether a spec entry names a tool or an output channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecRole {
    /// Invocable tool; content is a JSON argument object.
    Tool,
    /// Output channel; content is free text, attributes are validated.
    Output,
}

/// Prompt-rendering description of one enabled element.
#[derive(Clone, Debug)]
pub struct ToolSpec {
    /// Element tag.
    pub name: String,
    /// Declared parameter shape.
    pub schema: ParamSchema,
    /// Tool or output.
    pub role: SpecRole,
}

/// Per-conversation-kind behavior knobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSettings {
    /// Hard ceiling on steps per run.
    pub max_steps: u32,
    /// Soft ceiling on working-memory length before prompts truncate.
    pub max_memory_logs: usize,
    /// Model override passed to the provider; `None` uses its default.
    pub model: Option<String>,
    /// Treat unterminated elements as errors instead of warnings.
    pub strict_parse: bool,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            max_steps: 5,
            max_memory_logs: 256,
            model: None,
            strict_parse: false,
        }
    }
}

/// What the run should do after a top-level error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Resume stepping from the next step.
    Recover,
    /// Close the run early, keeping persisted progress.
    Abort,
}

/// A registered conversation kind: identity, settings, and lifecycle hooks.
#[async_trait]
pub trait Conversation: Send + Sync {
    /// Registered kind name.
    fn kind(&self) -> &str;

    /// Canonical argument key; same args must yield the same key.
    fn derive_key(&self, args: &Value) -> String {
        ConversationId::canonical_args(args)
    }

    /// Behavior knobs for this kind.
    fn settings(&self) -> ConversationSettings {
        ConversationSettings::default()
    }

    /// Render the prompt for the next model call.
    fn render_prompt(&self, memory: &WorkingMemory, specs: &[ToolSpec]) -> String {
        default_prompt(memory, specs)
    }

    /// Called after each step closes, before the continuation decision.
    async fn on_step(
        &self,
        _state: &mut ConversationState,
        _memory: &WorkingMemory,
        _step: u32,
    ) -> Result<(), ToolError> {
        Ok(())
    }

    /// Called once when the run completes.
    async fn on_run(
        &self,
        _state: &mut ConversationState,
        _memory: &WorkingMemory,
    ) -> Result<(), ToolError> {
        Ok(())
    }

    /// Called when a step fails fatally. Partial progress is already
    /// persisted when this runs.
    async fn on_error(
        &self,
        _state: &mut ConversationState,
        _error: &EngineError,
    ) -> ErrorDisposition {
        ErrorDisposition::Abort
    }

    /// Whether another step should run (capped by `max_steps`).
    fn should_continue(&self, memory: &WorkingMemory) -> bool {
        default_continue(memory)
    }
}

/// Default prompt renderer: element roster, then the transcript.
#[must_use]
pub fn default_prompt(memory: &WorkingMemory, specs: &[ToolSpec]) -> String {
    let mut out = String::new();
    out.push_str("You may use the following elements:\n");
    for spec in specs {
        let role = match spec.role {
            SpecRole::Tool => "tool",
            SpecRole::Output => "output",
        };
        let fields: Vec<String> = spec
            .schema
            .fields
            .iter()
            .map(|f| {
                let req = if f.required { "" } else { "?" };
                format!("{}{}: {}", f.name, req, f.kind.describe())
            })
            .collect();
        out.push_str(&format!(
            "- <{}> ({role}) {{{}}}\n",
            spec.name,
            fields.join(", ")
        ));
    }
    out.push_str("\nTranscript:\n");
    for log in memory.logs() {
        match log {
            Log::InputEvent {
                source, content, ..
            } => out.push_str(&format!("[input:{source}] {content}\n")),
            Log::Thought { content, .. } => out.push_str(&format!("[thought] {content}\n")),
            Log::ToolCall {
                name, arguments, ..
            } => out.push_str(&format!("[call] {name} {arguments}\n")),
            Log::ToolResult {
                name,
                value,
                is_error,
                ..
            } => {
                let status = if *is_error { "error" } else { "ok" };
                out.push_str(&format!("[result:{status}] {name} {value}\n"));
            }
            Log::OutputEvent { name, content, .. } => {
                out.push_str(&format!("[output] {name} {content}\n"));
            }
            Log::StepMarker { index, .. } => out.push_str(&format!("--- step {index} ---\n")),
        }
    }
    out
}

/// Default continuation: keep stepping while there is work left — queued
/// external events, or a tool call in the step that just closed.
#[must_use]
pub fn default_continue(memory: &WorkingMemory) -> bool {
    if memory.pending_input_count() > 0 {
        return true;
    }
    let last_step = memory
        .logs()
        .iter()
        .filter_map(|l| match l {
            Log::StepMarker { index, .. } => Some(*index),
            _ => None,
        })
        .max();
    let Some(last_step) = last_step else {
        return false;
    };
    memory
        .logs()
        .iter()
        .any(|l| matches!(l, Log::ToolCall { meta, .. } if meta.step == last_step))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // --- schema validation ---

    #[test]
    fn empty_schema_accepts_anything() {
        let schema = ParamSchema::empty();
        assert!(schema.validate(&json!("not even an object")).is_ok());
    }

    #[test]
    fn missing_required_field_rejected() {
        let schema = ParamSchema::new(vec![ParamField::required("url", ParamKind::String)]);
        let err = schema.validate(&json!({})).unwrap_err();
        assert!(err.contains("url"));
    }

    #[test]
    fn wrong_type_rejected() {
        let schema = ParamSchema::new(vec![ParamField::required("count", ParamKind::Number)]);
        let err = schema.validate(&json!({"count": "three"})).unwrap_err();
        assert!(err.contains("number"));
    }

    #[test]
    fn optional_field_may_be_absent() {
        let schema = ParamSchema::new(vec![
            ParamField::required("q", ParamKind::String),
            ParamField::optional("limit", ParamKind::Number),
        ]);
        assert!(schema.validate(&json!({"q": "rust"})).is_ok());
        assert!(schema.validate(&json!({"q": "rust", "limit": 5})).is_ok());
    }

    #[test]
    fn non_object_args_rejected_when_fields_declared() {
        let schema = ParamSchema::new(vec![ParamField::required("q", ParamKind::String)]);
        assert!(schema.validate(&json!([1, 2])).is_err());
    }

    #[test]
    fn unknown_fields_pass_through() {
        let schema = ParamSchema::new(vec![ParamField::required("q", ParamKind::String)]);
        assert!(schema.validate(&json!({"q": "x", "extra": true})).is_ok());
    }

    // --- default continuation ---

    #[test]
    fn quiet_step_stops() {
        let mut mem = WorkingMemory::new();
        mem.push(Log::step_marker(0, "p"));
        mem.push(Log::thought(0, "nothing to do"));
        assert!(!default_continue(&mem));
    }

    #[test]
    fn tool_call_in_last_step_continues() {
        let mut mem = WorkingMemory::new();
        mem.push(Log::step_marker(0, "p"));
        mem.push(Log::tool_call(0, "search", json!({})));
        assert!(default_continue(&mem));
    }

    #[test]
    fn tool_call_in_earlier_step_does_not_continue() {
        let mut mem = WorkingMemory::new();
        mem.push(Log::step_marker(0, "p"));
        mem.push(Log::tool_call(0, "search", json!({})));
        mem.push(Log::step_marker(1, "p"));
        mem.push(Log::thought(1, "done"));
        assert!(!default_continue(&mem));
    }

    #[test]
    fn pending_input_continues() {
        let mut mem = WorkingMemory::new();
        mem.push(Log::step_marker(0, "p"));
        mem.push_input(Log::input(1, "web", "more"));
        assert!(default_continue(&mem));
    }

    #[test]
    fn empty_memory_stops() {
        assert!(!default_continue(&WorkingMemory::new()));
    }

    // --- prompt rendering ---

    #[test]
    fn default_prompt_lists_specs_and_transcript() {
        let mut mem = WorkingMemory::new();
        mem.push(Log::input(0, "cli", "hello"));
        let specs = vec![ToolSpec {
            name: "search".into(),
            schema: ParamSchema::new(vec![ParamField::required("q", ParamKind::String)]),
            role: SpecRole::Tool,
        }];
        let prompt = default_prompt(&mem, &specs);
        assert!(prompt.contains("<search>"));
        assert!(prompt.contains("q: string"));
        assert!(prompt.contains("[input:cli] hello"));
    }

    #[test]
    fn settings_defaults() {
        let s = ConversationSettings::default();
        assert_eq!(s.max_steps, 5);
        assert!(!s.strict_parse);
        assert!(s.model.is_none());
    }
}
