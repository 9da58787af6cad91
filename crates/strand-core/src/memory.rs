//! Working memory — the run-scoped ordered log buffer.
//!
//! Owned exclusively by the active step orchestrator for the duration of
//! one run. Entries are appended strictly in the order their originating
//! elements complete; tool results land in completion order, not
//! invocation order. A serde snapshot is flushed to the durable store
//! after every step and at run completion.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::logs::Log;

/// Ordered sequence of logs for one run, plus the pending-input sublist.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingMemory {
    /// Logs in insertion order.
    logs: Vec<Log>,
    /// External events not yet folded into a step.
    pending_inputs: Vec<Log>,
}

impl WorkingMemory {
    /// Empty memory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a log entry.
    pub fn push(&mut self, log: Log) {
        self.logs.push(log);
    }

    /// Queue an external event for the next step's prompt rendering.
    pub fn push_input(&mut self, log: Log) {
        self.pending_inputs.push(log);
    }

    /// Fold all pending inputs into the main log, returning how many moved.
    pub fn drain_inputs(&mut self) -> usize {
        let n = self.pending_inputs.len();
        self.logs.append(&mut self.pending_inputs);
        n
    }

    /// All logs, in insertion order.
    pub fn logs(&self) -> &[Log] {
        &self.logs
    }

    /// Number of logs (pending inputs excluded).
    pub fn len(&self) -> usize {
        self.logs.len()
    }

    /// Whether the main log is empty.
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    /// Number of queued-but-unfolded external events.
    pub fn pending_input_count(&self) -> usize {
        self.pending_inputs.len()
    }

    /// Logs not yet marked processed.
    pub fn unprocessed(&self) -> impl Iterator<Item = &Log> {
        self.logs.iter().filter(|l| !l.is_processed())
    }

    /// Mark every log processed (used when a step or run closes).
    pub fn mark_all_processed(&mut self) {
        for log in &mut self.logs {
            log.mark_processed();
        }
    }

    /// The result value paired with `call_id`, if it has settled.
    pub fn tool_result_for(&self, call_id: &str) -> Option<&Log> {
        self.logs.iter().find(
            |l| matches!(l, Log::ToolResult { call_id: c, .. } if c == call_id),
        )
    }

    /// Tool result values in completion order, for reference resolution.
    pub fn tool_results(&self) -> Vec<&Value> {
        self.logs
            .iter()
            .filter_map(|l| match l {
                Log::ToolResult { value, .. } => Some(value),
                _ => None,
            })
            .collect()
    }

    /// Fill in the raw response on the step marker for `index`.
    pub fn record_step_response(&mut self, index: u32, response: &str) {
        for log in &mut self.logs {
            if let Log::StepMarker {
                index: i,
                response: r,
                ..
            } = log
                && *i == index
            {
                *r = response.to_string();
            }
        }
    }

    /// Serialize to a durable snapshot value.
    pub fn snapshot(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Restore from a durable snapshot value.
    pub fn from_snapshot(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}
