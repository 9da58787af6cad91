//! Branded ID newtypes.
//!
//! String-backed wrappers prevent accidentally passing a run id where a
//! conversation id is expected. `LogId` and `RunId` are UUID v7 so they
//! sort by creation time; `ConversationId` is a composite key derived from
//! the conversation kind plus its canonicalized arguments.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier for a single [`crate::logs::Log`] entry.
///
/// Ids are never reused; ordering follows creation time (UUID v7).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogId(String);

impl LogId {
    /// Generate a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    /// The raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LogId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for one execution of the step orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("run_{}", uuid::Uuid::now_v7()))
    }

    /// The raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier for a logical conversation: `kind:canonical-arguments`.
///
/// Two calls with the same kind and semantically equal arguments must map
/// to the same id — that is what the single-flight guarantee keys on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Build an id from a conversation kind and a derived argument key.
    #[must_use]
    pub fn derive(kind: &str, arg_key: &str) -> Self {
        Self(format!("{kind}:{arg_key}"))
    }

    /// Canonicalize a JSON argument value into a stable key string.
    ///
    /// Objects are rendered with keys in sorted order so that argument
    /// maps built in different insertion orders compare equal.
    #[must_use]
    pub fn canonical_args(args: &Value) -> String {
        match args {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let parts: Vec<String> = keys
                    .into_iter()
                    .map(|k| format!("{}={}", k, Self::canonical_args(&map[k])))
                    .collect();
                format!("{{{}}}", parts.join(","))
            }
            Value::Array(items) => {
                let parts: Vec<String> = items.iter().map(Self::canonical_args).collect();
                format!("[{}]", parts.join(","))
            }
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
        }
    }

    /// The raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
