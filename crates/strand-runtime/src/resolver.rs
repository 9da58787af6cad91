//! Reference resolver — `{{calls[N]}}` substitution in tool arguments.
//!
//! A fixed grammar instead of free-form interpolation: a reference names
//! the Nth settled tool result of the current run (completion order), with
//! an optional dotted path into its JSON value. A reference that is the
//! whole string substitutes the JSON value itself; embedded references
//! substitute their string rendering.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use strand_core::errors::EngineError;
use strand_core::memory::WorkingMemory;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{calls\[(\d+)\](?:\.([A-Za-z0-9_.\-]+))?\}\}")
        .expect("reference pattern is a valid regex")
});

/// Resolve every reference inside `args` against `memory`'s tool results.
///
/// Non-string values are returned unchanged; objects and arrays are walked
/// recursively. Unknown indices and paths are validation errors.
pub fn resolve_references(args: &Value, memory: &WorkingMemory) -> Result<Value, EngineError> {
    match args {
        Value::String(s) => resolve_string(s, memory),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                let _ = out.insert(k.clone(), resolve_references(v, memory)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_references(v, memory))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, memory: &WorkingMemory) -> Result<Value, EngineError> {
    // Whole-string reference: substitute the JSON value itself.
    if let Some(caps) = REFERENCE.captures(s)
        && caps
            .get(0)
            .is_some_and(|m| m.start() == 0 && m.end() == s.len())
    {
        return lookup(&caps, memory).map(Clone::clone);
    }
    if !REFERENCE.is_match(s) {
        return Ok(Value::String(s.to_string()));
    }
    let mut error = None;
    let replaced = REFERENCE.replace_all(s, |caps: &Captures<'_>| match lookup(caps, memory) {
        Ok(value) => render(value),
        Err(e) => {
            let _ = error.get_or_insert(e);
            String::new()
        }
    });
    match error {
        Some(e) => Err(e),
        None => Ok(Value::String(replaced.into_owned())),
    }
}

fn lookup<'a>(
    caps: &Captures<'_>,
    memory: &'a WorkingMemory,
) -> Result<&'a Value, EngineError> {
    let reference = caps.get(0).map_or("", |m| m.as_str());
    let index: usize = caps
        .get(1)
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| invalid(reference, "index out of range"))?;

    let results = memory.tool_results();
    let mut value = *results
        .get(index)
        .ok_or_else(|| invalid(reference, "no settled tool result at this index"))?;

    if let Some(path) = caps.get(2) {
        for segment in path.as_str().split('.') {
            value = match value {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i)),
                _ => None,
            }
            .ok_or_else(|| invalid(reference, format!("no field `{segment}` on this path")))?;
        }
    }
    Ok(value)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn invalid(reference: &str, reason: impl Into<String>) -> EngineError {
    EngineError::Validation {
        element: reference.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_core::logs::Log;

    fn memory_with_results(values: Vec<Value>) -> WorkingMemory {
        let mut mem = WorkingMemory::new();
        for (i, value) in values.into_iter().enumerate() {
            mem.push(Log::tool_result(0, "t", format!("call_{i}"), value, 1));
        }
        mem
    }

    #[test]
    fn plain_values_pass_through() {
        let mem = memory_with_results(vec![]);
        let args = json!({"q": "rust", "n": 3, "flag": true});
        assert_eq!(resolve_references(&args, &mem).unwrap(), args);
    }

    #[test]
    fn whole_string_reference_substitutes_json() {
        let mem = memory_with_results(vec![json!({"items": [1, 2, 3]})]);
        let args = json!({"data": "{{calls[0]}}"});
        assert_eq!(
            resolve_references(&args, &mem).unwrap(),
            json!({"data": {"items": [1, 2, 3]}})
        );
    }

    #[test]
    fn path_navigates_objects_and_arrays() {
        let mem = memory_with_results(vec![json!({"items": [{"id": 7}]})]);
        let args = json!("{{calls[0].items.0.id}}");
        assert_eq!(resolve_references(&args, &mem).unwrap(), json!(7));
    }

    #[test]
    fn embedded_reference_renders_as_string() {
        let mem = memory_with_results(vec![json!({"city": "Oslo"})]);
        let args = json!({"prompt": "weather in {{calls[0].city}} today"});
        assert_eq!(
            resolve_references(&args, &mem).unwrap(),
            json!({"prompt": "weather in Oslo today"})
        );
    }

    #[test]
    fn embedded_non_string_renders_json() {
        let mem = memory_with_results(vec![json!([1, 2])]);
        let args = json!("got {{calls[0]}}!");
        assert_eq!(resolve_references(&args, &mem).unwrap(), json!("got [1,2]!"));
    }

    #[test]
    fn results_resolve_in_completion_order() {
        let mem = memory_with_results(vec![json!("finished-first"), json!("finished-second")]);
        assert_eq!(
            resolve_references(&json!("{{calls[1]}}"), &mem).unwrap(),
            json!("finished-second")
        );
    }

    #[test]
    fn unknown_index_is_a_validation_error() {
        let mem = memory_with_results(vec![json!(1)]);
        let err = resolve_references(&json!("{{calls[5]}}"), &mem).unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[test]
    fn unknown_path_is_a_validation_error() {
        let mem = memory_with_results(vec![json!({"a": 1})]);
        let err = resolve_references(&json!("{{calls[0].b}}"), &mem).unwrap_err();
        let EngineError::Validation { reason, .. } = err else {
            panic!("expected validation error");
        };
        assert!(reason.contains("`b`"));
    }

    #[test]
    fn nested_structures_are_walked() {
        let mem = memory_with_results(vec![json!("x")]);
        let args = json!({"outer": {"list": ["{{calls[0]}}", "plain"]}});
        assert_eq!(
            resolve_references(&args, &mem).unwrap(),
            json!({"outer": {"list": ["x", "plain"]}})
        );
    }
}
