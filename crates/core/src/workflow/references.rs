//! `$OUTPUT[task]` references inside task params.
//!
//! A string param of the form `$OUTPUT[name]` is replaced by the output of
//! task `name`; a trailing `.field.0.sub` path navigates into that output by
//! object key or array index. Paths that do not resolve produce `null`.

use crate::types::TaskName;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const PREFIX: &str = "$OUTPUT[";

/// A parsed reference to another task's output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRef {
    pub task: TaskName,
    pub path: Vec<String>,
}

impl OutputRef {
    pub fn parse(text: &str) -> Option<Self> {
        let rest = text.strip_prefix(PREFIX)?;
        let close = rest.find(']')?;
        let task = &rest[..close];
        if task.is_empty() {
            return None;
        }

        let tail = &rest[close + 1..];
        let path = if tail.is_empty() {
            Vec::new()
        } else {
            let segments = tail.strip_prefix('.')?;
            let path: Vec<String> = segments.split('.').map(str::to_string).collect();
            if path.iter().any(String::is_empty) {
                return None;
            }
            path
        };

        Some(Self {
            task: TaskName::new(task),
            path,
        })
    }

    fn resolve(&self, outputs: &BTreeMap<TaskName, Value>) -> Value {
        let mut current = match outputs.get(&self.task) {
            Some(value) => value,
            None => return Value::Null,
        };
        for segment in &self.path {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Value::Null,
            }
        }
        current.clone()
    }
}

/// Every output reference found in `params`
pub fn collect(params: &Map<String, Value>) -> Vec<OutputRef> {
    let mut found = Vec::new();
    for value in params.values() {
        collect_value(value, &mut found);
    }
    found
}

fn collect_value(value: &Value, found: &mut Vec<OutputRef>) {
    match value {
        Value::String(text) => found.extend(OutputRef::parse(text)),
        Value::Array(items) => items.iter().for_each(|v| collect_value(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_value(v, found)),
        _ => {}
    }
}

/// Copy of `params` with every output reference replaced by its value
pub fn resolve(params: &Map<String, Value>, outputs: &BTreeMap<TaskName, Value>) -> Map<String, Value> {
    params
        .iter()
        .map(|(key, value)| (key.clone(), resolve_value(value, outputs)))
        .collect()
}

fn resolve_value(value: &Value, outputs: &BTreeMap<TaskName, Value>) -> Value {
    match value {
        Value::String(text) => match OutputRef::parse(text) {
            Some(reference) => reference.resolve(outputs),
            None => value.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, outputs)).collect()),
        Value::Object(map) => Value::Object(resolve(map, outputs)),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> BTreeMap<TaskName, Value> {
        [(TaskName::new("fetch"), json!({ "data": [1, 2, { "id": "x" }] }))]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            OutputRef::parse("$OUTPUT[fetch]"),
            Some(OutputRef {
                task: TaskName::new("fetch"),
                path: vec![]
            })
        );
        assert_eq!(
            OutputRef::parse("$OUTPUT[fetch].data.2").unwrap().path,
            vec!["data".to_string(), "2".to_string()]
        );
        assert_eq!(OutputRef::parse("$OUTPUT[]"), None);
        assert_eq!(OutputRef::parse("$OUTPUT[fetch]data"), None);
        assert_eq!(OutputRef::parse("$OUTPUT[fetch].."), None);
        assert_eq!(OutputRef::parse("plain text"), None);
    }

    #[test]
    fn test_resolve_nested_params() {
        let params = json!({
            "all": "$OUTPUT[fetch]",
            "nested": { "id": "$OUTPUT[fetch].data.2.id" },
            "list": ["$OUTPUT[fetch].data.0", "literal"],
            "missing": "$OUTPUT[fetch].nope",
            "count": 3
        });
        let Value::Object(params) = params else { unreachable!() };

        let resolved = Value::Object(resolve(&params, &outputs()));
        assert_eq!(
            resolved,
            json!({
                "all": { "data": [1, 2, { "id": "x" }] },
                "nested": { "id": "x" },
                "list": [1, "literal"],
                "missing": null,
                "count": 3
            })
        );
    }

    #[test]
    fn test_collect() {
        let Value::Object(params) = json!({
            "a": "$OUTPUT[one]",
            "b": { "c": ["$OUTPUT[two].x"] }
        }) else {
            unreachable!()
        };
        let mut tasks: Vec<String> = collect(&params).into_iter().map(|r| r.task.0).collect();
        tasks.sort();
        assert_eq!(tasks, vec!["one".to_string(), "two".to_string()]);
    }
}
