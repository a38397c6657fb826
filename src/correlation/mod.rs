//! Per-virtual-user bindings and the rules that populate them.
//!
//! A store is owned by exactly one virtual user and never shared, so it
//! carries no synchronization. Bindings survive across iterations of the
//! same virtual user and are dropped with it.

use std::collections::HashMap;

use serde_json::Value;

use crate::models::dsl_model::{ExtractionRule, ExtractionSource};

#[derive(Debug, Clone, Default)]
pub struct CorrelationStore {
    bindings: HashMap<String, Value>,
}

impl CorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    pub fn unset(&mut self, name: &str) {
        self.bindings.remove(name);
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Applies an extraction result: a bound value overwrites, an absent one
    /// clears any stale value from an earlier iteration.
    pub fn apply(&mut self, name: &str, extracted: Extracted) {
        match extracted {
            Extracted::Bound(value) => self.bind(name, value),
            Extracted::Absent(_) => self.unset(name),
        }
    }
}

/// Why an extraction produced no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbsentReason {
    BodyNotJson,
    FieldMissing,
    FieldNotText,
    DelimiterNotFound,
    EmptyMatch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    Bound(Value),
    Absent(AbsentReason),
}

impl Extracted {
    pub fn is_bound(&self) -> bool {
        matches!(self, Extracted::Bound(_))
    }
}

/// Resolves a dot path (`data.items.0.id`) inside a JSON document. An empty
/// path addresses the root.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Runs one extraction rule against a response body. `json` is the parsed
/// body when it parsed.
pub fn extract(rule: &ExtractionRule, json: Option<&Value>, raw_body: &str) -> Extracted {
    match &rule.source {
        ExtractionSource::Json(path) => {
            let Some(root) = json else {
                return Extracted::Absent(AbsentReason::BodyNotJson);
            };
            match lookup_path(root, path) {
                Some(Value::Null) | None => Extracted::Absent(AbsentReason::FieldMissing),
                Some(value) => Extracted::Bound(value.clone()),
            }
        }
        ExtractionSource::Pattern { field, delimiter } => {
            let text = match field {
                Some(path) => {
                    let Some(root) = json else {
                        return Extracted::Absent(AbsentReason::BodyNotJson);
                    };
                    match lookup_path(root, path) {
                        Some(Value::String(s)) => s.as_str(),
                        Some(Value::Null) | None => {
                            return Extracted::Absent(AbsentReason::FieldMissing)
                        }
                        Some(_) => return Extracted::Absent(AbsentReason::FieldNotText),
                    }
                }
                None => raw_body,
            };
            match text.split_once(delimiter.as_str()) {
                None => Extracted::Absent(AbsentReason::DelimiterNotFound),
                Some((_, after)) => {
                    let after = after.trim();
                    if after.is_empty() {
                        Extracted::Absent(AbsentReason::EmptyMatch)
                    } else {
                        Extracted::Bound(Value::String(after.to_string()))
                    }
                }
            }
        }
    }
}
