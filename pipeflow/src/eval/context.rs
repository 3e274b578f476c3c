//! Evaluation context handed to the expression evaluator.

use crate::core::Input;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// The `each` variable bound while evaluating one fan-out branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Each {
    /// List index (number) or map key (string).
    pub key: Value,
    /// The branch value.
    pub value: Value,
}

/// Variables visible to expressions.
///
/// Rendered by [`EvalContext::to_value`] as a single object:
///
/// ```text
/// {
///   "param":  { ...pipeline args },
///   "step":   { "<type>": { "<name>": { ...outputs } } },
///   "each":   { "key": ..., "value": ... },
///   "loop":   { "index": n },
///   "result": { ...output of the step being ended }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalContext {
    /// Pipeline arguments.
    pub params: Input,
    /// Outputs of completed steps keyed by step full name.
    pub steps: BTreeMap<String, Value>,
    /// Current fan-out branch.
    pub each: Option<Each>,
    /// Current loop iteration.
    pub loop_index: Option<usize>,
    /// Output of the step being ended.
    pub result: Option<Value>,
}

impl EvalContext {
    /// Creates a context holding only pipeline arguments.
    #[must_use]
    pub fn new(params: Input) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    /// Adds the output value of a completed step.
    #[must_use]
    pub fn with_step(mut self, full_name: impl Into<String>, value: Value) -> Self {
        self.steps.insert(full_name.into(), value);
        self
    }

    /// Binds the `each` variable.
    #[must_use]
    pub fn with_each(mut self, key: Value, value: Value) -> Self {
        self.each = Some(Each { key, value });
        self
    }

    /// Binds `loop.index`.
    #[must_use]
    pub fn with_loop_index(mut self, index: usize) -> Self {
        self.loop_index = Some(index);
        self
    }

    /// Binds `result`.
    #[must_use]
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Renders the context as one JSON object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut steps = Map::new();
        for (full_name, value) in &self.steps {
            match full_name.split_once('.') {
                Some((step_type, name)) => {
                    let by_type = steps
                        .entry(step_type.to_string())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let Value::Object(by_type) = by_type {
                        by_type.insert(name.to_string(), value.clone());
                    }
                }
                None => {
                    steps.insert(full_name.clone(), value.clone());
                }
            }
        }

        let mut root = Map::new();
        root.insert("param".to_string(), Value::Object(self.params.clone()));
        root.insert("step".to_string(), Value::Object(steps));
        if let Some(each) = &self.each {
            root.insert("each".to_string(), json!({"key": each.key, "value": each.value}));
        }
        if let Some(index) = self.loop_index {
            root.insert("loop".to_string(), json!({ "index": index }));
        }
        if let Some(result) = &self.result {
            root.insert("result".to_string(), result.clone());
        }
        Value::Object(root)
    }

    /// Looks up a dotted path such as `step.http.fetch.status` or `each.value`.
    ///
    /// Numeric segments index into arrays.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let root = self.to_value();
        let mut current = &root;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }
}
