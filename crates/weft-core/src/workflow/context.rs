//! Execution context: the data an expression can see.
//!
//! `ExecutionContext` holds resolved workflow inputs, the outputs (or skip
//! markers) of steps that have already run, and, inside a `for_each` scope,
//! the current `item` and `index`. The engine owns and mutates it; expression
//! evaluation only borrows it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use weft_types::workflow::InputSpec;

/// What a step left behind in the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "output", rename_all = "snake_case")]
pub enum StepSlot {
    Completed(Value),
    Skipped,
}

impl StepSlot {
    /// The value seen by `steps.<name>.output`. Skipped steps read as null.
    pub fn output(&self) -> &Value {
        match self {
            StepSlot::Completed(value) => value,
            StepSlot::Skipped => &Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LoopScope {
    item: Value,
    index: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    inputs: Map<String, Value>,
    steps: BTreeMap<String, StepSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<LoopScope>,
}

impl ExecutionContext {
    pub fn new(inputs: Map<String, Value>) -> Self {
        Self {
            inputs,
            steps: BTreeMap::new(),
            scope: None,
        }
    }

    pub fn inputs(&self) -> &Map<String, Value> {
        &self.inputs
    }

    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    pub fn step_slot(&self, name: &str) -> Option<&StepSlot> {
        self.steps.get(name)
    }

    /// Output of a completed step; `None` for skipped or unknown steps.
    pub fn step_output(&self, name: &str) -> Option<&Value> {
        match self.steps.get(name)? {
            StepSlot::Completed(value) => Some(value),
            StepSlot::Skipped => None,
        }
    }

    pub fn set_step_output(&mut self, name: &str, output: Value) {
        self.steps.insert(name.to_string(), StepSlot::Completed(output));
    }

    pub fn mark_skipped(&mut self, name: &str) {
        self.steps.insert(name.to_string(), StepSlot::Skipped);
    }

    /// Copy the slots `names` from `other` into this context.
    ///
    /// Used to merge a parallel child's snapshot back into its parent.
    pub fn merge_steps<'a>(&mut self, other: &ExecutionContext, names: impl IntoIterator<Item = &'a str>) {
        for name in names {
            if let Some(slot) = other.steps.get(name) {
                self.steps.insert(name.to_string(), slot.clone());
            }
        }
    }

    pub fn item(&self) -> Option<&Value> {
        self.scope.as_ref().map(|s| &s.item)
    }

    pub fn index(&self) -> Option<usize> {
        self.scope.as_ref().map(|s| s.index)
    }

    /// A copy of this context with `item` and `index` bound for one
    /// `for_each` iteration.
    pub fn scoped_for_item(&self, item: Value, index: usize) -> Self {
        Self {
            inputs: self.inputs.clone(),
            steps: self.steps.clone(),
            scope: Some(LoopScope { item, index }),
        }
    }

    /// Names of every step recorded so far, in lexical order.
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Caller inputs that do not satisfy the workflow's input declarations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid workflow inputs: {}", .problems.join("; "))]
pub struct InputError {
    pub problems: Vec<String>,
}

/// Resolve caller-provided values against the declared inputs.
///
/// Provided values are type-checked, missing ones fall back to their default,
/// and optional inputs without a default resolve to null. Every problem is
/// reported, not just the first.
pub fn resolve_inputs(
    specs: &[InputSpec],
    provided: &Map<String, Value>,
) -> Result<Map<String, Value>, InputError> {
    let mut problems = Vec::new();
    let mut resolved = Map::new();

    for name in provided.keys() {
        if !specs.iter().any(|spec| &spec.name == name) {
            problems.push(format!("unknown input '{name}'"));
        }
    }

    for spec in specs {
        let value = match provided.get(&spec.name) {
            Some(value) if !spec.input_type.accepts(value) => {
                problems.push(format!(
                    "input '{}' expects {}, got {}",
                    spec.name,
                    spec.input_type,
                    json_type_name(value)
                ));
                continue;
            }
            Some(value) => value.clone(),
            None => match &spec.default {
                Some(default) => default.clone(),
                None if spec.required => {
                    problems.push(format!("missing required input '{}'", spec.name));
                    continue;
                }
                None => Value::Null,
            },
        };
        resolved.insert(spec.name.clone(), value);
    }

    if problems.is_empty() {
        Ok(resolved)
    } else {
        Err(InputError { problems })
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
