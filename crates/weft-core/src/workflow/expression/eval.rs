//! Evaluation of parsed expressions against an execution context.

use serde_json::Value;

use super::ast::{Accessor, Expr, render_path};
use super::{EvalFailure, EvaluationError, is_truthy};
use crate::workflow::context::{ExecutionContext, StepSlot, json_type_name};

impl Expr {
    /// Evaluate to a JSON value.
    ///
    /// `and`, `or` and `not` produce booleans and short-circuit left to
    /// right; a ternary yields the selected operand unchanged.
    pub fn evaluate(&self, ctx: &ExecutionContext) -> Result<Value, EvaluationError> {
        match self {
            Expr::Input { name, path } => {
                let root = render_path("inputs", &[Accessor::Key(name.clone())]);
                let value = ctx.input(name).ok_or_else(|| EvaluationError {
                    reason: EvalFailure::MissingInput,
                    path: root.clone(),
                })?;
                walk(root, value, path)
            }
            Expr::Step { step, path } => {
                let root = render_path(
                    "steps",
                    &[Accessor::Key(step.clone()), Accessor::Key("output".to_string())],
                );
                match ctx.step_slot(step) {
                    None => Err(EvaluationError {
                        reason: EvalFailure::MissingStep,
                        path: root,
                    }),
                    // A skipped step has no output to walk into.
                    Some(StepSlot::Skipped) => Ok(Value::Null),
                    Some(StepSlot::Completed(value)) => walk(root, value, path),
                }
            }
            Expr::Item(path) => {
                let value = ctx.item().ok_or_else(|| EvaluationError {
                    reason: EvalFailure::OutOfScope,
                    path: "item".to_string(),
                })?;
                walk("item".to_string(), value, path)
            }
            Expr::Index => ctx
                .index()
                .map(|i| Value::from(i as u64))
                .ok_or_else(|| EvaluationError {
                    reason: EvalFailure::OutOfScope,
                    path: "index".to_string(),
                }),
            Expr::Not(inner) => Ok(Value::Bool(!inner.evaluate_bool(ctx)?)),
            Expr::And(items) => {
                for item in items {
                    if !item.evaluate_bool(ctx)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expr::Or(items) => {
                for item in items {
                    if item.evaluate_bool(ctx)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => {
                if condition.evaluate_bool(ctx)? {
                    then.evaluate(ctx)
                } else {
                    otherwise.evaluate(ctx)
                }
            }
        }
    }

    /// Evaluate and coerce with [`is_truthy`].
    pub fn evaluate_bool(&self, ctx: &ExecutionContext) -> Result<bool, EvaluationError> {
        self.evaluate(ctx).map(|value| is_truthy(&value))
    }
}

fn walk(mut rendered: String, root: &Value, path: &[Accessor]) -> Result<Value, EvaluationError> {
    let mut current = root;
    for accessor in path {
        rendered.push_str(&accessor.to_string());
        current = match (accessor, current) {
            (Accessor::Key(key), Value::Object(map)) => map.get(key).ok_or_else(|| EvaluationError {
                reason: EvalFailure::MissingField,
                path: rendered.clone(),
            })?,
            (Accessor::Index(index), Value::Array(items)) => {
                let len = items.len();
                let position = if *index < 0 {
                    (len as i64).checked_add(*index).filter(|p| *p >= 0)
                } else {
                    Some(*index)
                };
                position
                    .and_then(|p| items.get(p as usize))
                    .ok_or_else(|| EvaluationError {
                        reason: EvalFailure::IndexOutOfRange { index: *index, len },
                        path: rendered.clone(),
                    })?
            }
            (_, other) => {
                return Err(EvaluationError {
                    reason: EvalFailure::NotAContainer {
                        found: json_type_name(other),
                    },
                    path: rendered,
                });
            }
        };
    }
    Ok(current.clone())
}
