//! The `${{ ... }}` expression language.
//!
//! Expressions are parsed once at load time into an [`Expr`] tree and
//! evaluated many times against an [`ExecutionContext`](super::context::ExecutionContext).
//! The grammar is deliberately small: references into `inputs`, `steps`,
//! `item` and `index`, combined with `not`, `and`, `or` and a Python-style
//! `a if cond else b` ternary. There are no literals and no parentheses.

mod ast;
mod eval;
mod lexer;
mod parser;
mod template;

use std::fmt;

use serde_json::Value;

pub use ast::{Accessor, Expr, Reference};
pub use parser::parse_expression;
pub use template::{Segment, Template, parse_condition, render_value};

/// Syntax error in an expression or template.
///
/// Displays as the message followed by the offending text with a caret under
/// the character at `offset`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} at offset {offset}\n{text}\n{marker:>width$}", marker = "^", width = .offset + 1)]
pub struct ParseError {
    pub message: String,
    /// Character offset into `text`.
    pub offset: usize,
    /// The expression or template being parsed.
    pub text: String,
}

impl ParseError {
    pub fn new(message: impl Into<String>, offset: usize, text: &str) -> Self {
        Self {
            message: message.into(),
            offset,
            text: text.to_string(),
        }
    }

    /// Shift the error into the coordinates of an enclosing template.
    pub(crate) fn rebase(mut self, base: usize, full_text: &str) -> Self {
        self.offset += base;
        self.text = full_text.to_string();
        self
    }

    /// The source line with a caret under the offending character.
    pub fn caret(&self) -> String {
        format!("{}\n{}^", self.text, " ".repeat(self.offset))
    }
}

/// Why a reference could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalFailure {
    MissingInput,
    MissingStep,
    MissingField,
    IndexOutOfRange { index: i64, len: usize },
    /// An accessor was applied to a scalar or null.
    NotAContainer { found: &'static str },
    /// `item` or `index` used outside a `for_each` scope.
    OutOfScope,
}

impl fmt::Display for EvalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalFailure::MissingInput => f.write_str("missing input"),
            EvalFailure::MissingStep => f.write_str("missing step output"),
            EvalFailure::MissingField => f.write_str("missing field"),
            EvalFailure::IndexOutOfRange { index, len } => {
                write!(f, "index {index} out of range for length {len}")
            }
            EvalFailure::NotAContainer { found } => write!(f, "accessor not applicable to {found}"),
            EvalFailure::OutOfScope => f.write_str("only available inside a for_each scope"),
        }
    }
}

/// Runtime failure resolving a reference.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason} at '{path}'")]
pub struct EvaluationError {
    pub reason: EvalFailure,
    /// The reference path up to and including the failing accessor.
    pub path: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExpressionError {
    #[error("{0}")]
    Parse(#[from] ParseError),
    #[error("{0}")]
    Evaluation(#[from] EvaluationError),
}

/// Boolean coercion used by `not`, `and`, `or` and ternary conditions.
///
/// Null, `false`, zero, and empty strings, arrays and objects are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness_table() {
        let falsy = [json!(null), json!(false), json!(0), json!(0.0), json!(""), json!([]), json!({})];
        for value in falsy {
            assert!(!is_truthy(&value), "{value} should be falsy");
        }

        let truthy = [json!(true), json!(1), json!(-1), json!(0.5), json!("no"), json!([0]), json!({"a": null})];
        for value in truthy {
            assert!(is_truthy(&value), "{value} should be truthy");
        }
    }

    #[test]
    fn test_parse_error_caret_rendering() {
        let err = parse_expression("inputs.a or env.x").unwrap_err();
        assert_eq!(err.caret(), "inputs.a or env.x\n            ^");
        let rendered = err.to_string();
        assert!(rendered.starts_with("unknown reference root 'env'"));
        assert!(rendered.ends_with(&format!("at offset 12\n{}", err.caret())));

        let err: &dyn std::error::Error = &err;
        assert!(err.source().is_none());
    }

    #[test]
    fn test_evaluation_error_display() {
        let err = EvaluationError {
            reason: EvalFailure::IndexOutOfRange { index: 5, len: 2 },
            path: "steps.list.output[5]".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "index 5 out of range for length 2 at 'steps.list.output[5]'"
        );
    }
}
