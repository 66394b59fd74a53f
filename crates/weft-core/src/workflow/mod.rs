//! Workflow engine core: definitions, expressions, validation and execution.
//!
//! - `definition` -- YAML/JSON parsing, version gate, filesystem load/save
//! - `expression` -- `${{ ... }}` templates: lexer, parser, AST and evaluator
//! - `context` -- Execution context and input resolution
//! - `validator` -- Static checks producing diagnostics
//! - `graph` -- Step tree walks and sub-workflow cycle detection
//! - `registry` -- Component registry (actions, agents, generators, sub-workflows)
//! - `step_runner` -- The executor contract for external step implementations
//! - `retry` -- Retry policy for validate steps
//! - `checkpoint` -- Durable checkpoint manager for resume
//! - `executor` -- The workflow engine

pub mod checkpoint;
pub mod context;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod graph;
pub mod registry;
pub mod retry;
pub mod step_runner;
pub mod validator;
