//! Configuration types for weft.
//!
//! `WeftConfig` represents the top-level `config.toml` controlling engine
//! limits, the checkpoint database location and logging.

use serde::{Deserialize, Serialize};

/// Top-level configuration. All sections and fields have defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeftConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Limits and policies applied by the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default per-step timeout (overridden by a step's `timeout_secs`).
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// Whole-run timeout.
    #[serde(default = "default_workflow_timeout_secs")]
    pub workflow_timeout_secs: u64,
    /// Maximum sub-workflow nesting depth.
    #[serde(default = "default_max_subworkflow_depth")]
    pub max_subworkflow_depth: u32,
    /// Maximum concurrently running children of one `parallel` step.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Capacity of the broadcast event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// How validation diagnostics are treated at load time.
    #[serde(default)]
    pub validation: ValidationMode,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_workflow_timeout_secs() -> u64 {
    1800
}

fn default_max_subworkflow_depth() -> u32 {
    5
}

fn default_max_parallel() -> usize {
    8
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout_secs(),
            workflow_timeout_secs: default_workflow_timeout_secs(),
            max_subworkflow_depth: default_max_subworkflow_depth(),
            max_parallel: default_max_parallel(),
            event_capacity: default_event_capacity(),
            validation: ValidationMode::default(),
        }
    }
}

/// Strict validation fails on any diagnostic; lenient returns them alongside
/// a usable definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    #[default]
    Strict,
    Lenient,
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Where checkpoints are persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// SQLite URL. `None` means the data-directory default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Tracing subscriber settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
    /// Export spans through OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            otel: false,
        }
    }
}
