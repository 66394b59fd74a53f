//! Checkpoint persistence types.
//!
//! A checkpoint is a run header (`CheckpointRun`) plus an append-only list of
//! step records (`CheckpointRecord`). Records are keyed by a scope-qualified
//! step key such as `build`, `fanout/left`, `fanout[2]/fetch` or
//! `publish/upload`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::RunStatus;

/// Persisted header of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRun {
    /// UUIDv7 run ID.
    pub run_id: Uuid,
    /// Name of the workflow being executed.
    pub workflow_name: String,
    /// Document version of the workflow being executed.
    pub workflow_version: String,
    /// Inputs the run was started with (after defaults were applied).
    pub inputs: Value,
    /// Index of the next top-level step to execute.
    pub cursor: u32,
    /// Last recorded run status.
    pub status: RunStatus,
    /// Error message of the last failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome recorded for one step key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Completed,
    Skipped,
    Failed,
}

impl RecordStatus {
    /// Completed and skipped records are never re-executed on resume.
    pub fn is_settled(&self) -> bool {
        matches!(self, RecordStatus::Completed | RecordStatus::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Completed => "completed",
            RecordStatus::Skipped => "skipped",
            RecordStatus::Failed => "failed",
        }
    }
}

/// One append-only step record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// UUIDv7 record ID (time-sortable, gives append order).
    pub id: Uuid,
    pub run_id: Uuid,
    /// Scope-qualified step key.
    pub step_key: String,
    pub status: RecordStatus,
    /// Step output for completed records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Failure message for failed records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempt number (1-based; validate steps count re-attempts).
    pub attempt: u32,
    pub recorded_at: DateTime<Utc>,
}
