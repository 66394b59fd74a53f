//! Durable checkpoint manager for workflow execution state.
//!
//! Wraps `CheckpointRepository` with the run-level protocol the engine
//! follows: create a header when a run starts, append one record per settled
//! step, advance the top-level cursor, and delete everything once the run
//! completes. Failed and cancelled runs keep their records so they can be
//! resumed.
//!
//! Writes for one run are serialized through a per-run mutex, so concurrent
//! `parallel` children never interleave partial writes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;
use weft_types::checkpoint::{CheckpointRecord, CheckpointRun, RecordStatus};
use weft_types::error::RepositoryError;
use weft_types::workflow::{RunStatus, WorkflowDefinition};

use crate::repository::checkpoint::CheckpointRepository;

// ---------------------------------------------------------------------------
// ResumeState
// ---------------------------------------------------------------------------

/// Everything needed to re-enter a run: its header and the settled record
/// for every step key.
#[derive(Debug, Clone)]
pub struct ResumeState {
    pub run: CheckpointRun,
    settled: HashMap<String, CheckpointRecord>,
}

impl ResumeState {
    /// The settled (completed or skipped) record for `key`, if any.
    pub fn settled(&self, key: &str) -> Option<&CheckpointRecord> {
        self.settled.get(key)
    }

    /// Whether `key` itself or anything nested under it has settled.
    pub fn has_records_under(&self, key: &str) -> bool {
        self.settled.keys().any(|k| {
            k == key
                || k.strip_prefix(key)
                    .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('['))
        })
    }

    pub fn settled_count(&self) -> usize {
        self.settled.len()
    }

    /// Persisted inputs as a map (empty if the stored value is not an object).
    pub fn inputs(&self) -> Map<String, Value> {
        match &self.run.inputs {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable execution checkpoints for workflow runs.
///
/// Generic over `R: CheckpointRepository` so it works with any storage
/// backend (SQLite, in-memory).
pub struct CheckpointManager<R: CheckpointRepository> {
    repo: R,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl<R: CheckpointRepository> CheckpointManager<R> {
    pub fn new(repo: R) -> Self {
        Self {
            repo,
            locks: DashMap::new(),
        }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    async fn lock(&self, run_id: Uuid) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(run_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    // -----------------------------------------------------------------------
    // Run-level checkpoints
    // -----------------------------------------------------------------------

    /// Create the run header in `Running` state.
    pub async fn begin_run(
        &self,
        run_id: Uuid,
        def: &WorkflowDefinition,
        inputs: &Map<String, Value>,
    ) -> Result<CheckpointRun, CheckpointError> {
        let now = Utc::now();
        let run = CheckpointRun {
            run_id,
            workflow_name: def.name.clone(),
            workflow_version: def.version.clone(),
            inputs: Value::Object(inputs.clone()),
            cursor: 0,
            status: RunStatus::Running,
            error: None,
            created_at: now,
            updated_at: now,
        };

        let _guard = self.lock(run_id).await;
        self.repo.create_run(&run).await?;
        tracing::debug!(run_id = %run_id, workflow = %def.name, "checkpointed run start");
        Ok(run)
    }

    /// Record the run's status (and last error) without removing it.
    pub async fn mark_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), CheckpointError> {
        let _guard = self.lock(run_id).await;
        self.repo.update_run_status(&run_id, status, error).await?;
        tracing::debug!(run_id = %run_id, status = %status, "checkpointed run status");
        Ok(())
    }

    /// Replace the top-level cursor (index of the next top-level step).
    pub async fn advance_cursor(&self, run_id: Uuid, cursor: u32) -> Result<(), CheckpointError> {
        let _guard = self.lock(run_id).await;
        self.repo.update_cursor(&run_id, cursor).await?;
        tracing::debug!(run_id = %run_id, cursor, "checkpointed cursor");
        Ok(())
    }

    /// Clear a successfully completed run.
    pub async fn finish_run(&self, run_id: Uuid) -> Result<(), CheckpointError> {
        {
            let _guard = self.lock(run_id).await;
            self.repo.delete_run(&run_id).await?;
        }
        self.locks.remove(&run_id);
        tracing::debug!(run_id = %run_id, "cleared checkpoint of completed run");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step-level checkpoints
    // -----------------------------------------------------------------------

    async fn append(
        &self,
        run_id: Uuid,
        step_key: &str,
        status: RecordStatus,
        output: Option<Value>,
        error: Option<String>,
        attempt: u32,
    ) -> Result<(), CheckpointError> {
        let record = CheckpointRecord {
            id: Uuid::now_v7(),
            run_id,
            step_key: step_key.to_string(),
            status,
            output,
            error,
            attempt,
            recorded_at: Utc::now(),
        };

        let _guard = self.lock(run_id).await;
        self.repo.append_record(&record).await?;
        tracing::debug!(
            run_id = %run_id,
            step = step_key,
            status = status.as_str(),
            attempt,
            "checkpointed step"
        );
        Ok(())
    }

    pub async fn record_completed(
        &self,
        run_id: Uuid,
        step_key: &str,
        output: &Value,
        attempt: u32,
    ) -> Result<(), CheckpointError> {
        self.append(run_id, step_key, RecordStatus::Completed, Some(output.clone()), None, attempt)
            .await
    }

    pub async fn record_skipped(&self, run_id: Uuid, step_key: &str) -> Result<(), CheckpointError> {
        self.append(run_id, step_key, RecordStatus::Skipped, None, None, 0)
            .await
    }

    pub async fn record_failed(
        &self,
        run_id: Uuid,
        step_key: &str,
        error: &str,
        attempt: u32,
    ) -> Result<(), CheckpointError> {
        self.append(run_id, step_key, RecordStatus::Failed, None, Some(error.to_string()), attempt)
            .await
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Load and check the persisted state of `run_id` against `def`.
    ///
    /// Inconsistent state is reported as [`CheckpointError::Corrupted`]:
    /// a different workflow name, a cursor past the last step, a step key
    /// settled twice, a completed record without output, or a top-level
    /// step before the cursor with no settled record.
    pub async fn load_resume_state(
        &self,
        run_id: Uuid,
        def: &WorkflowDefinition,
    ) -> Result<ResumeState, CheckpointError> {
        let run = self
            .repo
            .get_run(&run_id)
            .await?
            .ok_or(CheckpointError::RunNotFound(run_id))?;

        if run.workflow_name != def.name {
            return Err(CheckpointError::Corrupted(format!(
                "run {run_id} belongs to workflow '{}', not '{}'",
                run.workflow_name, def.name
            )));
        }
        if run.status == RunStatus::Completed {
            return Err(CheckpointError::Corrupted(format!(
                "run {run_id} is marked completed but was not cleared"
            )));
        }
        if run.cursor as usize > def.steps.len() {
            return Err(CheckpointError::Corrupted(format!(
                "cursor {} is past the last of {} steps",
                run.cursor,
                def.steps.len()
            )));
        }

        let mut settled: HashMap<String, CheckpointRecord> = HashMap::new();
        for record in self.repo.list_records(&run_id).await? {
            if !record.status.is_settled() {
                continue;
            }
            if record.status == RecordStatus::Completed && record.output.is_none() {
                return Err(CheckpointError::Corrupted(format!(
                    "completed record for '{}' has no output",
                    record.step_key
                )));
            }
            if settled.contains_key(&record.step_key) {
                return Err(CheckpointError::Corrupted(format!(
                    "step '{}' was recorded as settled more than once",
                    record.step_key
                )));
            }
            settled.insert(record.step_key.clone(), record);
        }

        for step in def.steps.iter().take(run.cursor as usize) {
            if !settled.contains_key(&step.name) {
                return Err(CheckpointError::Corrupted(format!(
                    "step '{}' is before the cursor but has no record",
                    step.name
                )));
            }
        }

        tracing::info!(
            run_id = %run_id,
            cursor = run.cursor,
            settled = settled.len(),
            "loaded checkpoint for resume"
        );
        Ok(ResumeState { run, settled })
    }

    /// Runs that failed, were cancelled or crashed.
    pub async fn list_resumable(&self) -> Result<Vec<CheckpointRun>, CheckpointError> {
        Ok(self.repo.list_resumable_runs().await?)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    /// Persisted state is unreadable or inconsistent. Never retried.
    #[error("checkpoint corrupted: {0}")]
    Corrupted(String),
}

impl From<RepositoryError> for CheckpointError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Corrupted(detail) => CheckpointError::Corrupted(detail),
            other => CheckpointError::Repository(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
