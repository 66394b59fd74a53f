//! SQLite checkpoint repository implementation.
//!
//! Implements `CheckpointRepository` from `weft-core` using sqlx with split
//! read/write pools. Run headers live in `checkpoint_runs`; step records are
//! appended to `checkpoint_records` with a per-run sequence number that fixes
//! their order. Rows that no longer decode surface as
//! `RepositoryError::Corrupted` so resume can refuse them.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use uuid::Uuid;
use weft_core::repository::checkpoint::CheckpointRepository;
use weft_types::checkpoint::{CheckpointRecord, CheckpointRun, RecordStatus};
use weft_types::error::RepositoryError;
use weft_types::workflow::RunStatus;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `CheckpointRepository`.
pub struct SqliteCheckpointRepository {
    pool: DatabasePool,
}

impl SqliteCheckpointRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    run_id: String,
    workflow_name: String,
    workflow_version: String,
    inputs: String,
    cursor: i64,
    status: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            workflow_name: row.try_get("workflow_name")?,
            workflow_version: row.try_get("workflow_version")?,
            inputs: row.try_get("inputs")?,
            cursor: row.try_get("cursor")?,
            status: row.try_get("status")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_run(self) -> Result<CheckpointRun, RepositoryError> {
        let status: RunStatus = serde_json::from_value(serde_json::Value::String(
            self.status.clone(),
        ))
        .map_err(|_| corrupted(format!("invalid run status: {}", self.status)))?;

        let inputs = serde_json::from_str(&self.inputs)
            .map_err(|e| corrupted(format!("invalid inputs JSON: {e}")))?;

        let cursor = u32::try_from(self.cursor)
            .map_err(|_| corrupted(format!("invalid cursor: {}", self.cursor)))?;

        Ok(CheckpointRun {
            run_id: parse_uuid(&self.run_id)?,
            workflow_name: self.workflow_name,
            workflow_version: self.workflow_version,
            inputs,
            cursor,
            status,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct RecordRow {
    id: String,
    run_id: String,
    step_key: String,
    status: String,
    output: Option<String>,
    error: Option<String>,
    attempt: i64,
    recorded_at: String,
}

impl RecordRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            step_key: row.try_get("step_key")?,
            status: row.try_get("status")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            attempt: row.try_get("attempt")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    fn into_record(self) -> Result<CheckpointRecord, RepositoryError> {
        let status = parse_record_status(&self.status)?;

        let output = self
            .output
            .as_deref()
            .map(|s| {
                serde_json::from_str(s).map_err(|e| {
                    corrupted(format!("invalid output JSON for '{}': {e}", self.step_key))
                })
            })
            .transpose()?;

        let attempt = u32::try_from(self.attempt)
            .map_err(|_| corrupted(format!("invalid attempt: {}", self.attempt)))?;

        Ok(CheckpointRecord {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            step_key: self.step_key,
            status,
            output,
            error: self.error,
            attempt,
            recorded_at: parse_datetime(&self.recorded_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn corrupted(message: String) -> RepositoryError {
    RepositoryError::Corrupted(message)
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| corrupted(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupted(format!("invalid datetime: {e}")))
}

/// Fixed-width so that `ORDER BY created_at` sorts chronologically.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_record_status(s: &str) -> Result<RecordStatus, RepositoryError> {
    match s {
        "completed" => Ok(RecordStatus::Completed),
        "skipped" => Ok(RecordStatus::Skipped),
        "failed" => Ok(RecordStatus::Failed),
        other => Err(corrupted(format!("invalid record status: {other}"))),
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

fn is_foreign_key_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_foreign_key_violation())
}

// ---------------------------------------------------------------------------
// CheckpointRepository impl
// ---------------------------------------------------------------------------

impl CheckpointRepository for SqliteCheckpointRepository {
    async fn create_run(&self, run: &CheckpointRun) -> Result<(), RepositoryError> {
        let inputs = serde_json::to_string(&run.inputs)
            .map_err(|e| RepositoryError::Query(format!("serialize inputs: {e}")))?;

        sqlx::query(
            r#"INSERT INTO checkpoint_runs
               (run_id, workflow_name, workflow_version, inputs, cursor, status, error, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.workflow_name)
        .bind(&run.workflow_version)
        .bind(&inputs)
        .bind(i64::from(run.cursor))
        .bind(run.status.to_string())
        .bind(&run.error)
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!("run {} already exists", run.run_id))
            } else {
                query_error(e)
            }
        })?;

        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<CheckpointRun>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT run_id, workflow_name, workflow_version, inputs, cursor, status, error,
                      created_at, updated_at
               FROM checkpoint_runs WHERE run_id = ?"#,
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = RunRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn append_record(&self, record: &CheckpointRecord) -> Result<(), RepositoryError> {
        let output = record
            .output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(format!("serialize output: {e}")))?;

        // The writer pool has a single connection, so MAX(seq) + 1 cannot race.
        sqlx::query(
            r#"INSERT INTO checkpoint_records
               (id, run_id, seq, step_key, status, output, error, attempt, recorded_at)
               VALUES (?, ?,
                       (SELECT COALESCE(MAX(seq), 0) + 1 FROM checkpoint_records WHERE run_id = ?),
                       ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.id.to_string())
        .bind(record.run_id.to_string())
        .bind(record.run_id.to_string())
        .bind(&record.step_key)
        .bind(record.status.as_str())
        .bind(&output)
        .bind(&record.error)
        .bind(i64::from(record.attempt))
        .bind(format_datetime(&record.recorded_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                RepositoryError::NotFound
            } else {
                query_error(e)
            }
        })?;

        Ok(())
    }

    async fn list_records(&self, run_id: &Uuid) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT id, run_id, step_key, status, output, error, attempt, recorded_at
               FROM checkpoint_records WHERE run_id = ? ORDER BY seq ASC"#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = RecordRow::from_row(row).map_err(query_error)?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }

    async fn update_cursor(&self, run_id: &Uuid, cursor: u32) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("UPDATE checkpoint_runs SET cursor = ?, updated_at = ? WHERE run_id = ?")
                .bind(i64::from(cursor))
                .bind(format_datetime(&Utc::now()))
                .bind(run_id.to_string())
                .execute(&self.pool.writer)
                .await
                .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE checkpoint_runs SET status = ?, error = ?, updated_at = ? WHERE run_id = ?",
        )
        .bind(status.to_string())
        .bind(error)
        .bind(format_datetime(&Utc::now()))
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete_run(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        // Records go with the run (ON DELETE CASCADE).
        let result = sqlx::query("DELETE FROM checkpoint_runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_resumable_runs(&self) -> Result<Vec<CheckpointRun>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT run_id, workflow_name, workflow_version, inputs, cursor, status, error,
                      created_at, updated_at
               FROM checkpoint_runs WHERE status != 'completed'
               ORDER BY created_at DESC, run_id DESC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = RunRow::from_row(row).map_err(query_error)?;
            runs.push(r.into_run()?);
        }
        Ok(runs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use weft_core::event::bus::EventBus;
    use weft_core::workflow::checkpoint::{CheckpointError, CheckpointManager};
    use weft_core::workflow::definition::parse_workflow_str;
    use weft_core::workflow::executor::{WorkflowEngine, WorkflowExecutor};
    use weft_core::workflow::registry::ComponentRegistry;
    use weft_core::workflow::step_runner::{StepError, executor_fn};
    use weft_types::config::EngineConfig;

    async fn test_pool(dir: &tempfile::TempDir) -> DatabasePool {
        let db_path = dir.path().join("checkpoints.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        DatabasePool::new(&url).await.unwrap()
    }

    fn sample_run() -> CheckpointRun {
        let now = Utc::now();
        CheckpointRun {
            run_id: Uuid::now_v7(),
            workflow_name: "nightly-report".to_string(),
            workflow_version: "1.0".to_string(),
            inputs: json!({"region": "eu", "limit": 10}),
            cursor: 0,
            status: RunStatus::Running,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn completed(run_id: Uuid, key: &str, output: Value) -> CheckpointRecord {
        CheckpointRecord {
            id: Uuid::now_v7(),
            run_id,
            step_key: key.to_string(),
            status: RecordStatus::Completed,
            output: Some(output),
            error: None,
            attempt: 1,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_run() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SqliteCheckpointRepository::new(test_pool(&dir).await);
        let run = sample_run();

        repo.create_run(&run).await.unwrap();
        let loaded = repo.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.run_id, run.run_id);
        assert_eq!(loaded.workflow_name, "nightly-report");
        assert_eq!(loaded.inputs, json!({"region": "eu", "limit": 10}));
        assert_eq!(loaded.status, RunStatus::Running);

        assert!(repo.get_run(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_duplicate_run_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SqliteCheckpointRepository::new(test_pool(&dir).await);
        let run = sample_run();

        repo.create_run(&run).await.unwrap();
        let err = repo.create_run(&run).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_records_keep_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SqliteCheckpointRepository::new(test_pool(&dir).await);
        let run = sample_run();
        repo.create_run(&run).await.unwrap();

        repo.append_record(&completed(run.run_id, "fetch", json!({"rows": 3})))
            .await
            .unwrap();
        repo.append_record(&CheckpointRecord {
            status: RecordStatus::Skipped,
            output: None,
            attempt: 0,
            ..completed(run.run_id, "notify", Value::Null)
        })
        .await
        .unwrap();
        repo.append_record(&CheckpointRecord {
            status: RecordStatus::Failed,
            output: None,
            error: Some("timeout".to_string()),
            ..completed(run.run_id, "fan/left", Value::Null)
        })
        .await
        .unwrap();

        let records = repo.list_records(&run.run_id).await.unwrap();
        let keys: Vec<&str> = records.iter().map(|r| r.step_key.as_str()).collect();
        assert_eq!(keys, vec!["fetch", "notify", "fan/left"]);
        assert_eq!(records[0].output, Some(json!({"rows": 3})));
        assert_eq!(records[1].status, RecordStatus::Skipped);
        assert!(records[1].output.is_none());
        assert_eq!(records[2].error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_append_to_unknown_run_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SqliteCheckpointRepository::new(test_pool(&dir).await);

        let err = repo
            .append_record(&completed(Uuid::now_v7(), "fetch", json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_cursor_and_status_updates() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SqliteCheckpointRepository::new(test_pool(&dir).await);
        let run = sample_run();
        repo.create_run(&run).await.unwrap();

        repo.update_cursor(&run.run_id, 2).await.unwrap();
        repo.update_run_status(&run.run_id, RunStatus::Failed, Some("step 'load' failed"))
            .await
            .unwrap();

        let loaded = repo.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.cursor, 2);
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("step 'load' failed"));

        let missing = Uuid::now_v7();
        assert!(matches!(
            repo.update_cursor(&missing, 1).await,
            Err(RepositoryError::NotFound)
        ));
        assert!(matches!(
            repo.update_run_status(&missing, RunStatus::Cancelled, None).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_delete_run_cascades_records() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SqliteCheckpointRepository::new(test_pool(&dir).await);
        let run = sample_run();
        repo.create_run(&run).await.unwrap();
        repo.append_record(&completed(run.run_id, "fetch", json!(1)))
            .await
            .unwrap();

        assert!(repo.delete_run(&run.run_id).await.unwrap());
        assert!(!repo.delete_run(&run.run_id).await.unwrap());
        assert!(repo.list_records(&run.run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_resumable_runs_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SqliteCheckpointRepository::new(test_pool(&dir).await);

        let older = CheckpointRun {
            created_at: Utc::now() - chrono::Duration::minutes(5),
            ..sample_run()
        };
        let newer = sample_run();
        let done = CheckpointRun {
            status: RunStatus::Completed,
            ..sample_run()
        };
        for run in [&older, &newer, &done] {
            repo.create_run(run).await.unwrap();
        }

        let runs = repo.list_resumable_runs().await.unwrap();
        let ids: Vec<Uuid> = runs.iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec![newer.run_id, older.run_id]);
    }

    #[tokio::test]
    async fn test_undecodable_output_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let repo = SqliteCheckpointRepository::new(pool.clone());
        let run = sample_run();
        repo.create_run(&run).await.unwrap();

        sqlx::query(
            r#"INSERT INTO checkpoint_records
               (id, run_id, seq, step_key, status, output, error, attempt, recorded_at)
               VALUES (?, ?, 1, 'fetch', 'completed', '{not json', NULL, 1, ?)"#,
        )
        .bind(Uuid::now_v7().to_string())
        .bind(run.run_id.to_string())
        .bind(format_datetime(&Utc::now()))
        .execute(&pool.writer)
        .await
        .unwrap();

        let err = repo.list_records(&run.run_id).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Corrupted(ref msg) if msg.contains("fetch")));

        // The manager refuses to resume from it.
        let def = parse_workflow_str(
            "version: \"1\"\nname: nightly-report\nsteps:\n  - { name: fetch, type: python, action: load }\n",
        )
        .unwrap();
        let manager = CheckpointManager::new(repo);
        let err = manager.load_resume_state(run.run_id, &def).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupted(_)));
    }

    const REPORT: &str = r#"
version: "1"
name: nightly-report
inputs:
  region: { type: string, required: true }
steps:
  - { name: fetch, type: python, action: fetch, args: { region: "${{ inputs.region }}" } }
  - { name: publish, type: python, action: publish, args: { rows: "${{ steps.fetch.output }}" } }
outputs:
  published: "${{ steps.publish.output }}"
"#;

    fn report_registry(fetches: Arc<std::sync::atomic::AtomicU32>, healthy: Arc<AtomicBool>) -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        registry
            .register_action(
                "fetch",
                executor_fn(move |inv, _cancel| {
                    let fetches = Arc::clone(&fetches);
                    async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(format!("rows-{}", inv.arguments["region"].as_str().unwrap_or("?"))))
                    }
                }),
            )
            .unwrap();
        registry
            .register_action(
                "publish",
                executor_fn(move |inv, _cancel| {
                    let healthy = Arc::clone(&healthy);
                    async move {
                        if healthy.load(Ordering::SeqCst) {
                            Ok(inv.arguments["rows"].clone())
                        } else {
                            Err(StepError::failed("sink unavailable"))
                        }
                    }
                }),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_engine_resumes_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let def = parse_workflow_str(REPORT).unwrap();
        let fetches = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let healthy = Arc::new(AtomicBool::new(false));

        let mut inputs = Map::new();
        inputs.insert("region".to_string(), json!("eu"));

        let run_id = {
            let engine = WorkflowEngine::new(
                Arc::new(report_registry(Arc::clone(&fetches), Arc::clone(&healthy))),
                SqliteCheckpointRepository::new(test_pool(&dir).await),
                EventBus::new(64),
                EngineConfig::default(),
            );
            let err = engine.execute(&def, inputs).await.unwrap_err();
            assert_eq!(err.step(), Some("publish"));
            let runs = engine.checkpoint().list_resumable().await.unwrap();
            assert_eq!(runs.len(), 1);
            assert_eq!(runs[0].status, RunStatus::Failed);
            runs[0].run_id
        };

        // New pool, new engine: only the checkpoint file survives.
        healthy.store(true, Ordering::SeqCst);
        let engine = WorkflowEngine::new(
            Arc::new(report_registry(Arc::clone(&fetches), Arc::clone(&healthy))),
            SqliteCheckpointRepository::new(test_pool(&dir).await),
            EventBus::new(64),
            EngineConfig::default(),
        );
        let result = engine.resume(run_id, &def, Map::new()).await.unwrap();

        assert_eq!(result.run_id, run_id);
        assert_eq!(result.outputs["published"], json!("rows-eu"));
        assert_eq!(fetches.load(Ordering::SeqCst), 1, "fetch must not run again");
        assert!(engine.checkpoint().list_resumable().await.unwrap().is_empty());
    }
}
