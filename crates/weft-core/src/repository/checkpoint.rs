//! Checkpoint repository trait definition and an in-memory implementation.
//!
//! The store is an append-only log of step records plus a run header whose
//! cursor and status are replaced in place. `weft-infra` implements the
//! trait on SQLite; [`InMemoryCheckpointRepository`] backs tests and
//! embedders that do not need durability.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;
use weft_types::checkpoint::{CheckpointRecord, CheckpointRun};
use weft_types::error::RepositoryError;
use weft_types::workflow::RunStatus;

/// Repository trait for checkpoint persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointRepository: Send + Sync {
    /// Insert a new run header. Fails with `Conflict` if the ID exists.
    fn create_run(
        &self,
        run: &CheckpointRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<CheckpointRun>, RepositoryError>> + Send;

    /// Append one step record. Records are never updated.
    fn append_record(
        &self,
        record: &CheckpointRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All records of a run in append order.
    fn list_records(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<CheckpointRecord>, RepositoryError>> + Send;

    /// Replace the top-level cursor.
    fn update_cursor(
        &self,
        run_id: &Uuid,
        cursor: u32,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete a run and its records. Returns `true` if it existed.
    fn delete_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Runs that can still be resumed (not completed), newest first.
    fn list_resumable_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<CheckpointRun>, RepositoryError>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredRun {
    run: CheckpointRun,
    records: Vec<CheckpointRecord>,
}

/// Process-local checkpoint store. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointRepository {
    data: Arc<RwLock<HashMap<Uuid, StoredRun>>>,
}

impl InMemoryCheckpointRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointRepository for InMemoryCheckpointRepository {
    async fn create_run(&self, run: &CheckpointRun) -> Result<(), RepositoryError> {
        let mut data = self.data.write().await;
        if data.contains_key(&run.run_id) {
            return Err(RepositoryError::Conflict(format!(
                "run {} already exists",
                run.run_id
            )));
        }
        data.insert(
            run.run_id,
            StoredRun {
                run: run.clone(),
                records: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<CheckpointRun>, RepositoryError> {
        Ok(self.data.read().await.get(run_id).map(|s| s.run.clone()))
    }

    async fn append_record(&self, record: &CheckpointRecord) -> Result<(), RepositoryError> {
        let mut data = self.data.write().await;
        let stored = data.get_mut(&record.run_id).ok_or(RepositoryError::NotFound)?;
        stored.records.push(record.clone());
        Ok(())
    }

    async fn list_records(&self, run_id: &Uuid) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        Ok(self
            .data
            .read()
            .await
            .get(run_id)
            .map(|s| s.records.clone())
            .unwrap_or_default())
    }

    async fn update_cursor(&self, run_id: &Uuid, cursor: u32) -> Result<(), RepositoryError> {
        let mut data = self.data.write().await;
        let stored = data.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        stored.run.cursor = cursor;
        stored.run.updated_at = Utc::now();
        Ok(())
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut data = self.data.write().await;
        let stored = data.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        stored.run.status = status;
        stored.run.error = error.map(str::to_string);
        stored.run.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_run(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.data.write().await.remove(run_id).is_some())
    }

    async fn list_resumable_runs(&self) -> Result<Vec<CheckpointRun>, RepositoryError> {
        let mut runs: Vec<CheckpointRun> = self
            .data
            .read()
            .await
            .values()
            .filter(|s| s.run.status != RunStatus::Completed)
            .map(|s| s.run.clone())
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_types::checkpoint::RecordStatus;

    fn run() -> CheckpointRun {
        let now = Utc::now();
        CheckpointRun {
            run_id: Uuid::now_v7(),
            workflow_name: "greet".to_string(),
            workflow_version: "1".to_string(),
            inputs: json!({"name": "Ava"}),
            cursor: 0,
            status: RunStatus::Running,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn record(run_id: Uuid, key: &str) -> CheckpointRecord {
        CheckpointRecord {
            id: Uuid::now_v7(),
            run_id,
            step_key: key.to_string(),
            status: RecordStatus::Completed,
            output: Some(json!(key)),
            error: None,
            attempt: 1,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_run() {
        let repo = InMemoryCheckpointRepository::new();
        let run = run();
        repo.create_run(&run).await.unwrap();

        assert_eq!(repo.get_run(&run.run_id).await.unwrap(), Some(run.clone()));
        assert!(matches!(
            repo.create_run(&run).await,
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_records_keep_append_order() {
        let repo = InMemoryCheckpointRepository::new();
        let run = run();
        repo.create_run(&run).await.unwrap();

        for key in ["a", "fan/b", "fan/c"] {
            repo.append_record(&record(run.run_id, key)).await.unwrap();
        }
        let keys: Vec<String> = repo
            .list_records(&run.run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.step_key)
            .collect();
        assert_eq!(keys, vec!["a", "fan/b", "fan/c"]);
    }

    #[tokio::test]
    async fn test_append_to_unknown_run() {
        let repo = InMemoryCheckpointRepository::new();
        let err = repo.append_record(&record(Uuid::now_v7(), "a")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_cursor_status_and_delete() {
        let repo = InMemoryCheckpointRepository::new();
        let run = run();
        repo.create_run(&run).await.unwrap();

        repo.update_cursor(&run.run_id, 3).await.unwrap();
        repo.update_run_status(&run.run_id, RunStatus::Failed, Some("boom"))
            .await
            .unwrap();
        let stored = repo.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.cursor, 3);
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("boom"));

        assert_eq!(repo.list_resumable_runs().await.unwrap().len(), 1);
        assert!(repo.delete_run(&run.run_id).await.unwrap());
        assert!(!repo.delete_run(&run.run_id).await.unwrap());
        assert!(repo.list_records(&run.run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let repo = InMemoryCheckpointRepository::new();
        let other = repo.clone();
        let run = run();
        repo.create_run(&run).await.unwrap();
        assert!(other.get_run(&run.run_id).await.unwrap().is_some());
    }
}
