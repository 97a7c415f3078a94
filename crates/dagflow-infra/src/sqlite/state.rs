//! SQLite implementation of `StateStore`.
//!
//! Execution state is stored as one JSON blob per execution, with `status`
//! and `updated_at` broken out into indexed columns for the recovery scan.
//! Checkpoints are rows of their own, appended in order and reattached to
//! the state when it is loaded.

use chrono::{DateTime, SecondsFormat, Utc};
use dagflow_core::repository::state::StateStore;
use dagflow_types::error::RepositoryError;
use dagflow_types::execution::{
    Checkpoint, CheckpointType, ContextSnapshot, ExecutionState, ExecutionStatus,
};
use dagflow_types::workflow::WorkflowDefinition;
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed execution state, checkpoint and definition storage.
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: DatabasePool,
}

impl SqliteStateStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Most recently updated executions, newest first.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<ExecutionSummary>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, workflow_id, status, updated_at FROM executions ORDER BY updated_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(query_error)?;
                let status: String = row.try_get("status").map_err(query_error)?;
                let updated_at: String = row.try_get("updated_at").map_err(query_error)?;
                Ok(ExecutionSummary {
                    execution_id: parse_uuid(&id)?,
                    workflow_id: row.try_get("workflow_id").map_err(query_error)?,
                    status: status
                        .parse()
                        .map_err(|e: String| RepositoryError::Query(e))?,
                    updated_at: parse_datetime(&updated_at)?,
                })
            })
            .collect()
    }
}

/// One row of [`SqliteStateStore::list_recent`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSummary {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct CheckpointRow {
    id: String,
    execution_id: String,
    checkpoint_type: String,
    step_id: Option<String>,
    step_index: Option<i64>,
    data: Option<String>,
    context_snapshot: String,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            checkpoint_type: row.try_get("checkpoint_type")?,
            step_id: row.try_get("step_id")?,
            step_index: row.try_get("step_index")?,
            data: row.try_get("data")?,
            context_snapshot: row.try_get("context_snapshot")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        let checkpoint_type: CheckpointType =
            serde_json::from_value(Value::String(self.checkpoint_type.clone())).map_err(|_| {
                RepositoryError::Query(format!("invalid checkpoint type: {}", self.checkpoint_type))
            })?;

        let data = self
            .data
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()?;
        let context_snapshot: ContextSnapshot = serde_json::from_str(&self.context_snapshot)?;

        Ok(Checkpoint {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            checkpoint_type,
            step_id: self.step_id,
            step_index: self.step_index.map(|i| i as usize),
            data,
            context_snapshot,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC timestamps, so the `updated_at` column sorts as text.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

// ---------------------------------------------------------------------------
// StateStore impl
// ---------------------------------------------------------------------------

impl StateStore for SqliteStateStore {
    async fn save_state(&self, state: &ExecutionState) -> Result<(), RepositoryError> {
        let blob = serde_json::to_string(&state.without_checkpoints())?;

        sqlx::query(
            r#"INSERT INTO executions (id, workflow_id, status, state, created_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 state = excluded.state,
                 updated_at = excluded.updated_at,
                 completed_at = excluded.completed_at"#,
        )
        .bind(state.execution_id.to_string())
        .bind(&state.workflow_id)
        .bind(state.status.as_str())
        .bind(&blob)
        .bind(format_datetime(&state.created_at))
        .bind(format_datetime(&state.updated_at))
        .bind(state.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn load_state(&self, execution_id: &Uuid) -> Result<Option<ExecutionState>, RepositoryError> {
        let row = sqlx::query("SELECT state FROM executions WHERE id = ?")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let blob: String = row.try_get("state").map_err(query_error)?;
        let mut state: ExecutionState = serde_json::from_str(&blob)?;
        state.checkpoints = self.list_checkpoints(execution_id).await?;
        Ok(Some(state))
    }

    async fn query_stale(
        &self,
        statuses: &[ExecutionStatus],
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, RepositoryError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT id FROM executions WHERE status IN ({placeholders}) AND updated_at < ? ORDER BY updated_at ASC"
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query
            .bind(format_datetime(&older_than))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(query_error)?;
                parse_uuid(&id)
            })
            .collect()
    }

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let data = checkpoint
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let snapshot = serde_json::to_string(&checkpoint.context_snapshot)?;

        sqlx::query(
            r#"INSERT INTO checkpoints
               (id, execution_id, checkpoint_type, step_id, step_index, data, context_snapshot, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(checkpoint.id.to_string())
        .bind(checkpoint.execution_id.to_string())
        .bind(checkpoint.checkpoint_type.as_str())
        .bind(&checkpoint.step_id)
        .bind(checkpoint.step_index.map(|i| i as i64))
        .bind(&data)
        .bind(&snapshot)
        .bind(format_datetime(&checkpoint.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return RepositoryError::Conflict(format!(
                        "checkpoint {} already stored",
                        checkpoint.id
                    ));
                }
            }
            query_error(e)
        })?;

        Ok(())
    }

    async fn list_checkpoints(&self, execution_id: &Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT id, execution_id, checkpoint_type, step_id, step_index, data, context_snapshot, created_at
               FROM checkpoints WHERE execution_id = ? ORDER BY seq ASC"#,
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = CheckpointRow::from_row(row).map_err(query_error)?;
            checkpoints.push(r.into_checkpoint()?);
        }
        Ok(checkpoints)
    }

    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition = serde_json::to_string(def)?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflows (id, name, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&def.id)
        .bind(&def.name)
        .bind(&definition)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn load_definition(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(workflow_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let definition: String = row.try_get("definition").map_err(query_error)?;
                Ok(Some(serde_json::from_str(&definition)?))
            }
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::{DatabasePool, database_url};
    use dagflow_types::execution::StepResult;
    use dagflow_types::workflow::StepDefinition;
    use serde_json::json;

    async fn test_store() -> (tempfile::TempDir, SqliteStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::new(&database_url(dir.path())).await.unwrap();
        (dir, SqliteStateStore::new(pool))
    }

    fn sample_state(status: ExecutionStatus, minutes_ago: i64) -> ExecutionState {
        let mut state = ExecutionState::new(Uuid::now_v7(), "nightly-report", 3);
        state.status = status;
        state.variables.insert("region".to_string(), json!("eu"));
        state.steps.insert(
            "fetch".to_string(),
            StepResult::running("fetch").complete(json!({ "rows": 12 })),
        );
        state.completed_steps.push("fetch".to_string());
        state.updated_at = Utc::now() - chrono::Duration::minutes(minutes_ago);
        state
    }

    fn checkpoint_for(state: &ExecutionState, checkpoint_type: CheckpointType) -> Checkpoint {
        Checkpoint {
            id: Uuid::now_v7(),
            execution_id: state.execution_id,
            checkpoint_type,
            step_id: Some("fetch".to_string()),
            step_index: Some(0),
            data: Some(json!({ "rows": 12 })),
            context_snapshot: ContextSnapshot {
                variables: state.variables.clone(),
                completed_steps: state.completed_steps.clone(),
                current_step_index: 1,
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load_state_with_checkpoints() {
        let (_dir, store) = test_store().await;
        let mut state = sample_state(ExecutionStatus::Running, 0);
        store.save_state(&state).await.unwrap();

        let first = checkpoint_for(&state, CheckpointType::StepStarting);
        let second = checkpoint_for(&state, CheckpointType::StepCompleted);
        store.append_checkpoint(&first).await.unwrap();
        store.append_checkpoint(&second).await.unwrap();

        state.status = ExecutionStatus::Completed;
        state.completed_at = Some(Utc::now());
        store.save_state(&state).await.unwrap();

        let loaded = store.load_state(&state.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.steps["fetch"].output, json!({ "rows": 12 }));
        assert_eq!(loaded.variables["region"], json!("eu"));
        assert_eq!(loaded.checkpoints, vec![first, second]);
        assert!(store.load_state(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_state_blob_excludes_checkpoint_trail() {
        let (_dir, store) = test_store().await;
        let mut state = sample_state(ExecutionStatus::Running, 0);
        let checkpoint = checkpoint_for(&state, CheckpointType::StepCompleted);
        store.append_checkpoint(&checkpoint).await.unwrap();
        state.checkpoints.push(checkpoint.clone());
        store.save_state(&state).await.unwrap();

        let row = sqlx::query("SELECT state FROM executions WHERE id = ?")
            .bind(state.execution_id.to_string())
            .fetch_one(&store.pool.reader)
            .await
            .unwrap();
        let blob: String = row.try_get("state").unwrap();
        let stored: Value = serde_json::from_str(&blob).unwrap();
        assert_eq!(stored["checkpoints"], json!([]));

        let loaded = store.load_state(&state.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.checkpoints, vec![checkpoint]);
    }

    #[tokio::test]
    async fn test_duplicate_checkpoint_is_a_conflict() {
        let (_dir, store) = test_store().await;
        let state = sample_state(ExecutionStatus::Running, 0);
        store.save_state(&state).await.unwrap();
        let checkpoint = checkpoint_for(&state, CheckpointType::StepQueued);

        store.append_checkpoint(&checkpoint).await.unwrap();
        let err = store.append_checkpoint(&checkpoint).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_query_stale_filters_status_and_age() {
        let (_dir, store) = test_store().await;
        let stale_running = sample_state(ExecutionStatus::Running, 20);
        let stale_paused = sample_state(ExecutionStatus::Paused, 10);
        let fresh = sample_state(ExecutionStatus::Running, 1);
        let finished = sample_state(ExecutionStatus::Completed, 30);
        for s in [&stale_running, &stale_paused, &fresh, &finished] {
            store.save_state(s).await.unwrap();
        }

        let ids = store
            .query_stale(
                &[ExecutionStatus::Running, ExecutionStatus::Paused, ExecutionStatus::Retrying],
                Utc::now() - chrono::Duration::minutes(5),
            )
            .await
            .unwrap();
        assert_eq!(ids, vec![stale_running.execution_id, stale_paused.execution_id]);
        assert!(store.query_stale(&[], Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_definition_upsert() {
        let (_dir, store) = test_store().await;
        let mut def = WorkflowDefinition {
            id: "nightly-report".to_string(),
            name: Some("Nightly report".to_string()),
            description: None,
            variables: Default::default(),
            steps: vec![StepDefinition::new("fetch", "http")],
            max_concurrency: Some(2),
            timeout: None,
            metadata: Default::default(),
        };
        store.save_definition(&def).await.unwrap();
        def.steps.push(StepDefinition::new("publish", "echo"));
        store.save_definition(&def).await.unwrap();

        let loaded = store.load_definition("nightly-report").await.unwrap().unwrap();
        assert_eq!(loaded, def);
        assert!(store.load_definition("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_recent_orders_newest_first() {
        let (_dir, store) = test_store().await;
        let older = sample_state(ExecutionStatus::Failed, 10);
        let newer = sample_state(ExecutionStatus::Running, 1);
        store.save_state(&older).await.unwrap();
        store.save_state(&newer).await.unwrap();

        let recent = store.list_recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].execution_id, newer.execution_id);
        assert_eq!(recent[1].status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_engine_state_survives_reopen() {
        use dagflow_core::workflow::executor::WorkflowEngine;
        use dagflow_core::workflow::task::{FnTask, TaskContext, TaskError, TaskOutcome, TaskRegistry};
        use dagflow_types::config::EngineConfig;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let url = database_url(dir.path());

        let mut registry = TaskRegistry::new();
        registry.register(
            "echo",
            FnTask(|config: Value, _ctx: TaskContext| async move {
                Ok::<_, TaskError>(TaskOutcome::ok(config))
            }),
        );
        let mut first = StepDefinition::new("first", "echo");
        first.config = json!({ "greeting": "hello" });
        first.next = vec!["second".to_string()];
        let def = WorkflowDefinition {
            id: "greeter".to_string(),
            name: None,
            description: None,
            variables: Default::default(),
            steps: vec![first, StepDefinition::new("second", "echo")],
            max_concurrency: None,
            timeout: None,
            metadata: Default::default(),
        };

        let execution_id = {
            let store = Arc::new(SqliteStateStore::new(DatabasePool::new(&url).await.unwrap()));
            let engine = WorkflowEngine::new(store, Arc::new(registry), EngineConfig::default());
            let result = engine.execute(&def, Default::default(), None).await.unwrap();
            assert_eq!(result.status, ExecutionStatus::Completed);
            result.execution_id
        };

        let reopened = SqliteStateStore::new(DatabasePool::new(&url).await.unwrap());
        let state = reopened.load_state(&execution_id).await.unwrap().unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(state.completed_steps, vec!["first", "second"]);
        assert_eq!(state.steps["first"].output["greeting"], json!("hello"));
        assert_eq!(
            state.checkpoints.first().unwrap().checkpoint_type,
            CheckpointType::ExecutionStarted
        );
        assert_eq!(
            state.checkpoints.last().unwrap().checkpoint_type,
            CheckpointType::ExecutionCompleted
        );
        assert!(reopened.load_definition("greeter").await.unwrap().is_some());
    }
}
