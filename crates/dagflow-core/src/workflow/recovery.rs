//! Crash recovery: find executions that stopped making progress and produce
//! resume points for the engine.
//!
//! An execution is *interrupted* when its persisted status is still
//! `running`, `retrying` or `paused` and its state has not been updated for
//! longer than the staleness threshold. The threshold keeps a scan from
//! picking up an execution that is merely slow.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dagflow_types::config::EngineConfig;
use dagflow_types::execution::{CheckpointType, ExecutionStatus};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::repository::state::StateStore;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::dag;

/// Statuses a scan considers interrupted.
const INTERRUPTED_STATUSES: &[ExecutionStatus] = &[
    ExecutionStatus::Running,
    ExecutionStatus::Retrying,
    ExecutionStatus::Paused,
];

// ---------------------------------------------------------------------------
// Resume descriptor and report
// ---------------------------------------------------------------------------

/// Where the engine re-enters the drain loop for an interrupted execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumePoint {
    pub execution_id: Uuid,
    pub workflow_id: String,
    /// Unfinished steps to seed the ready-queue with.
    pub resume_from: Vec<String>,
    pub current_step_index: usize,
    pub completed_steps: Vec<String>,
    pub reason: String,
}

/// One execution the scan found but could not recover.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryFailure {
    pub execution_id: Uuid,
    pub reason: String,
}

/// Outcome of [`RecoveryService::recover_all`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub recovered: usize,
    pub failed: usize,
    pub resume_points: Vec<ResumePoint>,
    pub failures: Vec<RecoveryFailure>,
}

// ---------------------------------------------------------------------------
// RecoveryService
// ---------------------------------------------------------------------------

pub struct RecoveryService<S: StateStore> {
    checkpoints: CheckpointManager<S>,
    stale_after: Duration,
    recovery_delay: Duration,
}

impl<S: StateStore> RecoveryService<S> {
    pub fn new(store: Arc<S>, config: &EngineConfig) -> Self {
        Self {
            checkpoints: CheckpointManager::new(store),
            stale_after: Duration::from_secs(config.stale_after_secs),
            recovery_delay: Duration::from_millis(config.recovery_delay_ms),
        }
    }

    /// Override the staleness threshold.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Override the pause between consecutive recoveries.
    pub fn with_recovery_delay(mut self, delay: Duration) -> Self {
        self.recovery_delay = delay;
        self
    }

    /// IDs of interrupted executions older than the staleness threshold.
    pub async fn scan_interrupted_executions(&self) -> Result<Vec<Uuid>, RecoveryError> {
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .map_err(|e| RecoveryError::Repository(format!("invalid staleness threshold: {e}")))?;
        let older_than = Utc::now() - stale_after;

        let ids = self
            .checkpoints
            .store()
            .query_stale(INTERRUPTED_STATUSES, older_than)
            .await
            .map_err(|e| RecoveryError::Repository(e.to_string()))?;

        tracing::info!(
            count = ids.len(),
            stale_after_secs = self.stale_after.as_secs(),
            "scanned for interrupted executions"
        );
        Ok(ids)
    }

    /// Validate one interrupted execution and record its resumption.
    ///
    /// Writes an `execution_resumed` checkpoint carrying the reason, then
    /// returns the resume point for [`super::executor::WorkflowEngine::resume`].
    pub async fn recover_execution(&self, execution_id: Uuid) -> Result<ResumePoint, RecoveryError> {
        let mut state = self
            .checkpoints
            .load_state(execution_id)
            .await
            .map_err(|e| match e {
                CheckpointError::ExecutionNotFound(id) => RecoveryError::NotFound(id),
                other => RecoveryError::Repository(other.to_string()),
            })?;

        if !state.can_resume() {
            return Err(RecoveryError::NotResumable {
                execution_id,
                status: state.status,
            });
        }

        let definition = self
            .checkpoints
            .store()
            .load_definition(&state.workflow_id)
            .await
            .map_err(|e| RecoveryError::Repository(e.to_string()))?
            .ok_or_else(|| RecoveryError::DefinitionMissing {
                execution_id,
                workflow_id: state.workflow_id.clone(),
            })?;

        let frontier = dag::resume_frontier(&dag::normalize(&definition), &state.steps);
        let idle_secs = (Utc::now() - state.updated_at).num_seconds();
        let reason = format!(
            "no progress for {idle_secs}s while {}, resumed by recovery scan",
            state.status
        );

        self.checkpoints
            .save_checkpoint(
                &mut state,
                CheckpointType::ExecutionResumed,
                None,
                None,
                Some(json!({
                    "reason": reason,
                    "resume_from": frontier.ready,
                    "recovered": true,
                })),
            )
            .await;

        tracing::info!(
            execution_id = %execution_id,
            workflow_id = %state.workflow_id,
            resume_from = ?frontier.ready,
            "execution recovered"
        );

        Ok(ResumePoint {
            execution_id,
            workflow_id: state.workflow_id.clone(),
            resume_from: frontier.ready,
            current_step_index: state.current_step_index,
            completed_steps: state.completed_steps.clone(),
            reason,
        })
    }

    /// Recover every interrupted execution, pausing between recoveries.
    ///
    /// Only a failed scan is an error; per-execution failures are reported.
    pub async fn recover_all(&self) -> Result<RecoveryReport, RecoveryError> {
        let ids = self.scan_interrupted_executions().await?;
        let mut report = RecoveryReport {
            scanned: ids.len(),
            ..RecoveryReport::default()
        };

        for (i, execution_id) in ids.into_iter().enumerate() {
            if i > 0 && !self.recovery_delay.is_zero() {
                tokio::time::sleep(self.recovery_delay).await;
            }
            match self.recover_execution(execution_id).await {
                Ok(point) => {
                    report.recovered += 1;
                    report.resume_points.push(point);
                }
                Err(e) => {
                    tracing::warn!(execution_id = %execution_id, error = %e, "recovery failed");
                    report.failed += 1;
                    report.failures.push(RecoveryFailure {
                        execution_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            scanned = report.scanned,
            recovered = report.recovered,
            failed = report.failed,
            "recovery pass complete"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("recovery store error: {0}")]
    Repository(String),

    #[error("execution not found: {0}")]
    NotFound(Uuid),

    #[error("execution {execution_id} is not resumable (status {status})")]
    NotResumable {
        execution_id: Uuid,
        status: ExecutionStatus,
    },

    #[error("workflow '{workflow_id}' of execution {execution_id} is not stored")]
    DefinitionMissing {
        execution_id: Uuid,
        workflow_id: String,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryStateStore;
    use dagflow_types::execution::{ExecutionState, StepResult};
    use dagflow_types::workflow::{StepDefinition, WorkflowDefinition};

    fn linear_workflow() -> WorkflowDefinition {
        let mut a = StepDefinition::new("step_1", "echo");
        a.next = vec!["step_2".to_string()];
        let b = StepDefinition::new("step_2", "echo");
        WorkflowDefinition {
            id: "linear".to_string(),
            name: None,
            description: None,
            variables: Default::default(),
            steps: vec![a, b],
            max_concurrency: None,
            timeout: None,
            metadata: Default::default(),
        }
    }

    async fn seed(
        store: &InMemoryStateStore,
        status: ExecutionStatus,
        minutes_ago: i64,
    ) -> ExecutionState {
        let mut state = ExecutionState::new(Uuid::now_v7(), "linear", 2);
        state.status = status;
        state
            .steps
            .insert("step_1".to_string(), StepResult::running("step_1").complete(json!({})));
        state.completed_steps.push("step_1".to_string());
        state.current_step_index = 1;
        state.updated_at = Utc::now() - chrono::Duration::minutes(minutes_ago);
        store.save_state(&state).await.unwrap();
        state
    }

    fn service(store: &InMemoryStateStore) -> RecoveryService<InMemoryStateStore> {
        RecoveryService::new(Arc::new(store.clone()), &EngineConfig::default())
            .with_recovery_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_scan_respects_staleness_threshold() {
        let store = InMemoryStateStore::new();
        let stale = seed(&store, ExecutionStatus::Running, 10).await;
        let _fresh = seed(&store, ExecutionStatus::Running, 1).await;
        let _done = seed(&store, ExecutionStatus::Completed, 30).await;

        let ids = service(&store).scan_interrupted_executions().await.unwrap();
        assert_eq!(ids, vec![stale.execution_id]);
    }

    #[tokio::test]
    async fn test_recover_execution_builds_resume_point() {
        let store = InMemoryStateStore::new();
        store.save_definition(&linear_workflow()).await.unwrap();
        let state = seed(&store, ExecutionStatus::Running, 10).await;

        let point = service(&store)
            .recover_execution(state.execution_id)
            .await
            .unwrap();
        assert_eq!(point.resume_from, vec!["step_2"]);
        assert_eq!(point.completed_steps, vec!["step_1"]);
        assert_eq!(point.current_step_index, 1);

        let checkpoints = store.list_checkpoints(&state.execution_id).await.unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].checkpoint_type, CheckpointType::ExecutionResumed);
        assert!(checkpoints[0].data.as_ref().unwrap()["reason"].is_string());
    }

    #[tokio::test]
    async fn test_recover_all_reports_failures() {
        let store = InMemoryStateStore::new();
        store.save_definition(&linear_workflow()).await.unwrap();
        let good = seed(&store, ExecutionStatus::Paused, 20).await;

        let mut orphan = seed(&store, ExecutionStatus::Retrying, 15).await;
        orphan.workflow_id = "deleted".to_string();
        store.save_state(&orphan).await.unwrap();

        let report = service(&store).recover_all().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.recovered, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.resume_points[0].execution_id, good.execution_id);
        assert_eq!(report.failures[0].execution_id, orphan.execution_id);

        // The recovered execution was touched and is no longer stale.
        let again = service(&store).scan_interrupted_executions().await.unwrap();
        assert_eq!(again, vec![orphan.execution_id]);
    }

    #[tokio::test]
    async fn test_not_resumable() {
        let store = InMemoryStateStore::new();
        let done = seed(&store, ExecutionStatus::Completed, 10).await;
        let err = service(&store)
            .recover_execution(done.execution_id)
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::NotResumable { .. }));

        let err = service(&store).recover_execution(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, RecoveryError::NotFound(_)));
    }
}
