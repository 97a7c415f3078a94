//! Durable checkpoint manager for workflow execution state.
//!
//! Wraps a `StateStore` to provide a higher-level API for recording
//! lifecycle checkpoints. Every checkpoint first mutates the in-memory
//! `ExecutionState` according to its type, is appended to the state's
//! checkpoint list, and then the full state and the new record are persisted
//! in that order, so a reader never sees a checkpoint newer than the state.

use std::sync::Arc;

use chrono::Utc;
use dagflow_types::execution::{
    Checkpoint, CheckpointType, ErrorLogEntry, ExecutionState, ExecutionStatus, StepResult,
};
use serde_json::Value;
use uuid::Uuid;

use crate::repository::state::StateStore;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable execution checkpoints.
///
/// Generic over `S: StateStore` so it works with any storage backend
/// (SQLite, in-memory, etc.). Write failures are logged and swallowed: the
/// execution keeps running in memory with degraded recovery guarantees.
pub struct CheckpointManager<S: StateStore> {
    store: Arc<S>,
}

impl<S: StateStore> CheckpointManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Record a checkpoint: mutate `state`, append the record, persist both.
    pub async fn save_checkpoint(
        &self,
        state: &mut ExecutionState,
        checkpoint_type: CheckpointType,
        step_id: Option<&str>,
        step_index: Option<usize>,
        data: Option<Value>,
    ) -> Checkpoint {
        apply_checkpoint(state, checkpoint_type, step_id, step_index, data.as_ref());

        let checkpoint = Checkpoint {
            id: Uuid::now_v7(),
            execution_id: state.execution_id,
            checkpoint_type,
            step_id: step_id.map(str::to_string),
            step_index,
            data,
            context_snapshot: state.snapshot(),
            created_at: Utc::now(),
        };
        state.checkpoints.push(checkpoint.clone());
        state.updated_at = checkpoint.created_at;

        if let Err(e) = self.store.save_state(state).await {
            tracing::warn!(
                execution_id = %state.execution_id,
                checkpoint = %checkpoint_type,
                error = %e,
                "failed to persist execution state, continuing in memory"
            );
        }
        if let Err(e) = self.store.append_checkpoint(&checkpoint).await {
            tracing::warn!(
                execution_id = %state.execution_id,
                checkpoint = %checkpoint_type,
                error = %e,
                "failed to append checkpoint, continuing in memory"
            );
        }

        tracing::debug!(
            execution_id = %state.execution_id,
            checkpoint = %checkpoint_type,
            step_id = step_id.unwrap_or("-"),
            "checkpoint saved"
        );
        checkpoint
    }

    // -----------------------------------------------------------------------
    // Recovery helpers
    // -----------------------------------------------------------------------

    /// Load the latest persisted state of an execution.
    pub async fn load_state(&self, execution_id: Uuid) -> Result<ExecutionState, CheckpointError> {
        self.store
            .load_state(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::ExecutionNotFound(execution_id))
    }

    /// True only when the persisted status is running, paused or retrying.
    pub async fn can_resume(&self, execution_id: Uuid) -> Result<bool, CheckpointError> {
        Ok(self.load_state(execution_id).await?.can_resume())
    }

    pub async fn list_checkpoints(&self, execution_id: Uuid) -> Result<Vec<Checkpoint>, CheckpointError> {
        self.store
            .list_checkpoints(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// State mutation
// ---------------------------------------------------------------------------

/// Apply the state change a checkpoint of `checkpoint_type` stands for.
///
/// Step checkpoints carry the serialized `StepResult` as `data`;
/// `variable_updated` carries an object merged into the variables;
/// `ai_conversation_state` carries the opaque state itself.
pub fn apply_checkpoint(
    state: &mut ExecutionState,
    checkpoint_type: CheckpointType,
    step_id: Option<&str>,
    step_index: Option<usize>,
    data: Option<&Value>,
) {
    let now = Utc::now();
    match checkpoint_type {
        CheckpointType::ExecutionStarted | CheckpointType::ExecutionResumed => {
            state.status = ExecutionStatus::Running;
            state.completed_at = None;
        }
        CheckpointType::StepQueued => {}
        CheckpointType::StepStarting => {
            if let Some(id) = step_id {
                let finished = state.steps.get(id).is_some_and(|r| r.status.is_terminal());
                if !finished {
                    state.steps.insert(id.to_string(), StepResult::running(id));
                }
            }
            if state.status == ExecutionStatus::Retrying {
                state.status = ExecutionStatus::Running;
            }
        }
        CheckpointType::StepCompleted | CheckpointType::StepSkipped | CheckpointType::StepFailed => {
            let Some(id) = step_id else { return };
            if let Some(result) = data.and_then(|d| serde_json::from_value::<StepResult>(d.clone()).ok()) {
                let finished = state.steps.get(id).is_some_and(|r| r.status.is_terminal());
                if !finished {
                    state.steps.insert(id.to_string(), result);
                }
            }

            let list = match checkpoint_type {
                CheckpointType::StepCompleted => &mut state.completed_steps,
                CheckpointType::StepSkipped => &mut state.skipped_steps,
                _ => &mut state.failed_steps,
            };
            if !list.iter().any(|s| s == id) {
                list.push(id.to_string());
            }

            if checkpoint_type == CheckpointType::StepFailed {
                let error = state
                    .steps
                    .get(id)
                    .and_then(|r| r.error.clone())
                    .unwrap_or_else(|| "step failed".to_string());
                state.error_log.push(ErrorLogEntry {
                    step_id: Some(id.to_string()),
                    error,
                    timestamp: now,
                });
            } else if let Some(index) = step_index {
                state.current_step_index = state.current_step_index.max(index + 1);
            }

            if state.status == ExecutionStatus::Retrying {
                state.status = ExecutionStatus::Running;
            }
        }
        CheckpointType::StepRetrying => {
            if let Some(id) = step_id {
                let attempt = data
                    .and_then(|d| d.get("attempt"))
                    .and_then(Value::as_u64)
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(1);
                state.retry_counts.insert(id.to_string(), attempt);
            }
            state.status = ExecutionStatus::Retrying;
        }
        CheckpointType::ExecutionPaused => state.status = ExecutionStatus::Paused,
        CheckpointType::ExecutionCompleted => {
            state.status = ExecutionStatus::Completed;
            state.completed_at = Some(now);
        }
        CheckpointType::ExecutionFailed => {
            state.status = ExecutionStatus::Failed;
            state.completed_at = Some(now);
            if let Some(error) = data.and_then(|d| d.get("error")).and_then(Value::as_str) {
                state.error_log.push(ErrorLogEntry {
                    step_id: step_id.map(str::to_string),
                    error: error.to_string(),
                    timestamp: now,
                });
            }
        }
        CheckpointType::ExecutionCancelled => {
            state.status = ExecutionStatus::Cancelled;
            state.completed_at = Some(now);
        }
        CheckpointType::VariableUpdated => {
            if let Some(Value::Object(vars)) = data {
                state
                    .variables
                    .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        CheckpointType::AiConversationState => {
            if let (Some(id), Some(value)) = (step_id, data) {
                state.conversation_states.insert(id.to_string(), value.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying store operation failed.
    #[error("checkpoint store error: {0}")]
    Repository(String),

    /// No persisted state for this execution.
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
