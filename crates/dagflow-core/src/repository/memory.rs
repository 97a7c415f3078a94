//! In-memory implementation of [`StateStore`].
//!
//! Backed by `DashMap`s, cheap to clone (all clones share the same maps).
//! Used by the engine tests and by hosts that embed the engine without a
//! database.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dagflow_types::error::RepositoryError;
use dagflow_types::execution::{Checkpoint, ExecutionState, ExecutionStatus};
use dagflow_types::workflow::WorkflowDefinition;
use dashmap::DashMap;
use uuid::Uuid;

use super::state::StateStore;

#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    states: Arc<DashMap<Uuid, ExecutionState>>,
    checkpoints: Arc<DashMap<Uuid, Vec<Checkpoint>>>,
    definitions: Arc<DashMap<String, WorkflowDefinition>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with `RepositoryError::Connection` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn execution_count(&self) -> usize {
        self.states.len()
    }

    fn check_available(&self) -> Result<(), RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Connection);
        }
        Ok(())
    }
}

impl StateStore for InMemoryStateStore {
    async fn save_state(&self, state: &ExecutionState) -> Result<(), RepositoryError> {
        self.check_available()?;
        self.states.insert(state.execution_id, state.without_checkpoints());
        Ok(())
    }

    async fn load_state(&self, execution_id: &Uuid) -> Result<Option<ExecutionState>, RepositoryError> {
        let Some(mut state) = self.states.get(execution_id).map(|s| s.clone()) else {
            return Ok(None);
        };
        state.checkpoints = self.list_checkpoints(execution_id).await?;
        Ok(Some(state))
    }

    async fn query_stale(
        &self,
        statuses: &[ExecutionStatus],
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, RepositoryError> {
        let mut stale: Vec<(DateTime<Utc>, Uuid)> = self
            .states
            .iter()
            .filter(|s| statuses.contains(&s.status) && s.updated_at < older_than)
            .map(|s| (s.updated_at, s.execution_id))
            .collect();
        stale.sort();
        Ok(stale.into_iter().map(|(_, id)| id).collect())
    }

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        self.check_available()?;
        self.checkpoints
            .entry(checkpoint.execution_id)
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn list_checkpoints(&self, execution_id: &Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        Ok(self
            .checkpoints
            .get(execution_id)
            .map(|c| c.clone())
            .unwrap_or_default())
    }

    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.check_available()?;
        self.definitions.insert(def.id.clone(), def.clone());
        Ok(())
    }

    async fn load_definition(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.get(workflow_id).map(|d| d.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn state_updated(minutes_ago: i64, status: ExecutionStatus) -> ExecutionState {
        let mut state = ExecutionState::new(Uuid::now_v7(), "wf", 3);
        state.status = status;
        state.updated_at = Utc::now() - Duration::minutes(minutes_ago);
        state
    }

    #[tokio::test]
    async fn test_save_and_load_state() {
        let store = InMemoryStateStore::new();
        let state = state_updated(0, ExecutionStatus::Running);
        store.save_state(&state).await.unwrap();

        let loaded = store.load_state(&state.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(store.load_state(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_state_record_excludes_checkpoint_trail() {
        let store = InMemoryStateStore::new();
        let mut state = state_updated(0, ExecutionStatus::Running);
        let checkpoint = Checkpoint {
            id: Uuid::now_v7(),
            execution_id: state.execution_id,
            checkpoint_type: dagflow_types::execution::CheckpointType::ExecutionStarted,
            step_id: None,
            step_index: None,
            data: None,
            context_snapshot: state.snapshot(),
            created_at: Utc::now(),
        };
        store.append_checkpoint(&checkpoint).await.unwrap();
        state.checkpoints.push(checkpoint.clone());
        store.save_state(&state).await.unwrap();

        assert!(store.states.get(&state.execution_id).unwrap().checkpoints.is_empty());
        let loaded = store.load_state(&state.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.checkpoints, vec![checkpoint]);
    }

    #[tokio::test]
    async fn test_query_stale_filters_status_and_age() {
        let store = InMemoryStateStore::new();
        let old_running = state_updated(10, ExecutionStatus::Running);
        let fresh_running = state_updated(1, ExecutionStatus::Running);
        let old_completed = state_updated(10, ExecutionStatus::Completed);
        for s in [&old_running, &fresh_running, &old_completed] {
            store.save_state(s).await.unwrap();
        }

        let stale = store
            .query_stale(
                &[ExecutionStatus::Running, ExecutionStatus::Paused],
                Utc::now() - Duration::minutes(5),
            )
            .await
            .unwrap();
        assert_eq!(stale, vec![old_running.execution_id]);
    }

    #[tokio::test]
    async fn test_unavailable_rejects_writes() {
        let store = InMemoryStateStore::new();
        store.set_unavailable(true);
        let state = state_updated(0, ExecutionStatus::Running);
        assert!(matches!(
            store.save_state(&state).await,
            Err(RepositoryError::Connection)
        ));
        store.set_unavailable(false);
        assert!(store.save_state(&state).await.is_ok());
        assert_eq!(store.execution_count(), 1);
    }
}
