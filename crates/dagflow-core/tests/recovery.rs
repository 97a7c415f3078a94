//! Crash recovery feeding resume points back into the engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dagflow_core::repository::{InMemoryStateStore, StateStore};
use dagflow_core::workflow::executor::WorkflowEngine;
use dagflow_core::workflow::recovery::RecoveryService;
use dagflow_core::workflow::task::{FnTask, TaskContext, TaskError, TaskOutcome, TaskRegistry};
use dagflow_types::config::EngineConfig;
use dagflow_types::execution::{CheckpointType, ExecutionState, ExecutionStatus, StepResult};
use dagflow_types::workflow::{StepDefinition, WorkflowDefinition};
use serde_json::{Map, Value, json};
use uuid::Uuid;

fn pipeline() -> WorkflowDefinition {
    let mut extract = StepDefinition::new("extract", "count");
    extract.next = vec!["load".to_string()];
    let mut load = StepDefinition::new("load", "count");
    load.config = json!({ "rows": "{{ steps.extract.rows }}" });
    WorkflowDefinition {
        id: "etl".to_string(),
        name: Some("Nightly ETL".to_string()),
        description: None,
        variables: Map::new(),
        steps: vec![extract, load],
        max_concurrency: None,
        timeout: None,
        metadata: Default::default(),
    }
}

fn counting_registry(runs: &Arc<AtomicUsize>) -> TaskRegistry {
    let runs = runs.clone();
    let mut registry = TaskRegistry::new();
    registry.register(
        "count",
        FnTask(move |config: Value, _ctx: TaskContext| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TaskError>(TaskOutcome::ok(config))
            }
        }),
    );
    registry
}

/// An execution that stopped after `extract`, last touched `minutes_ago`.
async fn interrupted(store: &InMemoryStateStore, minutes_ago: i64) -> ExecutionState {
    let mut state = ExecutionState::new(Uuid::now_v7(), "etl", 2);
    state.status = ExecutionStatus::Running;
    state.steps.insert(
        "extract".to_string(),
        StepResult::running("extract").complete(json!({ "rows": 128 })),
    );
    state.steps.insert("load".to_string(), StepResult::running("load"));
    state.completed_steps.push("extract".to_string());
    state.current_step_index = 1;
    state.updated_at = Utc::now() - chrono::Duration::minutes(minutes_ago);
    store.save_state(&state).await.unwrap();
    state
}

#[tokio::test]
async fn test_recovered_execution_runs_to_completion() {
    let store = Arc::new(InMemoryStateStore::new());
    store.save_definition(&pipeline()).await.unwrap();
    let stale = interrupted(&store, 10).await;
    let fresh = interrupted(&store, 1).await;

    let config = EngineConfig::default();
    let recovery = RecoveryService::new(store.clone(), &config).with_recovery_delay(Duration::ZERO);
    let report = recovery.recover_all().await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.recovered, 1);
    let point = report.resume_points.into_iter().next().unwrap();
    assert_eq!(point.execution_id, stale.execution_id);
    assert_eq!(point.resume_from, vec!["load"]);

    let runs = Arc::new(AtomicUsize::new(0));
    let engine = WorkflowEngine::new(store.clone(), Arc::new(counting_registry(&runs)), config);
    let result = engine.resume(point).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(result.context.steps["load"].output["rows"], json!(128));

    let trail = store.list_checkpoints(&stale.execution_id).await.unwrap();
    let resumed: Vec<_> = trail
        .iter()
        .filter(|c| c.checkpoint_type == CheckpointType::ExecutionResumed)
        .collect();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].data.as_ref().unwrap()["recovered"], json!(true));

    let untouched = store.load_state(&fresh.execution_id).await.unwrap().unwrap();
    assert_eq!(untouched.status, ExecutionStatus::Running);
}

#[tokio::test]
async fn test_finished_executions_are_not_recovered() {
    let store = Arc::new(InMemoryStateStore::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let engine = WorkflowEngine::new(
        store.clone(),
        Arc::new(counting_registry(&runs)),
        EngineConfig::default(),
    );
    let result = engine.execute(&pipeline(), Map::new(), None).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);

    let recovery = RecoveryService::new(store.clone(), &EngineConfig::default())
        .with_stale_after(Duration::ZERO)
        .with_recovery_delay(Duration::ZERO);
    let report = recovery.recover_all().await.unwrap();
    assert_eq!(report.scanned, 0);
    assert!(report.resume_points.is_empty());
}

#[tokio::test]
async fn test_missing_definition_is_reported() {
    let store = Arc::new(InMemoryStateStore::new());
    let orphan = interrupted(&store, 30).await;

    let recovery = RecoveryService::new(store.clone(), &EngineConfig::default())
        .with_recovery_delay(Duration::ZERO);
    let report = recovery.recover_all().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].execution_id, orphan.execution_id);
    assert!(report.failures[0].reason.contains("etl"));
}

#[tokio::test]
async fn test_resumed_unhandled_failure_fails_execution() {
    let store = Arc::new(InMemoryStateStore::new());
    store.save_definition(&pipeline()).await.unwrap();

    let mut state = ExecutionState::new(Uuid::now_v7(), "etl", 2);
    state.status = ExecutionStatus::Running;
    state.steps.insert(
        "extract".to_string(),
        StepResult::running("extract").fail("source unreachable"),
    );
    state.failed_steps.push("extract".to_string());
    store.save_state(&state).await.unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let engine = WorkflowEngine::new(
        store.clone(),
        Arc::new(counting_registry(&runs)),
        EngineConfig::default(),
    );
    let result = engine.resume_execution(state.execution_id).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    let error = result.error.unwrap();
    assert!(error.contains("extract"));
    assert!(error.contains("source unreachable"));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(!result.context.steps.contains_key("load"));

    let stored = store.load_state(&state.execution_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_resumed_failure_with_fallback_takes_fallback() {
    let mut def = pipeline();
    def.steps[0].on_error = Some("cleanup".to_string());
    def.steps.push(StepDefinition::new("cleanup", "count"));
    let store = Arc::new(InMemoryStateStore::new());
    store.save_definition(&def).await.unwrap();

    let mut state = ExecutionState::new(Uuid::now_v7(), "etl", 3);
    state.status = ExecutionStatus::Running;
    state.steps.insert(
        "extract".to_string(),
        StepResult::running("extract").fail("source unreachable"),
    );
    store.save_state(&state).await.unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let engine = WorkflowEngine::new(
        store.clone(),
        Arc::new(counting_registry(&runs)),
        EngineConfig::default(),
    );
    let result = engine.resume_execution(state.execution_id).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(result.context.steps.contains_key("cleanup"));
    assert!(!result.context.steps.contains_key("load"));
}
