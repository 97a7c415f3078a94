//! Execution state types for dagflow.
//!
//! `ExecutionState` is the durable projection of one in-flight run. It is
//! rewritten after every step transition and is what the recovery scanner
//! reloads after a crash. `Checkpoint` records are append-only lifecycle
//! events; once written they are never mutated.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Step Result
// ---------------------------------------------------------------------------

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    /// Completed, failed, skipped and cancelled are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Outcome of running one step (or one loop iteration).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    /// Opaque value consumed by later steps' expressions.
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default)]
    pub retry_count: u32,
}

impl StepResult {
    /// A result for a step that has just begun running.
    pub fn running(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Running,
            output: Value::Null,
            error: None,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration: None,
            retry_count: 0,
        }
    }

    /// A terminal `skipped` result.
    pub fn skipped(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            output: Value::Null,
            error: Some(reason.into()),
            started_at: Some(now),
            completed_at: Some(now),
            duration: Some(0.0),
            retry_count: 0,
        }
    }

    /// Transition to `completed` with the given output.
    ///
    /// No-op when the result is already terminal.
    pub fn complete(mut self, output: Value) -> Self {
        if !self.status.is_terminal() {
            self.status = StepStatus::Completed;
            self.output = output;
            self.finish();
        }
        self
    }

    /// Transition to `failed` with the given error.
    ///
    /// No-op when the result is already terminal.
    pub fn fail(mut self, error: impl Into<String>) -> Self {
        if !self.status.is_terminal() {
            self.status = StepStatus::Failed;
            self.error = Some(error.into());
            self.finish();
        }
        self
    }

    /// Transition to `cancelled`. No-op when already terminal.
    pub fn cancel(mut self) -> Self {
        if !self.status.is_terminal() {
            self.status = StepStatus::Cancelled;
            self.finish();
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Completed
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration = self
            .started_at
            .map(|start| (now - start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0);
    }
}

// ---------------------------------------------------------------------------
// Execution Status
// ---------------------------------------------------------------------------

/// Overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Statuses an interrupted execution can be resumed from.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Running | ExecutionStatus::Paused | ExecutionStatus::Retrying
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Retrying => "retrying",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "paused" => Ok(ExecutionStatus::Paused),
            "retrying" => Ok(ExecutionStatus::Retrying),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Lifecycle event recorded by a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    ExecutionStarted,
    StepQueued,
    StepStarting,
    StepCompleted,
    StepFailed,
    StepRetrying,
    StepSkipped,
    ExecutionPaused,
    ExecutionResumed,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
    VariableUpdated,
    AiConversationState,
}

impl CheckpointType {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointType::ExecutionStarted => "execution_started",
            CheckpointType::StepQueued => "step_queued",
            CheckpointType::StepStarting => "step_starting",
            CheckpointType::StepCompleted => "step_completed",
            CheckpointType::StepFailed => "step_failed",
            CheckpointType::StepRetrying => "step_retrying",
            CheckpointType::StepSkipped => "step_skipped",
            CheckpointType::ExecutionPaused => "execution_paused",
            CheckpointType::ExecutionResumed => "execution_resumed",
            CheckpointType::ExecutionCompleted => "execution_completed",
            CheckpointType::ExecutionFailed => "execution_failed",
            CheckpointType::ExecutionCancelled => "execution_cancelled",
            CheckpointType::VariableUpdated => "variable_updated",
            CheckpointType::AiConversationState => "ai_conversation_state",
        }
    }
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Variables, completed steps and cursor at the moment of a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub current_step_index: usize,
}

/// Immutable, append-only lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// UUIDv7, so checkpoints sort by creation time.
    pub id: Uuid,
    pub execution_id: Uuid,
    pub checkpoint_type: CheckpointType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub context_snapshot: ContextSnapshot,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Execution State
// ---------------------------------------------------------------------------

/// One entry of the execution's error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Durable, resumable snapshot of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// Step results keyed by step ID (including `<step>_iter_<n>` entries).
    #[serde(default)]
    pub steps: BTreeMap<String, StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_payload: Option<Value>,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub failed_steps: Vec<String>,
    #[serde(default)]
    pub skipped_steps: Vec<String>,
    /// Next-step cursor used on resume.
    #[serde(default)]
    pub current_step_index: usize,
    #[serde(default)]
    pub total_steps: usize,
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub error_log: Vec<ErrorLogEntry>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    /// Opaque per-step state returned by stateful task handlers.
    #[serde(default)]
    pub conversation_states: BTreeMap<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionState {
    /// Fresh `pending` state for a new execution.
    pub fn new(execution_id: Uuid, workflow_id: impl Into<String>, total_steps: usize) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            variables: Map::new(),
            steps: BTreeMap::new(),
            trigger_payload: None,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            skipped_steps: Vec::new(),
            current_step_index: 0,
            total_steps,
            retry_counts: BTreeMap::new(),
            error_log: Vec::new(),
            checkpoints: Vec::new(),
            conversation_states: BTreeMap::new(),
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// True when the status is running, paused or retrying.
    pub fn can_resume(&self) -> bool {
        self.status.is_resumable()
    }

    pub fn is_step_completed(&self, step_id: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step_id)
    }

    /// Snapshot of variables, completed steps and cursor.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            variables: self.variables.clone(),
            completed_steps: self.completed_steps.clone(),
            current_step_index: self.current_step_index,
        }
    }

    /// Overwrite variables, completed steps and cursor from a snapshot.
    pub fn restore_snapshot(&mut self, snapshot: &ContextSnapshot) {
        self.variables = snapshot.variables.clone();
        self.completed_steps = snapshot.completed_steps.clone();
        self.current_step_index = snapshot.current_step_index;
    }

    /// Copy of the state with an empty checkpoint trail.
    ///
    /// Stores keep checkpoints in their own append-only log, so the state
    /// record they persist never carries the trail.
    pub fn without_checkpoints(&self) -> Self {
        Self {
            execution_id: self.execution_id,
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            variables: self.variables.clone(),
            steps: self.steps.clone(),
            trigger_payload: self.trigger_payload.clone(),
            completed_steps: self.completed_steps.clone(),
            failed_steps: self.failed_steps.clone(),
            skipped_steps: self.skipped_steps.clone(),
            current_step_index: self.current_step_index,
            total_steps: self.total_steps,
            retry_counts: self.retry_counts.clone(),
            error_log: self.error_log.clone(),
            checkpoints: Vec::new(),
            conversation_states: self.conversation_states.clone(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        }
    }

    /// The most recent error, if any.
    pub fn last_error(&self) -> Option<&ErrorLogEntry> {
        self.error_log.last()
    }

    /// Serialize to a JSON value.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Deserialize from a JSON value.
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_state() -> ExecutionState {
        let execution_id = Uuid::now_v7();
        let mut state = ExecutionState::new(execution_id, "etl", 3);
        state.status = ExecutionStatus::Running;
        state.variables.insert("region".to_string(), json!("eu-west-1"));
        state.trigger_payload = Some(json!({ "source": "cron" }));
        state.steps.insert(
            "fetch".to_string(),
            StepResult::running("fetch").complete(json!({ "rows": 12 })),
        );
        state.completed_steps.push("fetch".to_string());
        state.current_step_index = 1;
        state.retry_counts.insert("fetch".to_string(), 2);
        state.error_log.push(ErrorLogEntry {
            step_id: Some("load".to_string()),
            error: "connection reset".to_string(),
            timestamp: Utc::now(),
        });
        state.conversation_states.insert("chat".to_string(), json!({ "turns": 3 }));
        state.checkpoints.push(Checkpoint {
            id: Uuid::now_v7(),
            execution_id,
            checkpoint_type: CheckpointType::StepCompleted,
            step_id: Some("fetch".to_string()),
            step_index: Some(0),
            data: Some(json!({ "rows": 12 })),
            context_snapshot: state.snapshot(),
            created_at: Utc::now(),
        });
        state
    }

    #[test]
    fn test_execution_state_roundtrip() {
        let state = sample_state();
        let json = state.to_json().unwrap();
        let parsed = ExecutionState::from_json(json).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_without_checkpoints_drops_only_the_trail() {
        let state = sample_state();
        let stored = state.without_checkpoints();
        assert!(stored.checkpoints.is_empty());
        assert_eq!(ExecutionState { checkpoints: state.checkpoints.clone(), ..stored }, state);
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_cursor() {
        let state = sample_state();
        let snapshot = state.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: ContextSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);

        let mut fresh = ExecutionState::new(state.execution_id, "etl", 3);
        fresh.restore_snapshot(&parsed);
        assert_eq!(fresh.completed_steps, vec!["fetch"]);
        assert_eq!(fresh.current_step_index, 1);
        assert_eq!(fresh.variables["region"], json!("eu-west-1"));
    }

    #[test]
    fn test_terminal_step_result_is_immutable() {
        let result = StepResult::running("a").complete(json!(1));
        let after = result.clone().fail("late error");
        assert_eq!(after, result);
        assert_eq!(after.status, StepStatus::Completed);
        assert!(after.duration.is_some());
    }

    #[test]
    fn test_can_resume_statuses() {
        let mut state = ExecutionState::new(Uuid::now_v7(), "wf", 1);
        for (status, expected) in [
            (ExecutionStatus::Pending, false),
            (ExecutionStatus::Running, true),
            (ExecutionStatus::Paused, true),
            (ExecutionStatus::Retrying, true),
            (ExecutionStatus::Completed, false),
            (ExecutionStatus::Failed, false),
            (ExecutionStatus::Cancelled, false),
        ] {
            state.status = status;
            assert_eq!(state.can_resume(), expected, "status {status}");
        }
    }

    #[test]
    fn test_checkpoint_type_serde_names() {
        let json = serde_json::to_string(&CheckpointType::AiConversationState).unwrap();
        assert_eq!(json, "\"ai_conversation_state\"");
        let parsed: CheckpointType = serde_json::from_str("\"step_retrying\"").unwrap();
        assert_eq!(parsed, CheckpointType::StepRetrying);
        assert_eq!(parsed.to_string(), "step_retrying");
    }

    #[test]
    fn test_execution_status_from_str() {
        assert_eq!("paused".parse::<ExecutionStatus>().unwrap(), ExecutionStatus::Paused);
        assert!("crashed".parse::<ExecutionStatus>().is_err());
    }
}
