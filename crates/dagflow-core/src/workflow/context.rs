//! Live execution context: variables, step results, and loop state.
//!
//! `ExecutionContext` is owned by the engine's drain loop, which is the only
//! writer. Step tasks receive clones (or the JSON namespace built from them)
//! and never mutate shared state directly.

use std::collections::BTreeMap;

use dagflow_types::execution::{ExecutionState, StepResult};
use dagflow_types::workflow::WorkflowDefinition;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::task::TaskContext;

/// Current iteration when running inside a loop body.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopFrame {
    pub index: usize,
    pub item: Value,
}

/// Mutable state of one in-flight execution.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub workflow_id: String,
    /// Declared defaults overlaid with caller-supplied values.
    pub variables: Map<String, Value>,
    /// At most one entry per step ID; loop iterations use `<step>_iter_<n>`.
    pub steps: BTreeMap<String, StepResult>,
    pub trigger_payload: Option<Value>,
    pub loop_frame: Option<LoopFrame>,
    /// Opaque handler state keyed by step ID.
    pub conversation_states: BTreeMap<String, Value>,
    pub metadata: Map<String, Value>,
}

impl ExecutionContext {
    /// Create a context seeded from the workflow's variable defaults.
    pub fn new(
        execution_id: Uuid,
        workflow: &WorkflowDefinition,
        overrides: Map<String, Value>,
        trigger_payload: Option<Value>,
    ) -> Self {
        let mut variables = workflow.variables.clone();
        variables.extend(overrides);

        Self {
            execution_id,
            workflow_id: workflow.id.clone(),
            variables,
            steps: BTreeMap::new(),
            trigger_payload,
            loop_frame: None,
            conversation_states: BTreeMap::new(),
            metadata: Map::new(),
        }
    }

    /// Rebuild the context of an interrupted execution from its durable state.
    pub fn from_state(state: &ExecutionState) -> Self {
        Self {
            execution_id: state.execution_id,
            workflow_id: state.workflow_id.clone(),
            variables: state.variables.clone(),
            steps: state.steps.clone(),
            trigger_payload: state.trigger_payload.clone(),
            loop_frame: None,
            conversation_states: state.conversation_states.clone(),
            metadata: state.metadata.clone(),
        }
    }

    /// Record a step result.
    ///
    /// Returns `false` without changing anything when a terminal result is
    /// already recorded for the same step ID.
    pub fn record_result(&mut self, result: StepResult) -> bool {
        if let Some(existing) = self.steps.get(&result.step_id) {
            if existing.status.is_terminal() {
                tracing::debug!(
                    step_id = %result.step_id,
                    "ignoring result for step that already finished"
                );
                return false;
            }
        }
        self.steps.insert(result.step_id.clone(), result);
        true
    }

    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.steps.get(step_id).map(|r| &r.output)
    }

    /// A copy of this context positioned at one loop iteration.
    pub fn with_loop(&self, index: usize, item: Value) -> Self {
        let mut ctx = self.clone();
        ctx.loop_frame = Some(LoopFrame { index, item });
        ctx
    }

    /// Build the JSON namespace that templates and expressions resolve against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "variables": { ... },
    ///   "steps": { "<id>": { <output fields>, "output": ..., "status": ..., "error": ..., "duration": ... } },
    ///   "trigger": { <payload fields>, "payload": ... },
    ///   "loop": { "index": 0, "item": ... },
    ///   "item": ...,
    ///   "workflow": { "id": "...", "execution_id": "..." }
    /// }
    /// ```
    ///
    /// Output fields are flattened for convenience; the result metadata keys
    /// take precedence over output fields with the same name.
    pub fn namespace(&self) -> Value {
        let mut steps = Map::new();
        for (id, result) in &self.steps {
            let mut entry = match &result.output {
                Value::Object(fields) => fields.clone(),
                _ => Map::new(),
            };
            entry.insert("output".to_string(), result.output.clone());
            entry.insert("status".to_string(), json!(result.status));
            entry.insert("error".to_string(), json!(result.error));
            entry.insert("duration".to_string(), json!(result.duration));
            steps.insert(id.clone(), Value::Object(entry));
        }

        let payload = self.trigger_payload.clone().unwrap_or(Value::Null);
        let mut trigger = match &payload {
            Value::Object(fields) => fields.clone(),
            _ => Map::new(),
        };
        trigger.insert("payload".to_string(), payload);

        let mut ns = Map::new();
        ns.insert("variables".to_string(), Value::Object(self.variables.clone()));
        ns.insert("steps".to_string(), Value::Object(steps));
        ns.insert("trigger".to_string(), Value::Object(trigger));
        ns.insert(
            "workflow".to_string(),
            json!({ "id": self.workflow_id, "execution_id": self.execution_id.to_string() }),
        );
        if let Some(frame) = &self.loop_frame {
            ns.insert(
                "loop".to_string(),
                json!({ "index": frame.index, "item": frame.item }),
            );
            ns.insert("item".to_string(), frame.item.clone());
        }
        Value::Object(ns)
    }

    /// Read-only view for a delegated task handler.
    pub fn task_view(&self, step_id: &str, step_type: &str) -> TaskContext {
        TaskContext {
            execution_id: self.execution_id,
            workflow_id: self.workflow_id.clone(),
            step_id: step_id.to_string(),
            step_type: step_type.to_string(),
            step_outputs: self
                .steps
                .iter()
                .filter(|(_, r)| r.is_success())
                .map(|(id, r)| (id.clone(), r.output.clone()))
                .collect(),
            variables: self.variables.clone(),
            trigger_payload: self.trigger_payload.clone(),
            loop_item: self.loop_frame.as_ref().map(|f| f.item.clone()),
            loop_index: self.loop_frame.as_ref().map(|f| f.index),
            conversation_state: self.conversation_states.get(step_id).cloned(),
            attempt: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
