//! Workflow document parsing, validation, and file loading.
//!
//! Converts YAML or JSON documents into the `WorkflowDefinition` IR and checks
//! structural constraints (unique IDs, known references, acyclicity) before a
//! document is ever handed to the engine.

use std::collections::HashSet;
use std::path::Path;

use dagflow_types::workflow::{StepDefinition, WorkflowDefinition};
use thiserror::Error;

use super::dag;

/// Step types the engine runs itself instead of delegating.
pub const BUILTIN_STEP_TYPES: &[&str] = &[
    "condition",
    "foreach",
    "loop",
    "parallel",
    "delay",
    "set_variable",
    "log",
];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating a workflow document.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Successor graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A step references a step ID that does not exist.
    #[error("unknown step reference: {0}")]
    UnknownReference(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Load a workflow document from disk. `.json` files are parsed as JSON,
/// everything else as YAML.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Workflow ID is non-empty and at least one step exists
/// - All step IDs are unique
/// - Every `next`, `depends_on`, branch, `on_error` and loop body reference
///   points to an existing step
/// - Condition steps carry an expression, loop steps carry items and a body
/// - `max_concurrency >= 1` and `timeout > 0` if set
/// - The normalized successor graph is acyclic
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.id.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow id must not be empty".to_string(),
        ));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "step id must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    for step in &def.steps {
        for (field, ref_id) in references(step) {
            if !seen_ids.contains(ref_id) {
                return Err(WorkflowError::UnknownReference(format!(
                    "step '{}' {field} references unknown step '{ref_id}'",
                    step.id
                )));
            }
        }
        validate_step_shape(step)?;
    }

    if let Some(c) = def.max_concurrency {
        if c < 1 {
            return Err(WorkflowError::ValidationError(
                "max_concurrency must be >= 1".to_string(),
            ));
        }
    }

    if let Some(t) = def.timeout {
        if t <= 0.0 {
            return Err(WorkflowError::ValidationError(
                "timeout must be > 0".to_string(),
            ));
        }
    }

    dag::check_acyclic(&dag::normalize(def))
}

/// Every (field, step ID) reference a step makes.
fn references(step: &StepDefinition) -> Vec<(&'static str, &str)> {
    let mut refs: Vec<(&'static str, &str)> = Vec::new();
    refs.extend(step.next.iter().map(|s| ("next", s.as_str())));
    refs.extend(step.depends_on.iter().map(|s| ("depends_on", s.as_str())));
    refs.extend(step.true_branch().iter().map(|s| ("true branch", s.as_str())));
    refs.extend(step.false_branch().iter().map(|s| ("false branch", s.as_str())));
    refs.extend(
        step.parallel_branches()
            .iter()
            .map(|s| ("branches", s.as_str())),
    );
    refs.extend(step.body_steps.iter().map(|s| ("body_steps", s.as_str())));
    if let Some(target) = &step.on_error {
        refs.push(("on_error", target.as_str()));
    }
    refs
}

fn validate_step_shape(step: &StepDefinition) -> Result<(), WorkflowError> {
    match step.step_type.as_str() {
        "condition" => {
            if condition_expression(step).is_none() {
                return Err(WorkflowError::ValidationError(format!(
                    "condition step '{}' has no expression",
                    step.id
                )));
            }
        }
        "foreach" | "loop" => {
            if loop_items(step).is_none() {
                return Err(WorkflowError::ValidationError(format!(
                    "loop step '{}' has no items or collection",
                    step.id
                )));
            }
            if step.body.is_none() && step.body_steps.is_empty() {
                return Err(WorkflowError::ValidationError(format!(
                    "loop step '{}' has neither body nor body_steps",
                    step.id
                )));
            }
            if step.body_steps.iter().any(|id| id == &step.id) {
                return Err(WorkflowError::ValidationError(format!(
                    "loop step '{}' lists itself as a body step",
                    step.id
                )));
            }
        }
        _ => {}
    }

    if let Some(t) = step.timeout {
        if t <= 0.0 {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' timeout must be > 0",
                step.id
            )));
        }
    }

    Ok(())
}

/// The expression of a condition step: `config.expression` or `config.condition`.
pub fn condition_expression(step: &StepDefinition) -> Option<&str> {
    step.config_value("expression")
        .or_else(|| step.config_value("condition"))
        .and_then(|v| v.as_str())
}

/// The items of a loop step: the `items`/`collection` field, or the same keys
/// inside `config`.
pub fn loop_items(step: &StepDefinition) -> Option<&serde_json::Value> {
    step.items
        .as_ref()
        .or_else(|| step.config_value("items"))
        .or_else(|| step.config_value("collection"))
}

/// Step types in the document that must be served by a task handler,
/// sorted and deduplicated. Inline loop bodies are included.
pub fn delegated_step_types(def: &WorkflowDefinition) -> Vec<&str> {
    let mut types: Vec<&str> = def
        .steps
        .iter()
        .flat_map(|step| std::iter::once(step).chain(step.body.as_deref()))
        .map(|step| step.step_type.as_str())
        .filter(|t| !BUILTIN_STEP_TYPES.contains(t))
        .collect();
    types.sort_unstable();
    types.dedup();
    types
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use dagflow_types::workflow::BranchSpec;
    use serde_json::json;

    fn workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".to_string(),
            name: None,
            description: None,
            variables: Default::default(),
            steps,
            max_concurrency: None,
            timeout: None,
            metadata: Default::default(),
        }
    }

    fn step(id: &str, next: &[&str]) -> StepDefinition {
        let mut s = StepDefinition::new(id, "echo");
        s.next = next.iter().map(|n| n.to_string()).collect();
        s
    }

    #[test]
    fn test_delegated_step_types_exclude_builtins() {
        let mut each = StepDefinition::new("each", "foreach");
        each.body = Some(Box::new(StepDefinition::new("each_body", "http")));
        let def = workflow(vec![
            step("a", &[]),
            StepDefinition::new("wait", "delay"),
            each,
            StepDefinition::new("b", "echo"),
            StepDefinition::new("gate", "condition"),
        ]);
        assert_eq!(delegated_step_types(&def), vec!["echo", "http"]);
    }

    #[test]
    fn test_parse_yaml_document() {
        let yaml = r#"
id: etl
variables:
  region: eu
steps:
  - id: fetch
    type: http
    config:
      url: "https://example.com/{{ variables.region }}"
    retry: api_call
    next: transform
  - id: transform
    type: script
    depends_on: [fetch]
    timeout: 30
"#;
        let def = parse_workflow_yaml(yaml).unwrap();
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[1].timeout, Some(30.0));
    }

    #[test]
    fn test_parse_json_document() {
        let json = r#"{"workflow_id": "j", "steps": [{"id": "a", "type": "log"}]}"#;
        let def = parse_workflow_json(json).unwrap();
        assert_eq!(def.id, "j");
    }

    #[test]
    fn test_parse_error() {
        let err = parse_workflow_yaml("steps: [").unwrap_err();
        assert!(matches!(err, WorkflowError::ParseError(_)));
    }

    #[test]
    fn test_validation_rejects_duplicate_step_ids() {
        let def = workflow(vec![step("a", &[]), step("a", &[])]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("duplicate step ID"));
    }

    #[test]
    fn test_validation_rejects_unknown_reference() {
        let def = workflow(vec![step("a", &["ghost"])]);
        assert!(matches!(
            validate_definition(&def).unwrap_err(),
            WorkflowError::UnknownReference(_)
        ));

        let mut cond = StepDefinition::new("c", "condition");
        cond.config = json!({ "expression": "{{ true }}" });
        cond.branches = Some(BranchSpec::Conditional {
            on_true: vec!["a".to_string()],
            on_false: vec!["missing".to_string()],
        });
        let def = workflow(vec![cond, step("a", &[])]);
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_workflow() {
        assert!(validate_definition(&workflow(vec![])).is_err());
    }

    #[test]
    fn test_validation_rejects_cycle() {
        let def = workflow(vec![step("a", &["b"]), step("b", &["a"])]);
        assert!(matches!(
            validate_definition(&def).unwrap_err(),
            WorkflowError::CycleDetected(_)
        ));
    }

    #[test]
    fn test_validation_rejects_cycle_via_depends_on() {
        let mut b = step("b", &[]);
        b.depends_on = vec!["a".to_string()];
        let def = workflow(vec![step("a", &[]), b, step("c", &["b"])]);
        assert!(validate_definition(&def).is_ok());

        let mut a = step("a", &["b"]);
        a.depends_on = vec!["b".to_string()];
        let def = workflow(vec![a, step("b", &[])]);
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_validation_condition_needs_expression() {
        let def = workflow(vec![StepDefinition::new("c", "condition")]);
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_validation_loop_needs_items_and_body() {
        let mut each = StepDefinition::new("each", "foreach");
        each.items = Some(json!([1, 2]));
        let def = workflow(vec![each.clone()]);
        assert!(validate_definition(&def).is_err());

        each.body = Some(Box::new(StepDefinition::new("body", "echo")));
        assert!(validate_definition(&workflow(vec![each])).is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_limits() {
        let mut def = workflow(vec![step("a", &[])]);
        def.max_concurrency = Some(0);
        assert!(validate_definition(&def).is_err());

        let mut def = workflow(vec![step("a", &[])]);
        def.timeout = Some(0.0);
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_load_workflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.json");
        std::fs::write(&path, r#"{"id": "file-wf", "steps": [{"id": "a", "type": "log"}]}"#).unwrap();
        let def = load_workflow_file(&path).unwrap();
        assert_eq!(def.id, "file-wf");

        let yaml_path = dir.path().join("wf.yaml");
        std::fs::write(&yaml_path, serialize_workflow_yaml(&def).unwrap()).unwrap();
        assert_eq!(load_workflow_file(&yaml_path).unwrap(), def);
    }
}
