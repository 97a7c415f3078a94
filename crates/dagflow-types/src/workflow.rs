//! Workflow document types for dagflow.
//!
//! A `WorkflowDefinition` is the immutable input to an execution: declared
//! variable defaults plus a list of typed steps. Step `type` is an open string
//! tag; a handful of tags select built-in control flow in the engine and every
//! other tag is delegated to an externally registered task handler.
//!
//! Successors are expressed either as explicit `next` lists or as `depends_on`
//! lists. The engine normalizes `depends_on` into `next` edges before running.

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::retry::StepRetry;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A workflow document: variables plus the steps forming the DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier. Also accepted as `workflow_id`.
    #[serde(alias = "workflow_id")]
    pub id: String,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared variable defaults. Caller-supplied variables override these.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
    /// Step definitions. Order only matters for `current_step_index` reporting.
    pub steps: Vec<StepDefinition>,
    /// Per-workflow concurrency bound (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Whole-execution timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    /// Free-form metadata carried along for hosts and observers.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowDefinition {
    /// Look up a step by ID.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Position of a step in the document, used as its step index.
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Display name, falling back to the workflow ID.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single node in the workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the document.
    pub id: String,
    /// Type tag: a built-in control-flow kind or a registered task type.
    #[serde(rename = "type")]
    pub step_type: String,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Arbitrary configuration. String leaves may contain `{{ ... }}` templates.
    #[serde(default = "empty_object", skip_serializing_if = "is_empty_object")]
    pub config: Value,
    /// Per-step timeout in seconds (delegated calls only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    /// Retry policy: a preset name or explicit parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<StepRetry>,
    /// ID of a fallback step to run when this step fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
    /// Explicit successors.
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<String>,
    /// Predecessors; normalized into the predecessors' `next` lists.
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Guard expression; a falsy result skips the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Condition branches (`{true: [...], false: [...]}`) or parallel branch IDs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches: Option<BranchSpec>,
    /// Condition successors when the expression is truthy.
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub on_true: Vec<String>,
    /// Condition successors when the expression is falsy.
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub on_false: Vec<String>,
    /// Loop collection: an expression string or a literal list.
    #[serde(default, alias = "collection", skip_serializing_if = "Option::is_none")]
    pub items: Option<Value>,
    /// Loop body as a list of step IDs from this document.
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub body_steps: Vec<String>,
    /// Loop body as a single inline step template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Box<StepDefinition>>,
}

impl StepDefinition {
    /// Create a step with the given ID and type and everything else empty.
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            name: None,
            config: empty_object(),
            timeout: None,
            retry: None,
            on_error: None,
            next: Vec::new(),
            depends_on: Vec::new(),
            when: None,
            branches: None,
            on_true: Vec::new(),
            on_false: Vec::new(),
            items: None,
            body_steps: Vec::new(),
            body: None,
        }
    }

    /// Read a key from `config`.
    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    /// Successors taken when a condition step evaluates truthy.
    ///
    /// `branches.true` wins over `on_true` when both are present.
    pub fn true_branch(&self) -> &[String] {
        match &self.branches {
            Some(BranchSpec::Conditional { on_true, .. }) => on_true,
            _ => &self.on_true,
        }
    }

    /// Successors taken when a condition step evaluates falsy.
    pub fn false_branch(&self) -> &[String] {
        match &self.branches {
            Some(BranchSpec::Conditional { on_false, .. }) => on_false,
            _ => &self.on_false,
        }
    }

    /// Branch step IDs of a parallel step.
    pub fn parallel_branches(&self) -> &[String] {
        match &self.branches {
            Some(BranchSpec::Parallel(ids)) => ids,
            _ => &[],
        }
    }
}

/// Branch information attached to a step.
///
/// Condition steps use a map keyed by `true`/`false` (boolean or string keys
/// are both accepted, so YAML `true:` works). Parallel steps use a plain list.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchSpec {
    Conditional {
        on_true: Vec<String>,
        on_false: Vec<String>,
    },
    Parallel(Vec<String>),
}

impl Serialize for BranchSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            BranchSpec::Conditional { on_true, on_false } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("true", on_true)?;
                map.serialize_entry("false", on_false)?;
                map.end()
            }
            BranchSpec::Parallel(ids) => ids.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for BranchSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(BranchSpecVisitor)
    }
}

struct BranchSpecVisitor;

impl<'de> Visitor<'de> for BranchSpecVisitor {
    type Value = BranchSpec;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a list of step IDs or a map with `true`/`false` keys")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut ids = Vec::new();
        while let Some(id) = seq.next_element::<String>()? {
            ids.push(id);
        }
        Ok(BranchSpec::Parallel(ids))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut on_true = Vec::new();
        let mut on_false = Vec::new();
        while let Some(key) = map.next_key::<BranchKey>()? {
            let ids: OneOrMany = map.next_value()?;
            match key {
                BranchKey(true) => on_true = ids.into_vec(),
                BranchKey(false) => on_false = ids.into_vec(),
            }
        }
        Ok(BranchSpec::Conditional { on_true, on_false })
    }
}

/// A `true`/`false` map key given either as a boolean or a string.
struct BranchKey(bool);

impl<'de> Deserialize<'de> for BranchKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyVisitor;

        impl Visitor<'_> for KeyVisitor {
            type Value = BranchKey;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("`true` or `false`")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
                Ok(BranchKey(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                match v.to_ascii_lowercase().as_str() {
                    "true" => Ok(BranchKey(true)),
                    "false" => Ok(BranchKey(false)),
                    other => Err(E::unknown_field(other, &["true", "false"])),
                }
            }
        }

        deserializer.deserialize_any(KeyVisitor)
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

/// Accept a single string, a list of strings, or null.
fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(Option::<OneOrMany>::deserialize(deserializer)?
        .map(OneOrMany::into_vec)
        .unwrap_or_default())
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn is_empty_object(value: &Value) -> bool {
    matches!(value, Value::Object(m) if m.is_empty())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_json_document() {
        let doc = json!({
            "workflow_id": "wf-1",
            "variables": { "threshold": 3 },
            "steps": [
                { "id": "fetch", "type": "http", "config": { "url": "https://example.com" }, "next": "check" },
                {
                    "id": "check",
                    "type": "condition",
                    "config": { "expression": "{{ steps.fetch.status_code == 200 }}" },
                    "branches": { "true": ["ok"], "false": "bad" }
                },
                { "id": "ok", "type": "log" },
                { "id": "bad", "type": "log" }
            ]
        });

        let def: WorkflowDefinition = serde_json::from_value(doc).unwrap();
        assert_eq!(def.id, "wf-1");
        assert_eq!(def.variables["threshold"], json!(3));
        assert_eq!(def.steps[0].next, vec!["check"]);

        let check = def.step("check").unwrap();
        assert_eq!(check.true_branch(), ["ok".to_string()]);
        assert_eq!(check.false_branch(), ["bad".to_string()]);
        assert_eq!(def.step_index("ok"), Some(2));
    }

    #[test]
    fn test_parse_yaml_boolean_branch_keys() {
        let yaml = r#"
id: wf-yaml
steps:
  - id: gate
    type: condition
    config:
      expression: "{{ variables.enabled }}"
    branches:
      true: [run]
      false: [stop]
  - id: run
    type: echo
  - id: stop
    type: log
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        let gate = def.step("gate").unwrap();
        assert_eq!(gate.true_branch(), ["run".to_string()]);
        assert_eq!(gate.false_branch(), ["stop".to_string()]);
    }

    #[test]
    fn test_on_true_on_false_fields() {
        let step: StepDefinition = serde_json::from_value(json!({
            "id": "c",
            "type": "condition",
            "on_true": "yes",
            "on_false": ["no-1", "no-2"]
        }))
        .unwrap();
        assert_eq!(step.true_branch(), ["yes".to_string()]);
        assert_eq!(step.false_branch().len(), 2);
    }

    #[test]
    fn test_parallel_branches_list() {
        let step: StepDefinition = serde_json::from_value(json!({
            "id": "fan-out",
            "type": "parallel",
            "branches": ["a", "b", "c"]
        }))
        .unwrap();
        assert_eq!(step.parallel_branches().len(), 3);
        assert!(step.true_branch().is_empty());
    }

    #[test]
    fn test_loop_with_inline_body_and_collection_alias() {
        let step: StepDefinition = serde_json::from_value(json!({
            "id": "each",
            "type": "foreach",
            "collection": "{{ steps.fetch.items }}",
            "body": { "id": "each-body", "type": "echo", "config": { "value": "{{ item }}" } }
        }))
        .unwrap();
        assert_eq!(step.items, Some(json!("{{ steps.fetch.items }}")));
        assert_eq!(step.body.as_ref().unwrap().step_type, "echo");
    }

    #[test]
    fn test_null_successor_list_is_empty() {
        let step: StepDefinition =
            serde_json::from_value(json!({ "id": "a", "type": "log", "next": null })).unwrap();
        assert!(step.next.is_empty());
        assert_eq!(step.config, json!({}));
    }

    #[test]
    fn test_branch_spec_serde_roundtrip() {
        let mut step = StepDefinition::new("gate", "condition");
        step.branches = Some(BranchSpec::Conditional {
            on_true: vec!["a".to_string()],
            on_false: vec!["b".to_string()],
        });

        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["branches"]["true"], json!(["a"]));

        let parsed: StepDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, step);
    }
}
