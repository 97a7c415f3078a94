//! Successor graph: normalization, cycle detection, entry points, and
//! resume frontiers.
//!
//! The engine never walks the graph recursively. Everything here answers
//! local questions ("who comes after this step, given its result?") that the
//! FIFO drain loop asks one step at a time.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use dagflow_types::execution::{StepResult, StepStatus};
use dagflow_types::workflow::{StepDefinition, WorkflowDefinition};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Fold `depends_on` lists into the predecessors' `next` lists.
///
/// Every step named as a dependency gets the dependent appended to its own
/// successors (once). `depends_on` itself is kept so the engine can still
/// wait for all predecessors of a join.
pub fn normalize(def: &WorkflowDefinition) -> WorkflowDefinition {
    let mut normalized = def.clone();
    let index: HashMap<String, usize> = def
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.clone(), i))
        .collect();

    for step in &def.steps {
        for dep in &step.depends_on {
            if let Some(&i) = index.get(dep) {
                let next = &mut normalized.steps[i].next;
                if !next.contains(&step.id) {
                    next.push(step.id.clone());
                }
            }
        }
    }
    normalized
}

/// Every outgoing edge of a step, for reachability and cycle checks.
fn edges(step: &StepDefinition) -> impl Iterator<Item = &str> {
    step.next
        .iter()
        .chain(step.true_branch())
        .chain(step.false_branch())
        .chain(step.parallel_branches())
        .chain(step.body_steps.iter())
        .chain(step.on_error.iter())
        .map(String::as_str)
}

/// Reject successor graphs that contain a cycle.
pub fn check_acyclic(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: HashMap<&str, _> = def
        .steps
        .iter()
        .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
        .collect();

    for step in &def.steps {
        let from = nodes[step.id.as_str()];
        for target in edges(step) {
            let to = nodes.get(target).ok_or_else(|| {
                WorkflowError::UnknownReference(format!(
                    "step '{}' references unknown step '{target}'",
                    step.id
                ))
            })?;
            graph.add_edge(from, *to, ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        WorkflowError::CycleDetected(format!("cycle detected involving step '{node_id}'"))
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Entry points and successors
// ---------------------------------------------------------------------------

/// Steps never listed as anyone's successor, branch, fallback, or loop body,
/// in document order.
pub fn entry_steps(def: &WorkflowDefinition) -> Vec<String> {
    let referenced: HashSet<&str> = def.steps.iter().flat_map(edges).collect();
    def.steps
        .iter()
        .filter(|s| !referenced.contains(s.id.as_str()))
        .map(|s| s.id.clone())
        .collect()
}

/// Successors to enqueue after `step` finished with `result`.
///
/// - condition: the branch named by the `evaluated` flag in its output
/// - parallel: its branches, then `next`
/// - everything else (including loops and skipped steps): `next`
/// - failed: the `on_error` fallback, if any
pub fn successors(step: &StepDefinition, result: &StepResult) -> Vec<String> {
    match result.status {
        StepStatus::Completed => match step.step_type.as_str() {
            "condition" => {
                let taken = result
                    .output
                    .get("evaluated")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if taken {
                    step.true_branch().to_vec()
                } else {
                    step.false_branch().to_vec()
                }
            }
            "parallel" => step
                .parallel_branches()
                .iter()
                .chain(step.next.iter())
                .cloned()
                .collect(),
            _ => step.next.clone(),
        },
        StepStatus::Skipped => step.next.clone(),
        StepStatus::Failed => step.on_error.iter().cloned().collect(),
        StepStatus::Pending | StepStatus::Running | StepStatus::Cancelled => Vec::new(),
    }
}

/// True when every declared `depends_on` predecessor has a terminal result.
pub fn dependencies_met(step: &StepDefinition, results: &BTreeMap<String, StepResult>) -> bool {
    step.depends_on.iter().all(|dep| {
        results
            .get(dep)
            .is_some_and(|r| r.status.is_terminal())
    })
}

// ---------------------------------------------------------------------------
// Resume frontier
// ---------------------------------------------------------------------------

/// Where an interrupted execution picks up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumeFrontier {
    /// Unfinished steps to seed the ready-queue with, in discovery order.
    pub ready: Vec<String>,
    /// Steps already reached (finished ones plus `ready`).
    pub visited: HashSet<String>,
    /// `depends_on` joins reached whose other predecessors have not finished.
    pub waiting: Vec<String>,
}

/// Replay the finished part of the graph to find the unfinished frontier.
///
/// Starting from the entry steps, every step with a terminal result is
/// expanded through [`successors`] exactly as the engine would have done;
/// the first unfinished steps reached on each path form the frontier.
pub fn resume_frontier(
    def: &WorkflowDefinition,
    results: &BTreeMap<String, StepResult>,
) -> ResumeFrontier {
    let by_id: HashMap<&str, &StepDefinition> =
        def.steps.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut frontier = ResumeFrontier::default();
    let mut queue: VecDeque<String> = VecDeque::new();
    for id in entry_steps(def) {
        frontier.visited.insert(id.clone());
        queue.push_back(id);
    }

    while let Some(id) = queue.pop_front() {
        let Some(step) = by_id.get(id.as_str()) else {
            continue;
        };
        match results.get(&id) {
            Some(result) if result.status.is_terminal() => {
                for next in successors(step, result) {
                    let ready = by_id
                        .get(next.as_str())
                        .is_some_and(|s| dependencies_met(s, results));
                    if !ready {
                        if !frontier.waiting.contains(&next) {
                            frontier.waiting.push(next);
                        }
                    } else if frontier.visited.insert(next.clone()) {
                        queue.push_back(next);
                    }
                }
            }
            _ => frontier.ready.push(id),
        }
    }

    frontier.waiting.retain(|id| !frontier.visited.contains(id));
    frontier
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
