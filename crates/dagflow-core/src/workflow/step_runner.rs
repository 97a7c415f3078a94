//! Step executor: runs one step definition against a context snapshot.
//!
//! Built-in control-flow types (`condition`, `foreach`/`loop`, `parallel`,
//! `delay`, `set_variable`, `log`) are handled here directly. Every other type
//! is delegated to the handler registered for it in the `TaskRegistry`,
//! wrapped in the step timeout and its retry strategy.
//!
//! The runner never writes checkpoints and never touches the live context:
//! it returns a `StepOutcome` and the engine's drain loop applies it.

use std::sync::Arc;
use std::time::Duration;

use dagflow_types::config::EngineConfig;
use dagflow_types::execution::StepResult;
use dagflow_types::retry::ErrorKind;
use dagflow_types::workflow::{StepDefinition, WorkflowDefinition};
use serde_json::{Map, Value, json};

use super::context::ExecutionContext;
use super::definition::{condition_expression, loop_items};
use super::expression::ExpressionEvaluator;
use super::retry::{RetryHandler, RetryableError};
use super::task::{TaskError, TaskRegistry};

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Everything a step produced, for the engine to apply.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Terminal result of the step itself.
    pub result: StepResult,
    /// Variable writes (from `set_variable`, including inside loop bodies).
    pub variables: Map<String, Value>,
    /// Per-iteration results of loop bodies, keyed `<step>_iter_<n>`.
    pub iterations: Vec<StepResult>,
    /// Opaque state returned by a stateful task handler.
    pub conversation_state: Option<Value>,
}

impl StepOutcome {
    fn from_result(result: StepResult) -> Self {
        Self {
            result,
            variables: Map::new(),
            iterations: Vec::new(),
            conversation_state: None,
        }
    }
}

/// Reported before each retry sleep of a delegated step.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryNotice {
    pub step_id: String,
    pub attempt: u32,
    pub delay: Duration,
    pub error: String,
}

/// Callback invoked with each [`RetryNotice`].
pub type RetryObserver = dyn Fn(RetryNotice) + Send + Sync;

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes individual steps by dispatching on their type tag.
pub struct StepRunner {
    registry: Arc<TaskRegistry>,
    evaluator: Arc<ExpressionEvaluator>,
    config: EngineConfig,
}

impl StepRunner {
    pub fn new(
        registry: Arc<TaskRegistry>,
        evaluator: Arc<ExpressionEvaluator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            evaluator,
            config,
        }
    }

    /// Evaluate a step's `when` guard. Steps without one always run.
    pub fn guard_allows(&self, step: &StepDefinition, ctx: &ExecutionContext) -> bool {
        match &step.when {
            Some(expr) => self.evaluator.evaluate_condition(expr, &ctx.namespace()),
            None => true,
        }
    }

    /// Run a step and return its outcome. Never fails: errors are reported
    /// as a `failed` result.
    pub async fn execute_step(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        workflow: &WorkflowDefinition,
        on_retry: &RetryObserver,
    ) -> StepOutcome {
        let started = StepResult::running(step.id.clone());

        match step.step_type.as_str() {
            "condition" => StepOutcome::from_result(self.run_condition(step, ctx, started)),
            "foreach" | "loop" => self.run_loop(step, ctx, workflow, on_retry, started).await,
            "parallel" => {
                let output = json!({ "branches": step.parallel_branches() });
                StepOutcome::from_result(started.complete(output))
            }
            "delay" => StepOutcome::from_result(self.run_delay(step, ctx, started).await),
            "set_variable" => self.run_set_variable(step, ctx, started),
            "log" => StepOutcome::from_result(self.run_log(step, ctx, started)),
            _ => self.run_delegated(step, ctx, on_retry, started).await,
        }
    }

    // -----------------------------------------------------------------------
    // Built-ins
    // -----------------------------------------------------------------------

    fn run_condition(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        started: StepResult,
    ) -> StepResult {
        let Some(expression) = condition_expression(step) else {
            return started.fail(format!("condition step '{}' has no expression", step.id));
        };

        let evaluated = self
            .evaluator
            .evaluate_condition(expression, &ctx.namespace());
        tracing::debug!(step_id = %step.id, expression, evaluated, "condition evaluated");

        started.complete(json!({
            "branch": if evaluated { "true" } else { "false" },
            "evaluated": evaluated,
            "expression": expression,
            "on_true": step.true_branch(),
            "on_false": step.false_branch(),
        }))
    }

    async fn run_delay(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        started: StepResult,
    ) -> StepResult {
        let config = self.evaluator.resolve_config(&step.config, &ctx.namespace());
        let requested = ["seconds", "duration", "delay"]
            .iter()
            .find_map(|key| config.get(*key).and_then(as_seconds))
            .unwrap_or(0.0);

        let ceiling = self.config.max_delay_step_secs as f64;
        let seconds = if requested > ceiling {
            tracing::warn!(step_id = %step.id, requested, ceiling, "delay capped at safety ceiling");
            ceiling
        } else {
            requested.max(0.0)
        };

        tokio::time::sleep(Duration::try_from_secs_f64(seconds).unwrap_or_default()).await;
        started.complete(json!({ "delayed": seconds, "requested": requested }))
    }

    fn run_set_variable(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        started: StepResult,
    ) -> StepOutcome {
        let config = self.evaluator.resolve_config(&step.config, &ctx.namespace());

        let updates: Map<String, Value> = match (&config["name"], &config["variables"]) {
            (Value::String(name), _) => {
                let mut m = Map::new();
                m.insert(name.clone(), config["value"].clone());
                m
            }
            (_, Value::Object(vars)) => vars.clone(),
            _ => match config {
                Value::Object(m) => m,
                _ => Map::new(),
            },
        };

        if updates.is_empty() {
            return StepOutcome::from_result(
                started.fail(format!("set_variable step '{}' sets nothing", step.id)),
            );
        }

        StepOutcome {
            result: started.complete(json!({ "updated": updates })),
            variables: updates,
            iterations: Vec::new(),
            conversation_state: None,
        }
    }

    fn run_log(&self, step: &StepDefinition, ctx: &ExecutionContext, started: StepResult) -> StepResult {
        let config = self.evaluator.resolve_config(&step.config, &ctx.namespace());
        let message = config
            .get("message")
            .map(super::expression::value_to_string)
            .unwrap_or_default();
        let level = config.get("level").and_then(|v| v.as_str()).unwrap_or("info");

        match level {
            "error" => tracing::error!(step_id = %step.id, execution_id = %ctx.execution_id, "{message}"),
            "warn" | "warning" => tracing::warn!(step_id = %step.id, execution_id = %ctx.execution_id, "{message}"),
            "debug" => tracing::debug!(step_id = %step.id, execution_id = %ctx.execution_id, "{message}"),
            _ => tracing::info!(step_id = %step.id, execution_id = %ctx.execution_id, "{message}"),
        }

        started.complete(json!({ "message": message, "level": level }))
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    async fn run_loop(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        workflow: &WorkflowDefinition,
        on_retry: &RetryObserver,
        started: StepResult,
    ) -> StepOutcome {
        let items = match self.resolve_items(step, ctx) {
            Ok(items) => items,
            Err(message) => return StepOutcome::from_result(started.fail(message)),
        };

        if items.is_empty() {
            return StepOutcome::from_result(started.complete(json!({
                "iterations_completed": 0,
                "total_items": 0,
                "results": [],
                "errors": [],
            })));
        }

        let total_items = items.len();
        let items: Vec<Value> = if total_items > self.config.max_loop_iterations {
            tracing::warn!(
                step_id = %step.id,
                total_items,
                max = self.config.max_loop_iterations,
                "loop items truncated to iteration cap"
            );
            items.into_iter().take(self.config.max_loop_iterations).collect()
        } else {
            items
        };

        let stop_on_error = loop_error_mode(step) == "stop";
        let pause = step
            .config_value("iteration_delay")
            .and_then(as_seconds)
            .map(|s| s.min(self.config.max_delay_step_secs as f64))
            .and_then(|s| Duration::try_from_secs_f64(s).ok());

        let mut variables = Map::new();
        let mut iterations = Vec::new();
        let mut results = Vec::new();
        let mut errors = Vec::new();
        let mut completed = 0usize;

        for (index, item) in items.into_iter().enumerate() {
            if index > 0 {
                if let Some(pause) = pause {
                    tokio::time::sleep(pause).await;
                }
            }

            let mut iter_ctx = ctx.with_loop(index, item);
            iter_ctx.variables.extend(variables.clone());

            let iteration = self
                .run_iteration(step, &mut iter_ctx, workflow, on_retry, index)
                .await;

            variables.extend(iteration.variables);
            iterations.extend(iteration.results);
            match iteration.error {
                None => {
                    completed += 1;
                    results.push(iteration.output);
                }
                Some(error) => {
                    errors.push(json!({ "index": index, "error": error }));
                    results.push(Value::Null);
                    if stop_on_error {
                        tracing::debug!(step_id = %step.id, index, "loop stopped on first failure");
                        break;
                    }
                }
            }
        }

        let output = json!({
            "iterations_completed": completed,
            "total_items": total_items,
            "results": results,
            "errors": errors,
        });

        let result = if stop_on_error && !errors.is_empty() {
            let mut failed = started.fail(format!(
                "loop '{}' aborted: {}",
                step.id,
                errors[0]["error"].as_str().unwrap_or("iteration failed")
            ));
            failed.output = output;
            failed
        } else {
            started.complete(output)
        };

        StepOutcome {
            result,
            variables,
            iterations,
            conversation_state: None,
        }
    }

    /// Run one loop iteration: the inline body, or each named body step in
    /// order. Body results are visible to later body steps of the same
    /// iteration under their own IDs.
    async fn run_iteration(
        &self,
        step: &StepDefinition,
        iter_ctx: &mut ExecutionContext,
        workflow: &WorkflowDefinition,
        on_retry: &RetryObserver,
        index: usize,
    ) -> IterationOutcome {
        let body: Vec<StepDefinition> = match &step.body {
            Some(template) => {
                let mut body = (**template).clone();
                body.id = format!("{}_iter_{index}", step.id);
                vec![body]
            }
            None => step
                .body_steps
                .iter()
                .filter_map(|id| workflow.step(id).cloned())
                .collect(),
        };

        let mut outcome = IterationOutcome::default();
        for body_step in body {
            let original_id = body_step.id.clone();
            let synthetic_id = if step.body.is_some() {
                original_id.clone()
            } else {
                format!("{original_id}_iter_{index}")
            };

            if !self.guard_allows(&body_step, iter_ctx) {
                let skipped = StepResult::skipped(synthetic_id, "when guard evaluated false");
                iter_ctx.steps.insert(original_id, skipped.clone());
                outcome.results.push(skipped);
                continue;
            }

            let body_outcome =
                Box::pin(self.execute_step(&body_step, iter_ctx, workflow, on_retry)).await;

            iter_ctx.variables.extend(body_outcome.variables.clone());
            outcome.variables.extend(body_outcome.variables);
            outcome.results.extend(body_outcome.iterations);

            let mut result = body_outcome.result;
            iter_ctx.steps.insert(original_id, result.clone());
            result.step_id = synthetic_id;
            outcome.output = result.output.clone();

            let failed = result.error.clone().filter(|_| !result.is_success());
            outcome.results.push(result);
            if let Some(error) = failed {
                outcome.error = Some(error);
                break;
            }
        }
        outcome
    }

    fn resolve_items(&self, step: &StepDefinition, ctx: &ExecutionContext) -> Result<Vec<Value>, String> {
        let Some(spec) = loop_items(step) else {
            return Err(format!("loop step '{}' has no items", step.id));
        };

        let ns = ctx.namespace();
        let resolved = match spec {
            Value::String(expr) if !expr.contains("{{") => self
                .evaluator
                .resolve_inner(expr, &ns)
                .map_err(|e| format!("loop step '{}' items: {e}", step.id))?,
            other => self.evaluator.resolve_config(other, &ns),
        };

        match resolved {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            other => Err(format!(
                "loop step '{}' items did not resolve to a list (got {other})",
                step.id
            )),
        }
    }

    // -----------------------------------------------------------------------
    // Delegation
    // -----------------------------------------------------------------------

    async fn run_delegated(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        on_retry: &RetryObserver,
        started: StepResult,
    ) -> StepOutcome {
        let Some(handler) = self.registry.lookup(&step.step_type) else {
            return StepOutcome::from_result(started.fail(format!(
                "no task handler registered for step type '{}'",
                step.step_type
            )));
        };

        let config = self.evaluator.resolve_config(&step.config, &ctx.namespace());
        let strategy = RetryHandler::resolve(step.retry.as_ref());
        let timeout_secs = step
            .timeout
            .unwrap_or(self.config.default_step_timeout_secs as f64);
        let timeout = Duration::try_from_secs_f64(timeout_secs).unwrap_or(Duration::MAX);
        let view = ctx.task_view(&step.id, &step.step_type);

        let (result, retries) = RetryHandler::execute_with_retry(
            &strategy,
            |attempt| {
                let mut view = view.clone();
                view.attempt = attempt;
                let config = &config;
                async move {
                    match tokio::time::timeout(timeout, handler.execute(config, &view)).await {
                        Err(_) => Err(TaskError::timeout(&step.id, timeout_secs)),
                        Ok(Err(e)) => Err(e),
                        Ok(Ok(outcome)) if !outcome.success => Err(TaskError::from_message(
                            outcome
                                .error
                                .unwrap_or_else(|| "task reported failure".to_string()),
                        )),
                        Ok(Ok(outcome)) => Ok(outcome),
                    }
                }
            },
            |event| {
                on_retry(RetryNotice {
                    step_id: step.id.clone(),
                    attempt: event.attempt,
                    delay: event.delay,
                    error: event.error.message(),
                })
            },
        )
        .await;

        match result {
            Ok(outcome) => {
                let mut done = started.complete(outcome.output);
                done.retry_count = retries;
                StepOutcome {
                    result: done,
                    variables: Map::new(),
                    iterations: Vec::new(),
                    conversation_state: outcome.conversation_state,
                }
            }
            Err(error) => {
                if error.kind == ErrorKind::Timeout {
                    tracing::warn!(step_id = %step.id, timeout_secs, "step timed out");
                }
                let mut failed = started.fail(error.message);
                failed.retry_count = retries;
                StepOutcome::from_result(failed)
            }
        }
    }
}

#[derive(Debug, Default)]
struct IterationOutcome {
    output: Value,
    error: Option<String>,
    variables: Map<String, Value>,
    results: Vec<StepResult>,
}

/// `stop` or `continue`, from the loop's `config.on_error`. The step-level
/// `on_error` field stays a fallback step reference.
pub fn loop_error_mode(step: &StepDefinition) -> &str {
    step.config_value("on_error")
        .and_then(|v| v.as_str())
        .filter(|mode| *mode == "stop" || *mode == "continue")
        .unwrap_or("continue")
}

fn as_seconds(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
