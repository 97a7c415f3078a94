//! Task handlers bundled with the CLI.
//!
//! Real deployments register their own handlers when embedding the engine;
//! these exist so that documents can be tried out from the command line.

use dagflow_core::workflow::task::{TaskContext, TaskError, TaskHandler, TaskOutcome, TaskRegistry};
use serde_json::{Value, json};

/// Returns its resolved config as output.
pub struct EchoTask;

impl TaskHandler for EchoTask {
    async fn execute(&self, config: &Value, context: &TaskContext) -> Result<TaskOutcome, TaskError> {
        tracing::info!(step_id = %context.step_id, config = %config, "echo");
        Ok(TaskOutcome::ok(config.clone()))
    }
}

/// Fails with `config.message`; useful for exercising `on_error` and retries.
pub struct FailTask;

impl TaskHandler for FailTask {
    async fn execute(&self, config: &Value, context: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let message = config
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("step failed on purpose");
        tracing::info!(step_id = %context.step_id, attempt = context.attempt, "fail");
        Ok(TaskOutcome {
            output: json!({ "attempt": context.attempt }),
            ..TaskOutcome::failed(message)
        })
    }
}

pub fn builtin_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register("echo", EchoTask);
    registry.register("fail", FailTask);
    registry
}
