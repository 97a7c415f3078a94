//! `run`, `validate`, `resume` and `cancel`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use console::style;
use dagflow_core::workflow::dag;
use dagflow_core::workflow::definition::{WorkflowError, delegated_step_types, load_workflow_file};
use dagflow_core::workflow::executor::ExecutionResult;
use dagflow_types::execution::ExecutionStatus;
use dagflow_types::workflow::WorkflowDefinition;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::output;
use super::{parse_execution_id, parse_vars};
use crate::handlers;
use crate::state::AppState;

fn load(file: &Path) -> Result<WorkflowDefinition> {
    load_workflow_file(file).map_err(|e| match e {
        WorkflowError::IoError(err) => anyhow!("Failed to read {}: {err}", file.display()),
        WorkflowError::ParseError(msg) => anyhow!("Failed to parse {}: {msg}", file.display()),
        other => anyhow!("Workflow {} is invalid: {other}", file.display()),
    })
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Parse and validate a document; needs no database.
pub fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let def = load(file)?;
    let entries = dag::entry_steps(&dag::normalize(&def));
    let unhandled = unhandled_step_types(&def);

    if json {
        let out = json!({
            "valid": true,
            "workflow_id": def.id,
            "steps": def.steps.len(),
            "entry_steps": entries,
            "unhandled_step_types": unhandled,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Workflow '{}' is valid",
            style("*").green().bold(),
            style(def.display_name()).cyan()
        );
        println!("  Steps: {}", def.steps.len());
        println!("  Entry steps: {}", entries.join(", "));
        if !unhandled.is_empty() {
            println!(
                "  {} no handler in this build for step type(s): {}",
                style("!").yellow().bold(),
                unhandled.join(", ")
            );
        }
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(
    state: &AppState,
    file: &Path,
    vars: &[String],
    payload: Option<&str>,
    json: bool,
) -> Result<()> {
    let def = load(file)?;
    let variables = parse_vars(vars)?;
    let payload = payload
        .map(|raw| serde_json::from_str::<Value>(raw).context("Invalid JSON payload"))
        .transpose()?;

    let execution_id = Uuid::now_v7();
    if !json {
        println!();
        println!(
            "  {} Running '{}' as {}",
            style(">").cyan().bold(),
            style(def.display_name()).cyan(),
            style(execution_id).dim()
        );
    }

    let engine = Arc::clone(&state.engine);
    let task = tokio::spawn(async move {
        engine
            .execute_with_id(execution_id, &def, variables, payload)
            .await
    });
    let result = await_with_interrupt(state, execution_id, task).await?;
    report(&result, json)
}

// ---------------------------------------------------------------------------
// Resume / cancel
// ---------------------------------------------------------------------------

pub async fn handle_resume(state: &AppState, execution_id: &str, json: bool) -> Result<()> {
    let execution_id = parse_execution_id(execution_id)?;
    let engine = Arc::clone(&state.engine);
    let task = tokio::spawn(async move { engine.resume_execution(execution_id).await });
    let result = await_with_interrupt(state, execution_id, task).await?;
    report(&result, json)
}

pub async fn handle_cancel(state: &AppState, execution_id: &str, json: bool) -> Result<()> {
    let execution_id = parse_execution_id(execution_id)?;
    let applied = state
        .engine
        .cancel_execution(execution_id)
        .await
        .with_context(|| format!("Failed to cancel execution {execution_id}"))?;
    output::print_ack(json, "cancel", &execution_id, applied)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Wait for the execution; Ctrl+C requests cooperative cancellation and
/// keeps waiting for the engine to stop at the next step boundary.
async fn await_with_interrupt<E>(
    state: &AppState,
    execution_id: Uuid,
    mut task: JoinHandle<Result<ExecutionResult, E>>,
) -> Result<ExecutionResult>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let joined = tokio::select! {
        joined = &mut task => joined,
        Ok(()) = tokio::signal::ctrl_c() => {
            tracing::warn!(execution_id = %execution_id, "interrupted, cancelling execution");
            state.engine.cancel_execution(execution_id).await?;
            task.await
        }
    };
    joined
        .context("Execution task aborted")?
        .with_context(|| format!("Execution {execution_id} could not run"))
}

/// Delegated step types the bundled registry cannot serve.
fn unhandled_step_types(def: &WorkflowDefinition) -> Vec<String> {
    let registry = handlers::builtin_registry();
    delegated_step_types(def)
        .into_iter()
        .filter(|t| registry.lookup(t).is_none())
        .map(str::to_string)
        .collect()
}

fn report(result: &ExecutionResult, json: bool) -> Result<()> {
    output::print_execution(&result.state, json)?;
    if result.status == ExecutionStatus::Failed {
        bail!(
            "execution {} failed: {}",
            result.execution_id,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagflow_types::workflow::StepDefinition;

    #[test]
    fn test_unhandled_step_types_skip_builtins_and_bundled() {
        let def = WorkflowDefinition {
            id: "wf".to_string(),
            name: None,
            description: None,
            variables: Default::default(),
            steps: vec![
                StepDefinition::new("a", "echo"),
                StepDefinition::new("b", "http"),
                StepDefinition::new("c", "delay"),
                StepDefinition::new("d", "fail"),
            ],
            max_concurrency: None,
            timeout: None,
            metadata: Default::default(),
        };
        assert_eq!(unhandled_step_types(&def), vec!["http"]);
    }
}
