//! Read-only commands: `status`, `list`, `checkpoints`.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use dagflow_core::repository::state::StateStore;
use serde_json::json;

use super::output;
use super::parse_execution_id;
use crate::state::AppState;

pub async fn handle_status(state: &AppState, execution_id: &str, json: bool) -> Result<()> {
    let execution_id = parse_execution_id(execution_id)?;
    let execution = state
        .store
        .load_state(&execution_id)
        .await
        .context("Failed to load execution state")?
        .with_context(|| format!("Execution {execution_id} not found"))?;
    output::print_execution(&execution, json)
}

pub async fn handle_checkpoints(state: &AppState, execution_id: &str, json: bool) -> Result<()> {
    let execution_id = parse_execution_id(execution_id)?;
    let checkpoints = state
        .store
        .list_checkpoints(&execution_id)
        .await
        .context("Failed to list checkpoints")?;
    output::print_checkpoints(&checkpoints, json)
}

pub async fn handle_list(state: &AppState, limit: u32, json: bool) -> Result<()> {
    let executions = state
        .store
        .list_recent(limit)
        .await
        .context("Failed to list executions")?;

    if json {
        let out: Vec<_> = executions
            .iter()
            .map(|e| {
                json!({
                    "execution_id": e.execution_id.to_string(),
                    "workflow_id": e.workflow_id,
                    "status": e.status,
                    "updated_at": e.updated_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!();
        println!("  No executions recorded in {}.", state.data_dir.display());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Execution").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Updated"),
        ]);

    for e in &executions {
        table.add_row(vec![
            Cell::new(e.execution_id),
            Cell::new(&e.workflow_id),
            output::execution_status_cell(e.status),
            Cell::new(e.updated_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}
