//! Shared rendering for execution state: styled tables or JSON.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use dagflow_types::execution::{Checkpoint, ExecutionState, ExecutionStatus, StepStatus};
use serde_json::json;

pub fn execution_status_cell(status: ExecutionStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        ExecutionStatus::Pending => cell.fg(Color::Yellow),
        ExecutionStatus::Running | ExecutionStatus::Retrying => cell.fg(Color::Blue),
        ExecutionStatus::Paused => cell.fg(Color::Magenta),
        ExecutionStatus::Completed => cell.fg(Color::Green),
        ExecutionStatus::Failed => cell.fg(Color::Red),
        ExecutionStatus::Cancelled => cell.fg(Color::DarkYellow),
    }
}

fn step_status_cell(status: StepStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        StepStatus::Pending => cell.fg(Color::Yellow),
        StepStatus::Running => cell.fg(Color::Blue),
        StepStatus::Completed => cell.fg(Color::Green),
        StepStatus::Failed => cell.fg(Color::Red),
        StepStatus::Skipped => cell.fg(Color::DarkGrey),
        StepStatus::Cancelled => cell.fg(Color::DarkYellow),
    }
}

fn styled_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Completed => style(status.as_str()).green().bold().to_string(),
        ExecutionStatus::Failed => style(status.as_str()).red().bold().to_string(),
        ExecutionStatus::Cancelled => style(status.as_str()).yellow().bold().to_string(),
        _ => style(status.as_str()).cyan().bold().to_string(),
    }
}

/// Print an execution's state, with its step results.
pub fn print_execution(state: &ExecutionState, json: bool) -> Result<()> {
    if json {
        let mut value = serde_json::to_value(state)?;
        if let Some(fields) = value.as_object_mut() {
            fields.remove("checkpoints");
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!();
    println!(
        "  Execution {} of '{}': {}",
        style(state.execution_id).dim(),
        style(&state.workflow_id).cyan(),
        styled_status(state.status)
    );
    println!(
        "  Steps: {} completed, {} failed, {} skipped ({} declared)",
        state.completed_steps.len(),
        state.failed_steps.len(),
        state.skipped_steps.len(),
        state.total_steps
    );
    if let Some(done) = state.completed_at {
        let secs = (done - state.created_at).num_milliseconds() as f64 / 1000.0;
        println!("  Duration: {secs:.2}s");
    }

    if !state.steps.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Step").fg(Color::Cyan),
                Cell::new("Status"),
                Cell::new("Duration"),
                Cell::new("Retries"),
                Cell::new("Error"),
            ]);

        let mut results: Vec<_> = state.steps.values().collect();
        results.sort_by_key(|r| r.started_at);
        for r in results {
            table.add_row(vec![
                Cell::new(&r.step_id),
                step_status_cell(r.status),
                Cell::new(
                    r.duration
                        .map(|d| format!("{d:.3}s"))
                        .unwrap_or_else(|| "-".to_string()),
                ),
                Cell::new(r.retry_count),
                Cell::new(r.error.as_deref().unwrap_or("")),
            ]);
        }

        println!();
        println!("{table}");
    }

    if let Some(last) = state.error_log.last() {
        println!();
        println!("  {} {}", style("error:").red().bold(), last.error);
    }
    println!();
    Ok(())
}

/// Print a checkpoint trail.
pub fn print_checkpoints(checkpoints: &[Checkpoint], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(checkpoints)?);
        return Ok(());
    }

    if checkpoints.is_empty() {
        println!();
        println!("  No checkpoints recorded.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Time"),
            Cell::new("Type"),
            Cell::new("Step"),
            Cell::new("Completed"),
        ]);

    for (i, c) in checkpoints.iter().enumerate() {
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(c.created_at.format("%H:%M:%S%.3f").to_string()),
            Cell::new(c.checkpoint_type.as_str()),
            Cell::new(c.step_id.as_deref().unwrap_or("-")),
            Cell::new(c.context_snapshot.completed_steps.len()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

/// One-line JSON or styled acknowledgement for control commands.
pub fn print_ack(json: bool, action: &str, execution_id: &uuid::Uuid, applied: bool) -> Result<()> {
    if json {
        let out = json!({
            "execution_id": execution_id.to_string(),
            "action": action,
            "applied": applied,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if applied {
        println!();
        println!("  {} {action}: {execution_id}", style("*").green().bold());
        println!();
    } else {
        println!();
        println!(
            "  {} nothing to {action} for {execution_id}",
            style("!").yellow().bold()
        );
        println!();
    }
    Ok(())
}
