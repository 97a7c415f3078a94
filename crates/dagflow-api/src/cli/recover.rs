//! `recover`: scan for interrupted executions, optionally resume them.

use std::time::Duration;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::json;

use super::output;
use crate::state::AppState;

pub async fn handle_recover(
    state: &AppState,
    stale_secs: Option<u64>,
    resume: bool,
    json: bool,
) -> Result<()> {
    let mut recovery = state.recovery();
    if let Some(secs) = stale_secs {
        recovery = recovery.with_stale_after(Duration::from_secs(secs));
    }
    let report = recovery
        .recover_all()
        .await
        .context("Recovery scan failed")?;

    let mut resumed = Vec::new();
    if resume {
        for point in report.resume_points.iter().cloned() {
            let execution_id = point.execution_id;
            match state.engine.resume(point).await {
                Ok(result) => resumed.push((execution_id, Ok(result.status))),
                Err(e) => {
                    tracing::warn!(execution_id = %execution_id, error = %e, "resume after recovery failed");
                    resumed.push((execution_id, Err(e.to_string())));
                }
            }
        }
    }

    if json {
        let resumed: Vec<_> = resumed
            .iter()
            .map(|(id, outcome)| match outcome {
                Ok(status) => json!({ "execution_id": id.to_string(), "status": status }),
                Err(e) => json!({ "execution_id": id.to_string(), "error": e }),
            })
            .collect();
        let out = json!({ "report": report, "resumed": resumed });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Scanned {} interrupted execution(s): {} recovered, {} failed",
        style("*").cyan().bold(),
        report.scanned,
        style(report.recovered).green(),
        style(report.failed).red()
    );

    if !report.resume_points.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Execution").fg(Color::Cyan),
                Cell::new("Workflow"),
                Cell::new("Resume from"),
                Cell::new("Result"),
            ]);

        for point in &report.resume_points {
            let result = match resumed.iter().find(|(id, _)| *id == point.execution_id) {
                Some((_, Ok(status))) => output::execution_status_cell(*status),
                Some((_, Err(e))) => Cell::new(e).fg(Color::Red),
                None => Cell::new("pending resume").fg(Color::DarkGrey),
            };
            table.add_row(vec![
                Cell::new(point.execution_id),
                Cell::new(&point.workflow_id),
                Cell::new(point.resume_from.join(", ")),
                result,
            ]);
        }
        println!();
        println!("{table}");
    }

    for failure in &report.failures {
        println!(
            "  {} {}: {}",
            style("!").yellow().bold(),
            failure.execution_id,
            failure.reason
        );
    }
    if !resume && report.recovered > 0 {
        println!();
        println!(
            "  Run {} to continue them here.",
            style("dagflow recover --resume").bold()
        );
    }
    println!();
    Ok(())
}
