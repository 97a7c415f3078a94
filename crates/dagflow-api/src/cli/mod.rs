//! CLI command definitions for the `dagflow` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod inspect;
pub mod output;
pub mod recover;
pub mod run;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Run DAG workflows with durable checkpoints.
#[derive(Parser)]
#[command(name = "dagflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for engine events, -vv for everything).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow document (YAML or JSON).
    Run {
        /// Path to the workflow document.
        file: PathBuf,

        /// Variable override as key=value (value parsed as JSON when possible).
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Trigger payload as a JSON string.
        #[arg(long)]
        payload: Option<String>,
    },

    /// Parse and validate a workflow document without running it.
    Validate {
        /// Path to the workflow document.
        file: PathBuf,
    },

    /// Show the state of an execution.
    Status {
        /// Execution UUID.
        execution_id: String,
    },

    /// List recent executions.
    #[command(alias = "ls")]
    List {
        /// Maximum number of executions to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show the checkpoint trail of an execution.
    Checkpoints {
        /// Execution UUID.
        execution_id: String,
    },

    /// Resume a paused or interrupted execution.
    Resume {
        /// Execution UUID.
        execution_id: String,
    },

    /// Cancel a paused or interrupted execution.
    Cancel {
        /// Execution UUID.
        execution_id: String,
    },

    /// Find interrupted executions and optionally resume them.
    Recover {
        /// Override the staleness threshold in seconds.
        #[arg(long)]
        stale_secs: Option<u64>,

        /// Resume every recovered execution in this process.
        #[arg(long)]
        resume: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Parse an execution ID argument.
pub fn parse_execution_id(raw: &str) -> Result<Uuid> {
    raw.trim()
        .parse::<Uuid>()
        .with_context(|| format!("'{raw}' is not a valid execution ID"))
}

/// Parse `--var key=value` pairs. Values that parse as JSON keep their type;
/// anything else is taken as a string.
pub fn parse_vars(raw: &[String]) -> Result<Map<String, Value>> {
    let mut vars = Map::new();
    for pair in raw {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Invalid --var '{pair}', expected KEY=VALUE"))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("Invalid --var '{pair}', key is empty");
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        vars.insert(key.to_string(), value);
    }
    Ok(vars)
}
