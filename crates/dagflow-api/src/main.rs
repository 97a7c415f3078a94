//! dagflow CLI entry point.
//!
//! Binary name: `dagflow`
//!
//! Parses CLI arguments, sets up tracing, opens the state database and
//! dispatches to the command handlers.

mod cli;
mod handlers;
mod state;

use clap::Parser;
use clap_complete::generate;
use dagflow_observe::tracing_setup::{TracingOptions, init_tracing_with, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,dagflow_core=debug,dagflow_infra=debug",
        _ => "trace",
    };
    init_tracing_with(TracingOptions {
        default_filter: filter.to_string(),
        enable_otel: cli.otel,
        json: false,
        with_target: false,
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let outcome = dispatch(cli).await;
    shutdown_tracing();
    outcome
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Commands that need no database.
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "dagflow", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return cli::run::handle_validate(file, cli.json),
        _ => {}
    }

    let state = AppState::init().await?;

    match cli.command {
        Commands::Run {
            file,
            vars,
            payload,
        } => cli::run::handle_run(&state, &file, &vars, payload.as_deref(), cli.json).await,
        Commands::Status { execution_id } => {
            cli::inspect::handle_status(&state, &execution_id, cli.json).await
        }
        Commands::List { limit } => cli::inspect::handle_list(&state, limit, cli.json).await,
        Commands::Checkpoints { execution_id } => {
            cli::inspect::handle_checkpoints(&state, &execution_id, cli.json).await
        }
        Commands::Resume { execution_id } => {
            cli::run::handle_resume(&state, &execution_id, cli.json).await
        }
        Commands::Cancel { execution_id } => {
            cli::run::handle_cancel(&state, &execution_id, cli.json).await
        }
        Commands::Recover { stale_secs, resume } => {
            cli::recover::handle_recover(&state, stale_secs, resume, cli.json).await
        }
        Commands::Completions { .. } | Commands::Validate { .. } => Ok(()),
    }
}
