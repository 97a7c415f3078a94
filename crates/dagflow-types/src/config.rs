//! Engine configuration types for dagflow.
//!
//! `EngineConfig` represents the `config.toml` in the data directory that
//! controls concurrency, timeouts, and recovery behaviour.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.dagflow/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum concurrently running steps per execution.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Timeout applied to delegated steps that declare none.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Safety ceiling for `delay` steps.
    #[serde(default = "default_max_delay_step_secs")]
    pub max_delay_step_secs: u64,

    /// Executions not updated for this long are considered interrupted.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Pause between consecutive recoveries in one scan.
    #[serde(default = "default_recovery_delay_ms")]
    pub recovery_delay_ms: u64,

    /// Upper bound on items processed by a single loop step.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: usize,
}

fn default_max_concurrency() -> usize {
    5
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_max_delay_step_secs() -> u64 {
    300
}

fn default_stale_after_secs() -> u64 {
    300
}

fn default_recovery_delay_ms() -> u64 {
    500
}

fn default_max_loop_iterations() -> usize {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_step_timeout_secs: default_step_timeout_secs(),
            max_delay_step_secs: default_max_delay_step_secs(),
            stale_after_secs: default_stale_after_secs(),
            recovery_delay_ms: default_recovery_delay_ms(),
            max_loop_iterations: default_max_loop_iterations(),
        }
    }
}
