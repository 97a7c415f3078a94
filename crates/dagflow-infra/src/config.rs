//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.dagflow/` unless
//! `DAGFLOW_DATA_DIR` says otherwise) into [`EngineConfig`]. Falls back to
//! defaults when the file is missing or malformed.

use std::path::{Path, PathBuf};

use dagflow_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "DAGFLOW_DATA_DIR";

/// Resolve the data directory: `DAGFLOW_DATA_DIR`, else `~/.dagflow`.
pub fn data_dir() -> PathBuf {
    match std::env::var_os(DATA_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dagflow"),
    }
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
/// - Otherwise the parsed config, with absent fields at their defaults.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no config.toml found, using defaults");
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to read config, using defaults");
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => sanitize(config),
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to parse config, using defaults");
            EngineConfig::default()
        }
    }
}

/// A zero concurrency limit would stall every execution.
fn sanitize(mut config: EngineConfig) -> EngineConfig {
    if config.max_concurrency == 0 {
        tracing::warn!("max_concurrency = 0 in config.toml, using 1");
        config.max_concurrency = 1;
    }
    config
}
