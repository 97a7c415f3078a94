//! Application state wiring the engine to its storage.
//!
//! The engine is generic over its `StateStore`; `AppState` pins it to the
//! SQLite implementation in the data directory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use dagflow_core::workflow::executor::WorkflowEngine;
use dagflow_core::workflow::recovery::RecoveryService;
use dagflow_infra::config::{data_dir, load_engine_config};
use dagflow_infra::sqlite::pool::{DatabasePool, database_url};
use dagflow_infra::sqlite::state::SqliteStateStore;
use dagflow_types::config::EngineConfig;

use crate::handlers;

/// Engine pinned to the SQLite store.
pub type ConcreteEngine = WorkflowEngine<SqliteStateStore>;

/// Shared state for CLI commands.
#[derive(Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub store: Arc<SqliteStateStore>,
    pub engine: Arc<ConcreteEngine>,
}

impl AppState {
    /// Resolve the data directory, load `config.toml`, open the database
    /// and build the engine with the built-in task handlers.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let pool = DatabasePool::new(&database_url(&data_dir))
            .await
            .context("Failed to open the dagflow database")?;
        let store = Arc::new(SqliteStateStore::new(pool));

        let engine = WorkflowEngine::new(
            Arc::clone(&store),
            Arc::new(handlers::builtin_registry()),
            config.clone(),
        );

        tracing::debug!(data_dir = %data_dir.display(), "application state initialized");
        Ok(Self {
            data_dir,
            config,
            store,
            engine: Arc::new(engine),
        })
    }

    pub fn recovery(&self) -> RecoveryService<SqliteStateStore> {
        RecoveryService::new(Arc::clone(&self.store), &self.config)
    }
}
