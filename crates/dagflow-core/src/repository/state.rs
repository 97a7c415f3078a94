//! Durable state store trait definition.
//!
//! Defines the storage interface for execution state blobs, the append-only
//! checkpoint log, and the workflow documents executions were started from.
//! The infrastructure layer (dagflow-infra) implements this trait with SQLite
//! persistence; [`super::memory::InMemoryStateStore`] covers tests and
//! embedded use.

use chrono::{DateTime, Utc};
use dagflow_types::error::RepositoryError;
use dagflow_types::execution::{Checkpoint, ExecutionState, ExecutionStatus};
use dagflow_types::workflow::WorkflowDefinition;
use uuid::Uuid;

/// Repository trait for execution persistence.
///
/// Covers three entity families:
/// - **States:** the full serialized `ExecutionState`, one row per execution,
///   overwritten on every checkpoint.
/// - **Checkpoints:** immutable lifecycle records, append-only.
/// - **Definitions:** the workflow document, keyed by workflow ID, so that a
///   fresh process can resume an execution.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StateStore: Send + Sync {
    // -----------------------------------------------------------------------
    // States
    // -----------------------------------------------------------------------

    /// Upsert the state of an execution.
    fn save_state(
        &self,
        state: &ExecutionState,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load the latest persisted state of an execution.
    fn load_state(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionState>, RepositoryError>> + Send;

    /// IDs of executions in one of `statuses` whose last update is older
    /// than `older_than`.
    fn query_stale(
        &self,
        statuses: &[ExecutionStatus],
        older_than: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Append a checkpoint record.
    fn append_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All checkpoints of an execution, oldest first.
    fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a workflow document by its ID.
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow document by its ID.
    fn load_definition(
        &self,
        workflow_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;
}
