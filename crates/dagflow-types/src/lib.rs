//! Shared domain types for dagflow.
//!
//! This crate contains the domain types used across the dagflow workspace:
//! workflow documents, step results, execution state, checkpoints, retry
//! strategy values, engine configuration, and repository errors.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod execution;
pub mod retry;
pub mod workflow;
