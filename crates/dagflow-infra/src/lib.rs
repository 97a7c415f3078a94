//! Infrastructure layer for dagflow.
//!
//! Implements the storage port defined in `dagflow-core` on SQLite and loads
//! the engine configuration from the data directory.

pub mod config;
pub mod sqlite;
