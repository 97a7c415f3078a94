//! Workflow execution engine and repository trait definitions for dagflow.
//!
//! This crate defines the engine and the "ports" (store traits) that the
//! infrastructure layer implements. It depends only on `dagflow-types` --
//! never on `dagflow-infra` or any database crate.

pub mod repository;
pub mod workflow;
