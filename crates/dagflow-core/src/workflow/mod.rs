//! Workflow engine core: definition parsing, DAG execution, durable
//! checkpointing, and crash recovery.
//!
//! - `definition` -- YAML/JSON parsing, validation, file loading
//! - `dag` -- `depends_on` normalization, cycle detection, successors, resume frontier
//! - `context` -- live execution context and the expression namespace
//! - `expression` -- `{{ ... }}` template resolution over JEXL
//! - `retry` -- backoff computation, retry eligibility, presets
//! - `task` -- task handler trait and registry for delegated step types
//! - `step_runner` -- executes one step (built-ins and delegation)
//! - `checkpoint` -- checkpoint manager over the state store
//! - `executor` -- the ready-queue drain loop
//! - `recovery` -- stale execution scan and resume points

pub mod checkpoint;
pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod recovery;
pub mod retry;
pub mod step_runner;
pub mod task;
