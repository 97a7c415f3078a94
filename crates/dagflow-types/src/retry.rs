//! Retry strategy values.
//!
//! A `RetryStrategy` is plain data: the delay and eligibility computations
//! live in `dagflow-core::workflow::retry`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Never retry.
    None,
    /// Always wait `base_delay`.
    Fixed,
    /// Wait `base_delay * 2^(attempt - 1)`.
    Exponential,
    /// Wait `base_delay * attempt`.
    Linear,
}

/// Classification of a step failure, used by retry allow-lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Connection,
    RateLimited,
    ServiceUnavailable,
    Handler,
    Validation,
    Expression,
    Cancelled,
    Unknown,
}

impl ErrorKind {
    /// Kinds that are retried without an explicit allow-list.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Connection)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::Handler => "handler",
            ErrorKind::Validation => "validation",
            ErrorKind::Expression => "expression",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Retry parameters for a step.
///
/// Missing fields take the defaults of an exponential strategy with no
/// retries, so `{max_retries: 3}` alone is a usable document entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategy {
    #[serde(default = "default_policy")]
    pub policy: RetryPolicy,
    #[serde(default)]
    pub max_retries: u32,
    /// Seconds.
    #[serde(default = "default_base_delay")]
    pub base_delay: f64,
    /// Seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    #[serde(default)]
    pub jitter: bool,
    /// Fraction of the computed delay used as the jitter amplitude.
    #[serde(default = "default_jitter_range")]
    pub jitter_range: f64,
    /// When set, only these kinds are retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable_errors: Option<Vec<ErrorKind>>,
}

fn default_policy() -> RetryPolicy {
    RetryPolicy::Exponential
}

fn default_base_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    60.0
}

fn default_jitter_range() -> f64 {
    0.1
}

impl RetryStrategy {
    /// A strategy that never retries.
    pub fn none() -> Self {
        Self {
            policy: RetryPolicy::None,
            max_retries: 0,
            base_delay: 0.0,
            max_delay: 0.0,
            jitter: false,
            jitter_range: 0.0,
            retryable_errors: None,
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::none()
    }
}

/// The `retry` field of a step: a preset name or explicit parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepRetry {
    Preset(String),
    Strategy(RetryStrategy),
}
