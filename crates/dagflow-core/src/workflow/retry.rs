//! Retry strategy library: backoff delays, retry eligibility, and presets.
//!
//! Stateless like the rest of the step plumbing: all logic lives in
//! associated functions on `RetryHandler` that take the strategy as a
//! parameter. `execute_with_retry` is also usable directly by task handlers
//! that want the same backoff behaviour for their own sub-operations.

use std::future::Future;
use std::time::Duration;

use dagflow_types::retry::{ErrorKind, RetryPolicy, RetryStrategy, StepRetry};

/// Message fragments that mark an error as transient.
const TRANSIENT_INDICATORS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "temporary",
    "503",
    "429",
    "502",
    "504",
];

// ---------------------------------------------------------------------------
// RetryableError
// ---------------------------------------------------------------------------

/// An error that can be classified for retry decisions.
pub trait RetryableError {
    /// Structured classification of the failure.
    fn kind(&self) -> ErrorKind;

    /// Human-readable message, scanned for transient indicators.
    fn message(&self) -> String;
}

impl RetryableError for String {
    fn kind(&self) -> ErrorKind {
        classify_message(self)
    }

    fn message(&self) -> String {
        self.clone()
    }
}

/// Best-effort classification of a free-form error message.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        ErrorKind::Timeout
    } else if lower.contains("connection") || lower.contains("connect") {
        ErrorKind::Connection
    } else if lower.contains("429") || lower.contains("rate limit") {
        ErrorKind::RateLimited
    } else if ["502", "503", "504", "unavailable"].iter().any(|s| lower.contains(s)) {
        ErrorKind::ServiceUnavailable
    } else {
        ErrorKind::Unknown
    }
}

// ---------------------------------------------------------------------------
// RetryEvent
// ---------------------------------------------------------------------------

/// Reported to the retry observer before each backoff sleep.
#[derive(Debug)]
pub struct RetryEvent<'a, E> {
    /// 1-based retry number about to be attempted.
    pub attempt: u32,
    /// Backoff that will be slept before the retry.
    pub delay: Duration,
    /// The failure that triggered the retry.
    pub error: &'a E,
}

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry logic for delegated step execution.
pub struct RetryHandler;

impl RetryHandler {
    /// Backoff before retry number `attempt` (1-based).
    ///
    /// fixed: `base`; exponential: `base * 2^(attempt-1)`; linear:
    /// `base * attempt`. Capped at `max_delay`, then jittered by up to
    /// `±jitter_range * delay` and floored at zero.
    pub fn compute_delay(strategy: &RetryStrategy, attempt: u32) -> Duration {
        let n = attempt.max(1);
        let raw = match strategy.policy {
            RetryPolicy::None => 0.0,
            RetryPolicy::Fixed => strategy.base_delay,
            RetryPolicy::Exponential => {
                let exp = i32::try_from(n - 1).unwrap_or(i32::MAX);
                strategy.base_delay * 2f64.powi(exp)
            }
            RetryPolicy::Linear => strategy.base_delay * f64::from(n),
        };
        let mut delay = raw.min(strategy.max_delay);

        if strategy.jitter && delay > 0.0 {
            let amplitude = delay * strategy.jitter_range;
            let offset = (rand::random::<f64>() * 2.0 - 1.0) * amplitude;
            delay += offset;
        }

        Duration::try_from_secs_f64(delay.max(0.0)).unwrap_or_default()
    }

    /// Whether a failure after `attempt` retries should be retried.
    ///
    /// Always false for policy `none` or once `attempt >= max_retries`.
    /// With an allow-list, only listed kinds are retried; otherwise timeout
    /// and connection kinds plus messages with a transient indicator are.
    pub fn should_retry<E: RetryableError + ?Sized>(
        strategy: &RetryStrategy,
        attempt: u32,
        error: &E,
    ) -> bool {
        if strategy.policy == RetryPolicy::None || attempt >= strategy.max_retries {
            return false;
        }

        let kind = error.kind();
        if let Some(allowed) = &strategy.retryable_errors {
            return allowed.contains(&kind);
        }

        if kind.is_transient() {
            return true;
        }

        let message = error.message().to_lowercase();
        TRANSIENT_INDICATORS.iter().any(|ind| message.contains(ind))
    }

    /// Look up a named preset. Hyphens and underscores are interchangeable.
    pub fn preset(name: &str) -> Option<RetryStrategy> {
        let strategy = match name.to_ascii_lowercase().replace('-', "_").as_str() {
            "conservative" => RetryStrategy {
                policy: RetryPolicy::Exponential,
                max_retries: 3,
                base_delay: 2.0,
                max_delay: 30.0,
                jitter: true,
                jitter_range: 0.1,
                retryable_errors: None,
            },
            "aggressive" => RetryStrategy {
                policy: RetryPolicy::Exponential,
                max_retries: 5,
                base_delay: 0.5,
                max_delay: 10.0,
                jitter: true,
                jitter_range: 0.2,
                retryable_errors: None,
            },
            "api_call" => RetryStrategy {
                policy: RetryPolicy::Exponential,
                max_retries: 3,
                base_delay: 1.0,
                max_delay: 60.0,
                jitter: true,
                jitter_range: 0.1,
                retryable_errors: Some(vec![
                    ErrorKind::Timeout,
                    ErrorKind::Connection,
                    ErrorKind::RateLimited,
                    ErrorKind::ServiceUnavailable,
                ]),
            },
            "web_scraping" => RetryStrategy {
                policy: RetryPolicy::Linear,
                max_retries: 3,
                base_delay: 2.0,
                max_delay: 20.0,
                jitter: true,
                jitter_range: 0.25,
                retryable_errors: None,
            },
            "database" => RetryStrategy {
                policy: RetryPolicy::Fixed,
                max_retries: 3,
                base_delay: 0.5,
                max_delay: 5.0,
                jitter: false,
                jitter_range: 0.0,
                retryable_errors: Some(vec![ErrorKind::Timeout, ErrorKind::Connection]),
            },
            "email" => RetryStrategy {
                policy: RetryPolicy::Exponential,
                max_retries: 4,
                base_delay: 5.0,
                max_delay: 300.0,
                jitter: true,
                jitter_range: 0.1,
                retryable_errors: None,
            },
            _ => return None,
        };
        Some(strategy)
    }

    /// Resolve a step's `retry` field into a concrete strategy.
    ///
    /// Missing or unknown presets mean no retries.
    pub fn resolve(retry: Option<&StepRetry>) -> RetryStrategy {
        match retry {
            None => RetryStrategy::none(),
            Some(StepRetry::Strategy(strategy)) => strategy.clone(),
            Some(StepRetry::Preset(name)) => Self::preset(name).unwrap_or_else(|| {
                tracing::warn!(preset = %name, "unknown retry preset, retries disabled");
                RetryStrategy::none()
            }),
        }
    }

    /// Run `operation` until it succeeds or retries are exhausted.
    ///
    /// `operation` receives the 0-based attempt index. Before each backoff
    /// sleep `on_retry` is called with the upcoming retry. Returns the final
    /// result together with the number of retries performed.
    pub async fn execute_with_retry<T, E, F, Fut, O>(
        strategy: &RetryStrategy,
        mut operation: F,
        mut on_retry: O,
    ) -> (Result<T, E>, u32)
    where
        E: RetryableError,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        O: FnMut(RetryEvent<'_, E>),
    {
        let mut attempt = 0u32;
        loop {
            match operation(attempt).await {
                Ok(value) => return (Ok(value), attempt),
                Err(error) => {
                    if !Self::should_retry(strategy, attempt, &error) {
                        return (Err(error), attempt);
                    }

                    let delay = Self::compute_delay(strategy, attempt + 1);
                    tracing::debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error.message(),
                        "retrying after failure"
                    );
                    on_retry(RetryEvent {
                        attempt: attempt + 1,
                        delay,
                        error: &error,
                    });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn exponential(base: f64, max: f64) -> RetryStrategy {
        RetryStrategy {
            policy: RetryPolicy::Exponential,
            max_retries: 5,
            base_delay: base,
            max_delay: max,
            jitter: false,
            jitter_range: 0.1,
            retryable_errors: None,
        }
    }

    #[test]
    fn test_exponential_delays() {
        let strategy = exponential(1.0, 60.0);
        let delays: Vec<f64> = (1..=5)
            .map(|n| RetryHandler::compute_delay(&strategy, n).as_secs_f64())
            .collect();
        assert_eq!(delays, vec![1.0, 2.0, 4.0, 8.0, 16.0]);
    }

    #[test]
    fn test_exponential_capped_at_max_delay() {
        let strategy = exponential(1.0, 10.0);
        for n in 1..=20 {
            let expected = (2f64.powi(n as i32 - 1)).min(10.0);
            assert_eq!(RetryHandler::compute_delay(&strategy, n).as_secs_f64(), expected);
        }
    }

    #[test]
    fn test_fixed_and_linear_delays() {
        let fixed = RetryStrategy {
            policy: RetryPolicy::Fixed,
            base_delay: 3.0,
            ..exponential(0.0, 60.0)
        };
        assert_eq!(RetryHandler::compute_delay(&fixed, 4), Duration::from_secs(3));

        let linear = RetryStrategy {
            policy: RetryPolicy::Linear,
            base_delay: 2.0,
            max_delay: 7.0,
            ..exponential(0.0, 0.0)
        };
        assert_eq!(RetryHandler::compute_delay(&linear, 2), Duration::from_secs(4));
        assert_eq!(RetryHandler::compute_delay(&linear, 5), Duration::from_secs(7));
    }

    #[test]
    fn test_jitter_stays_within_range() {
        let strategy = RetryStrategy {
            jitter: true,
            jitter_range: 0.25,
            ..exponential(1.0, 60.0)
        };
        for n in 1..=6 {
            let nominal = 2f64.powi(n as i32 - 1);
            for _ in 0..50 {
                let d = RetryHandler::compute_delay(&strategy, n).as_secs_f64();
                assert!(d >= nominal * 0.75 - 1e-9 && d <= nominal * 1.25 + 1e-9, "{d} vs {nominal}");
            }
        }
    }

    #[test]
    fn test_jitter_never_negative() {
        let strategy = RetryStrategy {
            jitter: true,
            jitter_range: 3.0,
            ..exponential(1.0, 60.0)
        };
        for _ in 0..100 {
            assert!(RetryHandler::compute_delay(&strategy, 1) >= Duration::ZERO);
        }
    }

    #[test]
    fn test_should_retry_bounds() {
        let strategy = RetryStrategy {
            max_retries: 2,
            ..exponential(1.0, 60.0)
        };
        let err = "connection reset".to_string();
        assert!(RetryHandler::should_retry(&strategy, 0, &err));
        assert!(RetryHandler::should_retry(&strategy, 1, &err));
        assert!(!RetryHandler::should_retry(&strategy, 2, &err));
        assert!(!RetryHandler::should_retry(&strategy, 7, &err));

        let none = RetryStrategy::none();
        assert!(!RetryHandler::should_retry(&none, 0, &err));
    }

    #[test]
    fn test_should_retry_transient_messages() {
        let strategy = exponential(1.0, 60.0);
        for msg in ["HTTP 503", "got 429 from upstream", "temporary failure", "Bad gateway 502", "504"] {
            assert!(RetryHandler::should_retry(&strategy, 0, &msg.to_string()), "{msg}");
        }
        assert!(!RetryHandler::should_retry(&strategy, 0, &"invalid input".to_string()));
    }

    #[test]
    fn test_should_retry_allow_list() {
        let strategy = RetryStrategy {
            retryable_errors: Some(vec![ErrorKind::RateLimited]),
            ..exponential(1.0, 60.0)
        };
        assert!(RetryHandler::should_retry(&strategy, 0, &"429 too many".to_string()));
        assert!(!RetryHandler::should_retry(&strategy, 0, &"connection refused".to_string()));
    }

    #[test]
    fn test_presets() {
        for name in ["conservative", "aggressive", "api-call", "web_scraping", "database", "email"] {
            let preset = RetryHandler::preset(name).unwrap_or_else(|| panic!("missing preset {name}"));
            assert!(preset.max_retries > 0);
        }
        assert!(RetryHandler::preset("reckless").is_none());
    }

    #[test]
    fn test_resolve_step_retry() {
        assert_eq!(RetryHandler::resolve(None), RetryStrategy::none());
        let preset = RetryHandler::resolve(Some(&StepRetry::Preset("database".to_string())));
        assert_eq!(preset.policy, RetryPolicy::Fixed);
        let unknown = RetryHandler::resolve(Some(&StepRetry::Preset("nope".to_string())));
        assert_eq!(unknown.policy, RetryPolicy::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_with_retry_succeeds_after_failures() {
        let strategy = RetryStrategy {
            max_retries: 3,
            ..exponential(1.0, 60.0)
        };
        let mut observed = Vec::new();

        let (result, retries) = RetryHandler::execute_with_retry(
            &strategy,
            |attempt| async move {
                if attempt < 2 {
                    Err("connection refused".to_string())
                } else {
                    Ok(attempt)
                }
            },
            |event| observed.push((event.attempt, event.delay)),
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(retries, 2);
        assert_eq!(
            observed,
            vec![(1, Duration::from_secs(1)), (2, Duration::from_secs(2))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_with_retry_exhausts_and_returns_last_error() {
        let strategy = RetryStrategy {
            max_retries: 2,
            ..exponential(0.5, 60.0)
        };
        let mut calls = 0;

        let (result, retries) = RetryHandler::execute_with_retry(
            &strategy,
            |attempt| {
                calls += 1;
                async move { Err::<(), _>(format!("timeout on attempt {attempt}")) }
            },
            |_| {},
        )
        .await;

        assert_eq!(result.unwrap_err(), "timeout on attempt 2");
        assert_eq!(retries, 2);
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_with_retry_non_transient_fails_fast() {
        let strategy = exponential(1.0, 60.0);
        let (result, retries) = RetryHandler::execute_with_retry(
            &strategy,
            |_| async { Err::<(), _>("validation failed".to_string()) },
            |_| panic!("should not retry"),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(retries, 0);
    }
}
