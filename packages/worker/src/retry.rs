//! Bounded retry with exponential backoff and jitter.
//!
//! Centralizes error classification and backoff math so call sites do not
//! duplicate fragile heuristics. Jitter spreads retries out across worker
//! processes hitting the same external system at the same time.
//!
//! Two retry layers exist in this worker and must not be confused:
//! - operation-level retry (this module): re-runs a single call, e.g. one
//!   portal request, with exponential backoff inside one job attempt;
//! - job-level retry (dispatcher): re-runs a whole processor invocation
//!   after a fixed delay, bounded by the job row's `max_attempts`.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::Config;

/// Tuning for one retried operation.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: u32,
    /// Upper bound for the random offset added to every delay.
    pub jitter: Duration,
    /// HTTP-style status codes treated as transient.
    pub retryable_status_codes: HashSet<u16>,
    /// Error-code prefixes treated as transient (case-insensitive).
    pub retryable_error_codes: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(2_000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2,
            jitter: Duration::from_millis(1_000),
            retryable_status_codes: [408, 429, 500, 502, 503, 504, 520, 521, 522, 523, 524]
                .into_iter()
                .collect(),
            retryable_error_codes: [
                "connection_reset",
                "connection_refused",
                "timed_out",
                "dns_error",
                "navigation_timeout",
                "network",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

impl RetryConfig {
    /// Build from the process configuration, keeping the default
    /// classification sets.
    pub fn from_app_config(config: &Config) -> Self {
        Self {
            max_attempts: config.retry_max_attempts,
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            backoff_multiplier: config.retry_backoff_multiplier,
            jitter: Duration::from_millis(config.retry_jitter_ms),
            ..Self::default()
        }
    }
}

/// A failed operation, described well enough to classify.
///
/// Carries the optional status code, a machine error code, and a
/// server-supplied retry-after hint when one was present.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct OperationError {
    pub message: String,
    pub status: Option<u16>,
    pub code: Option<String>,
    pub retry_after: Option<Duration>,
}

impl OperationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: None,
            retry_after: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl From<reqwest::Error> for OperationError {
    fn from(err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            Some("timed_out".to_string())
        } else if err.is_connect() {
            Some("connection_refused".to_string())
        } else {
            None
        };
        Self {
            message: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
            code,
            retry_after: None,
        }
    }
}

impl From<sqlx::Error> for OperationError {
    fn from(err: sqlx::Error) -> Self {
        let code = match &err {
            sqlx::Error::PoolTimedOut => Some("timed_out".to_string()),
            sqlx::Error::Io(_) => Some("network".to_string()),
            _ => None,
        };
        Self {
            message: err.to_string(),
            status: None,
            code,
            retry_after: None,
        }
    }
}

/// Pure classifier: should this failure be retried at all?
///
/// Retryable when the status is in the configured set, the error code
/// matches a configured prefix, or the message looks like a timeout.
pub fn is_retryable(error: &OperationError, config: &RetryConfig) -> bool {
    if let Some(status) = error.status {
        if config.retryable_status_codes.contains(&status) {
            return true;
        }
    }

    if let Some(code) = &error.code {
        let code = code.to_ascii_lowercase();
        if config
            .retryable_error_codes
            .iter()
            .any(|prefix| code.starts_with(&prefix.to_ascii_lowercase()))
        {
            return true;
        }
    }

    let message = error.message.to_ascii_lowercase();
    message.contains("timeout") || message.contains("timed out")
}

/// Pre-jitter exponential delay for a zero-based attempt index.
///
/// `min(initial * multiplier^attempt, max_delay)`; non-decreasing in the
/// attempt index and never above `max_delay`.
pub fn backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let factor = (config.backoff_multiplier as u64).saturating_pow(attempt);
    let millis = (config.initial_delay.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(millis).min(config.max_delay)
}

/// Full delay before the next attempt, including jitter.
///
/// A server-supplied retry-after hint takes precedence over the exponential
/// value; either way the result is capped at `max_delay`.
pub fn retry_delay(error: &OperationError, attempt: u32, config: &RetryConfig) -> Duration {
    let base = match error.retry_after {
        Some(hint) => hint,
        None => backoff_delay(attempt, config),
    };
    (base + jitter(config)).min(config.max_delay)
}

fn jitter(config: &RetryConfig) -> Duration {
    let bound = config.jitter.as_millis() as u64;
    if bound == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
}

/// Result of a retried operation. Never propagated as a panic or error;
/// callers branch on `result`.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, OperationError>,
    /// Attempts actually made (1-based).
    pub attempts: u32,
    /// Cumulative time spent sleeping between attempts.
    pub total_delay: Duration,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run `op` with bounded retry.
pub async fn with_retry<T, F, Fut>(op: F, config: &RetryConfig) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OperationError>>,
{
    with_retry_notify(op, config, |_, _, _| {}).await
}

/// Run `op` with bounded retry, invoking `on_retry` before each wait with
/// the attempt number, the last error, and the cumulative delay so far.
pub async fn with_retry_notify<T, F, Fut, N>(
    mut op: F,
    config: &RetryConfig,
    mut on_retry: N,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OperationError>>,
    N: FnMut(u32, &OperationError, Duration),
{
    let mut attempts = 0u32;
    let mut total_delay = Duration::ZERO;

    loop {
        attempts += 1;
        match op().await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts,
                    total_delay,
                }
            }
            Err(error) => {
                if attempts >= config.max_attempts || !is_retryable(&error, config) {
                    return RetryOutcome {
                        result: Err(error),
                        attempts,
                        total_delay,
                    };
                }

                let delay = retry_delay(&error, attempts - 1, config);
                total_delay += delay;
                on_retry(attempts, &error, total_delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
