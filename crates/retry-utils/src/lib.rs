//! Retry utilities for worker error handling.
//!
//! Error classification, sliding-window error tracking, and full-jitter
//! exponential backoff. Classification is purely textual: it inspects the
//! error's display string (and, where available, the source chain) against
//! ordered pattern tables, permanent patterns first.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;

/// Classification of an error for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Temporary failure; retry with backoff.
    Transient,
    /// Will never succeed; stop immediately.
    Permanent,
    /// Unrecognized; treated like transient.
    Unknown,
}

// Permanent patterns are checked first so that e.g. "invalid api key" inside
// a connection error message still stops the worker.
const PERMANENT_PATTERNS: &[&str] = &[
    // Authentication / authorization
    "unauthorized",
    "forbidden",
    "auth",
    "invalid api key",
    "invalid credentials",
    "access denied",
    "401",
    "403",
    // Not found / invalid
    "not found",
    "does not exist",
    "invalid",
    "malformed",
    "404",
    "400",
    // Configuration errors
    "config",
    "missing required",
    "validation error",
    // Business logic errors
    "insufficient balance",
    "insufficient funds",
    "position not found",
];

const TRANSIENT_PATTERNS: &[&str] = &[
    // Network errors
    "connection",
    "timeout",
    "timed out",
    "network",
    "socket",
    "dns",
    "refused",
    "reset",
    "unreachable",
    // Rate limiting
    "rate limit",
    "too many requests",
    "throttl",
    "429",
    // Temporary service issues
    "service unavailable",
    "bad gateway",
    "gateway timeout",
    "503",
    "502",
    "504",
    // Database transient errors
    "deadlock",
    "lock wait timeout",
    "connection pool",
    "too many connections",
    // Redis transient errors
    "redis",
    "i/o error",
];

/// Classify an error message as transient or permanent.
///
/// Deterministic on the input string: the same message always yields the
/// same classification.
pub fn classify_message(message: &str) -> ErrorKind {
    let lowered = message.to_lowercase();

    for pattern in PERMANENT_PATTERNS {
        if lowered.contains(pattern) {
            return ErrorKind::Permanent;
        }
    }
    for pattern in TRANSIENT_PATTERNS {
        if lowered.contains(pattern) {
            return ErrorKind::Transient;
        }
    }
    ErrorKind::Unknown
}

/// Classify a std error, including its source chain in the text inspected.
pub fn classify_error(error: &(dyn std::error::Error + 'static)) -> ErrorKind {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        text.push_str(" | ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    classify_message(&text)
}

impl ErrorKind {
    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorKind::Permanent)
    }
}

/// Tracks error frequency within a sliding time window.
///
/// Circuit-breaker style: when too many errors land inside the window the
/// worker should stop and mark the agent as errored.
#[derive(Debug)]
pub struct ErrorWindow {
    window: Duration,
    max_errors: usize,
    error_times: Vec<Instant>,
}

impl ErrorWindow {
    pub fn new(window_seconds: u64, max_errors: usize) -> Self {
        Self {
            window: Duration::from_secs(window_seconds),
            max_errors,
            error_times: Vec::new(),
        }
    }

    pub fn record_error(&mut self) {
        let now = Instant::now();
        self.error_times.push(now);
        self.prune(now);
        tracing::debug!(
            count = self.error_times.len(),
            max = self.max_errors,
            "error recorded in window"
        );
    }

    fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.error_times
            .retain(|t| now.duration_since(*t) < window);
    }

    pub fn error_count(&mut self) -> usize {
        self.prune(Instant::now());
        self.error_times.len()
    }

    pub fn should_stop(&mut self) -> bool {
        self.error_count() >= self.max_errors
    }

    /// Age of the oldest error still in the window.
    pub fn oldest_age(&mut self) -> Option<Duration> {
        self.prune(Instant::now());
        self.error_times.first().map(|t| t.elapsed())
    }

    /// Clear all recorded errors (call after a successful cycle).
    pub fn reset(&mut self) {
        self.error_times.clear();
    }
}

impl Default for ErrorWindow {
    fn default() -> Self {
        Self::new(600, 5)
    }
}

/// Exponential backoff with optional full jitter.
///
/// `delay = min(max_delay, base * 2^attempt)`; with jitter the result is
/// drawn uniformly from `[0, delay]` to avoid thundering herds.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, jitter: bool) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt.min(63) as i32);
    let capped = exp.min(max.as_secs_f64());
    if jitter {
        Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=capped))
    } else {
        Duration::from_secs_f64(capped)
    }
}

/// Run `op` up to `max_attempts` times with backoff between failures.
///
/// Permanent errors short-circuit: no further attempts are made.
pub async fn retry_with_backoff<T, E, F, Fut>(
    mut op: F,
    max_attempts: u32,
    base: Duration,
    max: Duration,
    jitter: bool,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_err = None;
    for attempt in 0..max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let kind = classify_message(&e.to_string());
                if kind == ErrorKind::Permanent {
                    tracing::warn!("permanent error, not retrying: {e}");
                    return Err(e);
                }
                if attempt + 1 < max_attempts {
                    let delay = backoff_delay(attempt, base, max, jitter);
                    tracing::info!(
                        "retry attempt {}/{} after {:.1}s: {e}",
                        attempt + 1,
                        max_attempts,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("at least one attempt"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_permanent_wins_over_transient() {
        // "connection" is transient but "invalid api key" must dominate.
        assert_eq!(
            classify_message("connection rejected: invalid api key"),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn classification_table() {
        assert_eq!(classify_message("Connection reset by peer"), ErrorKind::Transient);
        assert_eq!(classify_message("429 Too Many Requests"), ErrorKind::Transient);
        assert_eq!(classify_message("deadlock detected"), ErrorKind::Transient);
        assert_eq!(classify_message("redis i/o error"), ErrorKind::Transient);
        assert_eq!(classify_message("401 Unauthorized"), ErrorKind::Permanent);
        assert_eq!(classify_message("position not found"), ErrorKind::Permanent);
        assert_eq!(classify_message("insufficient balance"), ErrorKind::Permanent);
        assert_eq!(classify_message("something odd happened"), ErrorKind::Unknown);
    }

    #[test]
    fn classification_is_deterministic() {
        let msg = "gateway timeout while polling";
        assert_eq!(classify_message(msg), classify_message(msg));
    }

    #[test]
    fn window_trips_at_max_errors() {
        let mut window = ErrorWindow::new(600, 3);
        window.record_error();
        window.record_error();
        assert!(!window.should_stop());
        window.record_error();
        assert!(window.should_stop());
        window.reset();
        assert_eq!(window.error_count(), 0);
        assert!(window.oldest_age().is_none());
    }

    #[test]
    fn window_prunes_expired_entries() {
        let mut window = ErrorWindow::new(0, 1);
        window.record_error();
        // Zero-length window: entry expires immediately.
        assert_eq!(window.error_count(), 0);
        assert!(!window.should_stop());
    }

    #[test]
    fn backoff_without_jitter_is_exact() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(0, base, max, false), Duration::from_secs(2));
        assert_eq!(backoff_delay(1, base, max, false), Duration::from_secs(4));
        assert_eq!(backoff_delay(3, base, max, false), Duration::from_secs(16));
        // Capped at max.
        assert_eq!(backoff_delay(10, base, max, false), Duration::from_secs(60));
    }

    #[test]
    fn backoff_with_jitter_stays_in_bounds() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(60);
        for attempt in 0..8 {
            let d = backoff_delay(attempt, base, max, true);
            let ceiling = backoff_delay(attempt, base, max, false);
            assert!(d <= ceiling, "jittered {d:?} above ceiling {ceiling:?}");
        }
    }

    #[tokio::test]
    async fn retry_stops_on_permanent() {
        let mut calls = 0u32;
        let result: Result<(), String> = retry_with_backoff(
            || {
                calls += 1;
                async move { Err("401 unauthorized".to_string()) }
            },
            5,
            Duration::from_millis(1),
            Duration::from_millis(2),
            false,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let mut calls = 0u32;
        let result: Result<u32, String> = retry_with_backoff(
            || {
                calls += 1;
                let n = calls;
                async move {
                    if n < 3 {
                        Err("connection refused".to_string())
                    } else {
                        Ok(n)
                    }
                }
            },
            5,
            Duration::from_millis(1),
            Duration::from_millis(2),
            false,
        )
        .await;
        assert_eq!(result.unwrap(), 3);
    }
}
