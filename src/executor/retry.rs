//! Retry policies: whether, when, and where to try again.
//!
//! The executor pre-classifies every failure (see
//! [`StorageError::is_retryable`]) and only consults a policy for errors
//! another attempt could plausibly fix. A policy then answers with a delay
//! and, optionally, a different target replica and a narrowed location mode
//! for the rest of the operation.
//!
//! There is one trait for both capability levels: simple policies implement
//! [`RetryPolicy::should_retry`] and inherit the default
//! [`RetryPolicy::evaluate`], which honors the alternation-advanced target
//! the executor proposes; location-aware policies override `evaluate`.
//!
//! Policies are stateful per logical operation: the executor calls
//! [`RetryPolicy::fresh`] at the start of every `execute` and owns that
//! instance for the call's duration.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use cloudstore_core::{ExponentialBackoff, RetryPolicy};
//!
//! let policy = ExponentialBackoff::default();
//! let mut instance = policy.fresh();
//! // the executor drives `instance.evaluate(...)` from here
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use super::command::{LocationMode, StorageLocation};
use super::context::RequestResult;
use super::error::StorageError;

/// Default maximum attempts (including the initial one).
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default delay cap for exponential backoff (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to computed delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// What the executor knows when it asks a policy about a failed attempt.
#[derive(Debug)]
pub struct RetryContext<'a> {
    /// 1-indexed number of the attempt that just failed.
    pub attempt: u32,
    /// Audit record of the failed attempt.
    pub last_result: &'a RequestResult,
    /// Target the alternation rule proposes for the next attempt.
    pub next_location: StorageLocation,
    /// Location mode currently in effect.
    pub location_mode: LocationMode,
}

/// A policy's decision to retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryInfo {
    /// Replica the next attempt should target.
    pub target_location: StorageLocation,
    /// Location mode for the remainder of the operation.
    pub updated_location_mode: LocationMode,
    /// How long to wait before the next attempt.
    pub delay: Duration,
}

impl RetryInfo {
    /// Decision that follows the executor's proposal with the given delay.
    #[must_use]
    pub fn new(context: &RetryContext<'_>, delay: Duration) -> Self {
        Self {
            target_location: context.next_location,
            updated_location_mode: context.location_mode,
            delay,
        }
    }
}

/// Pluggable strategy deciding whether, when, and where to retry.
pub trait RetryPolicy: Send + Sync {
    /// Creates the stateful instance used for one `execute` call.
    fn fresh(&self) -> Box<dyn RetryPolicy>;

    /// Basic decision: retry after `Some(delay)`, or give up with `None`.
    ///
    /// `attempt` is the 1-indexed number of the attempt that just failed;
    /// `status` is its HTTP status when a response was received.
    fn should_retry(
        &mut self,
        attempt: u32,
        status: Option<u16>,
        error: &StorageError,
    ) -> Option<Duration>;

    /// Location-aware decision; `None` means "do not retry".
    ///
    /// The default wraps [`should_retry`](Self::should_retry) and follows
    /// the alternation-advanced target in `context`.
    fn evaluate(
        &mut self,
        context: &RetryContext<'_>,
        error: &StorageError,
    ) -> Option<RetryInfo> {
        self.should_retry(context.attempt, context.last_result.status_code(), error)
            .map(|delay| RetryInfo::new(context, delay))
    }
}

/// Policy that never retries. The default when callers supply none.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn fresh(&self) -> Box<dyn RetryPolicy> {
        Box::new(Self)
    }

    fn should_retry(
        &mut self,
        _attempt: u32,
        _status: Option<u16>,
        _error: &StorageError,
    ) -> Option<Duration> {
        None
    }
}

/// Fixed-delay policy.
#[derive(Debug, Clone)]
pub struct LinearRetry {
    delay: Duration,
    max_attempts: u32,
}

impl LinearRetry {
    /// Creates a policy retrying every `delay` up to `max_attempts` total
    /// attempts (minimum 1).
    #[must_use]
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Default for LinearRetry {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), DEFAULT_MAX_RETRY_ATTEMPTS)
    }
}

impl RetryPolicy for LinearRetry {
    fn fresh(&self) -> Box<dyn RetryPolicy> {
        Box::new(self.clone())
    }

    fn should_retry(
        &mut self,
        attempt: u32,
        _status: Option<u16>,
        error: &StorageError,
    ) -> Option<Duration> {
        if !error.is_retryable() {
            return None;
        }
        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return None;
        }
        Some(self.delay)
    }
}

/// Exponential backoff with jitter, plus replication-lag awareness.
///
/// # Delay calculation
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
/// ```
///
/// With defaults, delays are approximately 1s, 2s, 4s.
///
/// # Location behavior
///
/// A 404 from the secondary usually means the resource has not replicated
/// yet, not that it is gone: the policy retries against the primary and
/// narrows the location mode to [`LocationMode::PrimaryOnly`] for the rest
/// of the operation.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl ExponentialBackoff {
    /// Creates a policy with custom settings.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum attempts including the initial one (min 1)
    /// * `base_delay` - Base delay for the first retry
    /// * `max_delay` - Delay cap before jitter
    /// * `backoff_multiplier` - Multiplier for the exponential increase
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Creates a policy with a custom attempt cap and default delays.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Returns the configured maximum number of attempts.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `min(base * multiplier^(attempt - 1), max) + jitter`.
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * f64::from(self.backoff_multiplier).powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64) + calculate_jitter()
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn fresh(&self) -> Box<dyn RetryPolicy> {
        Box::new(self.clone())
    }

    fn should_retry(
        &mut self,
        attempt: u32,
        _status: Option<u16>,
        error: &StorageError,
    ) -> Option<Duration> {
        if !error.is_retryable() {
            return None;
        }
        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return None;
        }
        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );
        Some(delay)
    }

    fn evaluate(
        &mut self,
        context: &RetryContext<'_>,
        error: &StorageError,
    ) -> Option<RetryInfo> {
        // A secondary 404 is read-replication lag, not a missing resource:
        // retry against the primary even though a 404 is otherwise final,
        // and pin the rest of the operation there.
        let secondary_miss = is_secondary_miss(context.last_result);

        if !secondary_miss && !error.is_retryable() {
            return None;
        }
        if context.attempt >= self.max_attempts {
            debug!(
                attempt = context.attempt,
                max = self.max_attempts,
                "max attempts reached"
            );
            return None;
        }
        let delay = self.calculate_delay(context.attempt);

        if secondary_miss {
            debug!("404 from secondary, narrowing to primary-only");
            return Some(RetryInfo {
                target_location: StorageLocation::Primary,
                updated_location_mode: LocationMode::PrimaryOnly,
                delay,
            });
        }

        Some(RetryInfo::new(context, delay))
    }
}

/// Whether an attempt was a 404 against the secondary replica.
///
/// The executor uses the same test to keep such failures policy-decidable
/// even though a 404 is otherwise non-retryable.
#[must_use]
pub(crate) fn is_secondary_miss(result: &RequestResult) -> bool {
    result.target_location() == StorageLocation::Secondary && result.status_code() == Some(404)
}

/// Random jitter between 0 and [`MAX_JITTER`].
///
/// Jitter prevents thundering herd when many operations fail and retry at
/// the same moment.
fn calculate_jitter() -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_ms = rng.gen_range(0..=MAX_JITTER.as_millis() as u64);
    Duration::from_millis(jitter_ms)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::executor::context::RequestResult;

    fn failed_result(location: StorageLocation, status: u16) -> RequestResult {
        let mut result = RequestResult::start(location);
        result.record_response(status, None, None);
        result.finish();
        result
    }

    fn service_error(status: u16) -> StorageError {
        StorageError::service("https://acct.example.net/b", status, None)
    }

    #[test]
    fn test_no_retry_always_declines() {
        let mut policy = NoRetry.fresh();
        assert!(
            policy
                .should_retry(1, Some(500), &service_error(500))
                .is_none()
        );
    }

    #[test]
    fn test_linear_retry_fixed_delay_until_cap() {
        let mut policy = LinearRetry::new(Duration::from_millis(250), 3);
        let error = service_error(503);

        assert_eq!(
            policy.should_retry(1, Some(503), &error),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            policy.should_retry(2, Some(503), &error),
            Some(Duration::from_millis(250))
        );
        assert_eq!(policy.should_retry(3, Some(503), &error), None);
    }

    #[test]
    fn test_linear_retry_declines_non_retryable_error() {
        let mut policy = LinearRetry::new(Duration::from_millis(250), 5);
        assert!(
            policy
                .should_retry(1, Some(404), &service_error(404))
                .is_none()
        );
    }

    #[test]
    fn test_exponential_default_values() {
        let policy = ExponentialBackoff::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(32));
        assert!((policy.backoff_multiplier - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_exponential_max_attempts_minimum_is_one() {
        assert_eq!(ExponentialBackoff::with_max_attempts(0).max_attempts(), 1);
    }

    #[test]
    fn test_exponential_delay_growth() {
        let policy =
            ExponentialBackoff::new(5, Duration::from_secs(1), Duration::from_secs(32), 2.0);
        // attempt 1: 1s + jitter
        let delay = policy.calculate_delay(1);
        assert!(delay >= Duration::from_secs(1));
        assert!(delay <= Duration::from_millis(1500));
        // attempt 2: 2s + jitter
        let delay = policy.calculate_delay(2);
        assert!(delay >= Duration::from_secs(2));
        assert!(delay <= Duration::from_millis(2500));
        // attempt 3: 4s + jitter
        let delay = policy.calculate_delay(3);
        assert!(delay >= Duration::from_secs(4));
        assert!(delay <= Duration::from_millis(4500));
    }

    #[test]
    fn test_exponential_delay_respects_cap() {
        let policy =
            ExponentialBackoff::new(10, Duration::from_secs(1), Duration::from_secs(5), 2.0);
        let delay = policy.calculate_delay(6);
        assert!(delay >= Duration::from_secs(5));
        assert!(delay <= Duration::from_millis(5500));
    }

    #[test]
    fn test_jitter_within_bounds() {
        for _ in 0..100 {
            assert!(calculate_jitter() <= MAX_JITTER);
        }
    }

    #[test]
    fn test_exponential_stops_at_max_attempts() {
        let mut policy = ExponentialBackoff::with_max_attempts(3);
        let error = service_error(500);
        assert!(policy.should_retry(1, Some(500), &error).is_some());
        assert!(policy.should_retry(2, Some(500), &error).is_some());
        assert!(policy.should_retry(3, Some(500), &error).is_none());
    }

    #[test]
    fn test_default_evaluate_follows_proposed_target() {
        let mut policy = LinearRetry::new(Duration::from_millis(100), 5);
        let last = failed_result(StorageLocation::Primary, 500);
        let context = RetryContext {
            attempt: 1,
            last_result: &last,
            next_location: StorageLocation::Secondary,
            location_mode: LocationMode::PrimaryThenSecondary,
        };

        let info = policy.evaluate(&context, &service_error(500)).unwrap();
        assert_eq!(info.target_location, StorageLocation::Secondary);
        assert_eq!(
            info.updated_location_mode,
            LocationMode::PrimaryThenSecondary
        );
        assert_eq!(info.delay, Duration::from_millis(100));
    }

    #[test]
    fn test_secondary_404_narrows_to_primary_only() {
        let mut policy = ExponentialBackoff::default();
        let last = failed_result(StorageLocation::Secondary, 404);
        let context = RetryContext {
            attempt: 1,
            last_result: &last,
            next_location: StorageLocation::Primary,
            location_mode: LocationMode::SecondaryThenPrimary,
        };
        let info = policy.evaluate(&context, &service_error(404)).unwrap();
        assert_eq!(info.target_location, StorageLocation::Primary);
        assert_eq!(info.updated_location_mode, LocationMode::PrimaryOnly);
    }

    #[test]
    fn test_primary_404_does_not_narrow() {
        let mut policy = ExponentialBackoff::default();
        let last = failed_result(StorageLocation::Primary, 500);
        let context = RetryContext {
            attempt: 1,
            last_result: &last,
            next_location: StorageLocation::Secondary,
            location_mode: LocationMode::PrimaryThenSecondary,
        };

        let info = policy.evaluate(&context, &service_error(500)).unwrap();
        assert_eq!(info.target_location, StorageLocation::Secondary);
        assert_eq!(
            info.updated_location_mode,
            LocationMode::PrimaryThenSecondary
        );
    }
}
