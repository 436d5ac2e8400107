//! Constants for the executor module (timeouts, backoff caps, header names).

use std::time::Duration;

/// Default per-attempt timeout (90 seconds).
///
/// Applies even when the caller sets no overall operation deadline: an
/// unbounded wait on a single attempt is never permitted. Tunable through
/// [`ExecutorConfig`](super::ExecutorConfig).
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(90);

/// Maximum backoff delay between attempts (2 minutes).
///
/// Delays returned by a retry policy are clamped to this cap regardless of
/// what the policy computes.
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(120);

/// Maximum number of error-body bytes buffered for envelope parsing (1 MiB).
pub const DEFAULT_MAX_ERROR_BODY_BYTES: u64 = 1024 * 1024;

/// Header carrying the caller-chosen request correlation id.
///
/// The service echoes this header back; a mismatch between the sent and
/// echoed values indicates a broken intermediary and is fatal.
pub const CLIENT_REQUEST_ID_HEADER: &str = "x-client-request-id";

/// Header carrying the service-assigned request id, recorded per attempt.
pub const SERVICE_REQUEST_ID_HEADER: &str = "x-request-id";
