//! Retrying execution engine for storage operations.
//!
//! This module drives a single logical storage operation (one REST call's
//! worth of intent) through as many HTTP attempts as its retry policy
//! allows, against a primary endpoint and an optional read-only secondary.
//!
//! # Features
//!
//! - Per-attempt audit trail ([`RequestResult`]) with the invariant
//!   `results == retries + 1`
//! - Primary/secondary alternation with hard per-command pinning
//! - Pluggable retry policies (none, linear, exponential with jitter)
//! - Streaming body copy with length enforcement and optional MD5
//! - Per-attempt timeouts plus an optional whole-operation deadline
//! - Cooperative cancellation that is never misreported as a timeout
//!
//! # Example
//!
//! See [`Executor::execute`] for an end-to-end example.

mod callback;
mod command;
mod constants;
mod context;
mod copier;
mod engine;
mod error;
mod retry;
mod state;

pub use callback::{CancellableHandle, execute_with_callback};
pub use command::{
    AttemptResponse, Command, CommandLocationMode, LocationMode, RequestSpec, ResponseDestination,
    ResponseInfo, ResponsePayload, StorageEndpoints, StorageLocation,
};
pub use constants::{
    CLIENT_REQUEST_ID_HEADER, DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_MAX_ERROR_BODY_BYTES,
    DEFAULT_MAX_RETRY_DELAY, SERVICE_REQUEST_ID_HEADER,
};
pub use context::{OperationContext, RequestCompletedCallback, RequestResult};
pub use copier::{ChecksumMode, CopyError, CopyOptions, CopyOutcome, copy_stream};
pub use engine::{Executor, ExecutorConfig};
pub use error::{ExtendedErrorInfo, StorageError, is_status_retryable, parse_json_error_envelope};
pub use retry::{
    DEFAULT_MAX_RETRY_ATTEMPTS, ExponentialBackoff, LinearRetry, NoRetry, RetryContext, RetryInfo,
    RetryPolicy,
};
