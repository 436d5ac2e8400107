//! Cloudstore Client Core Library
//!
//! This library provides the execution core for a cloud object-storage
//! client: it turns a described operation (how to build, sign, and
//! interpret one REST request) into a supervised sequence of HTTP
//! attempts with retries, primary/secondary failover, per-attempt
//! timeouts, cooperative cancellation, and a full per-attempt audit
//! trail.
//!
//! # Architecture
//!
//! The library is organized around the [`executor`] module:
//! - [`executor`] - attempt loop, retry policies, location management,
//!   streaming body copy, and the callback adapter
//!
//! Operation protocols (blob, queue, and table surfaces) are expected to
//! be built on top of [`RequestSpec`] by downstream crates.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod executor;

// Re-export commonly used types
pub use executor::{
    AttemptResponse, CancellableHandle, ChecksumMode, Command, CommandLocationMode, CopyError,
    CopyOptions, CopyOutcome, Executor, ExecutorConfig, ExponentialBackoff, ExtendedErrorInfo,
    LinearRetry, LocationMode, NoRetry, OperationContext, RequestResult, RequestSpec,
    ResponseDestination, ResponseInfo, ResponsePayload, RetryContext, RetryInfo, RetryPolicy,
    StorageEndpoints, StorageError, StorageLocation, copy_stream, execute_with_callback,
};
