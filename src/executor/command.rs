//! Command descriptor and the per-operation strategy contract.
//!
//! A [`Command`] describes one logical storage operation: which replica
//! endpoints it may target, how strictly it is pinned to one of them, where
//! its response body should go, and the [`RequestSpec`] strategy that knows
//! how to build, sign, and interpret the underlying HTTP exchange. Service
//! layers (blob/queue/table/file) implement one `RequestSpec` per REST
//! operation; the executor drives them all through the same loop.
//!
//! Commands are immutable once built. The retry loop keeps its effective
//! location mode and current replica on its own execution state, so a spec
//! implementation can be shared (e.g. behind an `Arc`) across concurrent
//! operations without aliasing hazards.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use tokio::io::{AsyncSeek, AsyncWrite};
use url::Url;

use super::constants::SERVICE_REQUEST_ID_HEADER;
use super::context::OperationContext;
use super::copier::{ChecksumMode, CopyOutcome};
use super::error::{ExtendedErrorInfo, StorageError, parse_json_error_envelope};

/// Which service replica an attempt targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageLocation {
    /// The primary (read-write) endpoint.
    Primary,
    /// The read-only secondary replica.
    Secondary,
}

impl std::fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// Caller preference for which replicas to try, and in what order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocationMode {
    /// Only the primary endpoint is ever tried.
    #[default]
    PrimaryOnly,
    /// Only the secondary endpoint is ever tried.
    SecondaryOnly,
    /// Start at primary; alternate on each retry.
    PrimaryThenSecondary,
    /// Start at secondary; alternate on each retry.
    SecondaryThenPrimary,
}

impl LocationMode {
    /// Location of the first attempt under this mode.
    #[must_use]
    pub fn initial_location(self) -> StorageLocation {
        match self {
            Self::PrimaryOnly | Self::PrimaryThenSecondary => StorageLocation::Primary,
            Self::SecondaryOnly | Self::SecondaryThenPrimary => StorageLocation::Secondary,
        }
    }

    /// Whether this mode permits attempts against `location` at all.
    #[must_use]
    pub fn permits(self, location: StorageLocation) -> bool {
        match self {
            Self::PrimaryOnly => location == StorageLocation::Primary,
            Self::SecondaryOnly => location == StorageLocation::Secondary,
            Self::PrimaryThenSecondary | Self::SecondaryThenPrimary => true,
        }
    }

    /// Location the next attempt targets, given where the last one ran.
    ///
    /// Alternating modes flip replica each attempt; pinned modes stay put.
    #[must_use]
    pub fn alternate(self, current: StorageLocation) -> StorageLocation {
        match self {
            Self::PrimaryOnly => StorageLocation::Primary,
            Self::SecondaryOnly => StorageLocation::Secondary,
            Self::PrimaryThenSecondary | Self::SecondaryThenPrimary => match current {
                StorageLocation::Primary => StorageLocation::Secondary,
                StorageLocation::Secondary => StorageLocation::Primary,
            },
        }
    }
}

/// Hard replica constraint imposed by the operation itself.
///
/// Writes, for example, must go to the primary regardless of what the caller
/// asked for. A constraint that contradicts the caller's [`LocationMode`]
/// is a fatal configuration error, not something the retry loop works around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandLocationMode {
    /// The operation runs wherever the caller's mode allows.
    #[default]
    Unconstrained,
    /// The operation only makes sense against the primary.
    PrimaryOnly,
    /// The operation only makes sense against the secondary.
    SecondaryOnly,
}

impl CommandLocationMode {
    /// Narrows `requested` to satisfy this constraint.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Configuration`] when the two are incompatible
    /// (e.g. a primary-only operation under a secondary-only caller mode).
    pub fn apply(self, requested: LocationMode) -> Result<LocationMode, StorageError> {
        match self {
            Self::Unconstrained => Ok(requested),
            Self::PrimaryOnly => match requested {
                LocationMode::SecondaryOnly => Err(StorageError::configuration(
                    "operation requires the primary endpoint but the location mode is secondary-only",
                )),
                _ => Ok(LocationMode::PrimaryOnly),
            },
            Self::SecondaryOnly => match requested {
                LocationMode::PrimaryOnly => Err(StorageError::configuration(
                    "operation requires the secondary endpoint but the location mode is primary-only",
                )),
                _ => Ok(LocationMode::SecondaryOnly),
            },
        }
    }

    /// Forces a proposed target location to satisfy this constraint.
    #[must_use]
    pub fn force(self, proposed: StorageLocation) -> StorageLocation {
        match self {
            Self::Unconstrained => proposed,
            Self::PrimaryOnly => StorageLocation::Primary,
            Self::SecondaryOnly => StorageLocation::Secondary,
        }
    }
}

/// Replica endpoint pair for a storage account.
#[derive(Debug, Clone)]
pub struct StorageEndpoints {
    primary: Url,
    secondary: Option<Url>,
}

impl StorageEndpoints {
    /// Endpoints with a primary only.
    #[must_use]
    pub fn new(primary: Url) -> Self {
        Self {
            primary,
            secondary: None,
        }
    }

    /// Adds a secondary replica endpoint.
    #[must_use]
    pub fn with_secondary(mut self, secondary: Url) -> Self {
        self.secondary = Some(secondary);
        self
    }

    /// Returns the endpoint for `location`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Configuration`] when the secondary is
    /// requested but the account has none configured.
    pub fn uri_for(&self, location: StorageLocation) -> Result<&Url, StorageError> {
        match location {
            StorageLocation::Primary => Ok(&self.primary),
            StorageLocation::Secondary => self.secondary.as_ref().ok_or_else(|| {
                StorageError::configuration("no secondary endpoint configured for this account")
            }),
        }
    }

    /// Whether a secondary replica is configured.
    #[must_use]
    pub fn has_secondary(&self) -> bool {
        self.secondary.is_some()
    }
}

/// Headers-only snapshot of a response, available before the body is read.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    url: String,
    status: u16,
    headers: HeaderMap,
}

impl ResponseInfo {
    pub(crate) fn new(url: String, status: u16, headers: HeaderMap) -> Self {
        Self {
            url,
            status,
            headers,
        }
    }

    /// The URL this attempt targeted.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The HTTP status code.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// All response headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A header value as UTF-8 text, when present and valid.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// The service-assigned request id, when echoed.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.header(SERVICE_REQUEST_ID_HEADER)
    }

    /// The resource ETag, when present.
    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.header("etag")
    }
}

/// How the successful response body reached the post-processor.
#[derive(Debug)]
pub enum ResponsePayload {
    /// The body was not retrieved.
    Empty,
    /// The body was buffered in memory.
    Buffered(Bytes),
    /// The body was streamed to the command's destination.
    Streamed(CopyOutcome),
}

/// A successful attempt handed to [`RequestSpec::post_process`].
#[derive(Debug)]
pub struct AttemptResponse {
    /// Headers-only snapshot.
    pub info: ResponseInfo,
    /// Body disposition.
    pub payload: ResponsePayload,
}

/// Per-operation strategy: build, sign, and interpret one REST exchange.
///
/// One implementation per service operation replaces the delegate slots of a
/// hand-rolled descriptor. Only [`build_request`](Self::build_request) and
/// [`post_process`](Self::post_process) are mandatory; the rest default to
/// no-ops (and [`parse_error`](Self::parse_error) to the JSON envelope
/// fallback).
#[async_trait]
pub trait RequestSpec: Send + Sync {
    /// The typed result of a successful operation.
    type Output: Send;

    /// Materializes the transport request for one attempt against `uri`.
    ///
    /// Called once per attempt, so stream-backed bodies must be re-creatable
    /// or rewound through [`recover`](Self::recover).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the request cannot be constructed.
    fn build_request(
        &self,
        uri: &Url,
        context: &OperationContext,
    ) -> Result<reqwest::Request, StorageError>;

    /// Adds authentication to the request (shared-key HMAC, SAS, bearer).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when signing fails.
    fn sign_request(
        &self,
        request: &mut reqwest::Request,
        context: &OperationContext,
    ) -> Result<(), StorageError> {
        let _ = (request, context);
        Ok(())
    }

    /// Headers-only validation, run before the body is touched.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] to fail the attempt (e.g. version mismatch).
    fn pre_process(
        &self,
        response: &ResponseInfo,
        context: &OperationContext,
    ) -> Result<(), StorageError> {
        let _ = (response, context);
        Ok(())
    }

    /// Builds the typed result once the body (if requested) is available.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the response cannot be interpreted.
    async fn post_process(
        &self,
        response: AttemptResponse,
        context: &OperationContext,
    ) -> Result<Self::Output, StorageError>;

    /// Parses a buffered error body into service-specific details.
    fn parse_error(&self, body: &[u8], response: &ResponseInfo) -> Option<ExtendedErrorInfo> {
        let _ = response;
        parse_json_error_envelope(body)
    }

    /// Restores request-side state before a retry (e.g. rewind an upload
    /// source that was partially consumed).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when recovery fails; the operation then
    /// terminates with that error.
    async fn recover(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[async_trait]
impl<T: RequestSpec + ?Sized> RequestSpec for std::sync::Arc<T> {
    type Output = T::Output;

    fn build_request(
        &self,
        uri: &Url,
        context: &OperationContext,
    ) -> Result<reqwest::Request, StorageError> {
        (**self).build_request(uri, context)
    }

    fn sign_request(
        &self,
        request: &mut reqwest::Request,
        context: &OperationContext,
    ) -> Result<(), StorageError> {
        (**self).sign_request(request, context)
    }

    fn pre_process(
        &self,
        response: &ResponseInfo,
        context: &OperationContext,
    ) -> Result<(), StorageError> {
        (**self).pre_process(response, context)
    }

    async fn post_process(
        &self,
        response: AttemptResponse,
        context: &OperationContext,
    ) -> Result<Self::Output, StorageError> {
        (**self).post_process(response, context).await
    }

    fn parse_error(&self, body: &[u8], response: &ResponseInfo) -> Option<ExtendedErrorInfo> {
        (**self).parse_error(body, response)
    }

    async fn recover(&self) -> Result<(), StorageError> {
        (**self).recover().await
    }
}

/// Seekable async sink a response body can be streamed into.
///
/// Seekability is what lets the retry loop rewind a partially written
/// destination before the next attempt. `tokio::fs::File` and
/// `std::io::Cursor<Vec<u8>>` both qualify.
pub trait ResponseDestination: AsyncWrite + AsyncSeek + Send + Sync + Unpin {}

impl<T: AsyncWrite + AsyncSeek + Send + Sync + Unpin + ?Sized> ResponseDestination for T {}

/// How a successful response body should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum BodyHandling {
    /// Do not read the body.
    #[default]
    Ignore,
    /// Buffer the body and pass it to the post-processor.
    Buffer,
    /// Stream the body to the command's destination.
    Stream,
}

/// One logical storage operation, ready for [`Executor::execute`].
///
/// [`Executor::execute`]: super::Executor::execute
pub struct Command<'d, S: RequestSpec> {
    spec: S,
    endpoints: StorageEndpoints,
    location_mode: LocationMode,
    command_location_mode: CommandLocationMode,
    body_handling: BodyHandling,
    destination: Option<&'d mut dyn ResponseDestination>,
    checksum: ChecksumMode,
    exact_body_length: Option<u64>,
    max_body_length: Option<u64>,
    max_execution_time: Option<Duration>,
}

impl<'d, S: RequestSpec> Command<'d, S> {
    /// Creates a command with defaults: primary-only, unconstrained, body
    /// ignored, no checksum, no overall deadline.
    #[must_use]
    pub fn new(spec: S, endpoints: StorageEndpoints) -> Self {
        Self {
            spec,
            endpoints,
            location_mode: LocationMode::PrimaryOnly,
            command_location_mode: CommandLocationMode::Unconstrained,
            body_handling: BodyHandling::Ignore,
            destination: None,
            checksum: ChecksumMode::None,
            exact_body_length: None,
            max_body_length: None,
            max_execution_time: None,
        }
    }

    /// Sets the caller's replica preference.
    #[must_use]
    pub fn with_location_mode(mut self, mode: LocationMode) -> Self {
        self.location_mode = mode;
        self
    }

    /// Sets the operation's hard replica constraint.
    #[must_use]
    pub fn with_command_location_mode(mut self, mode: CommandLocationMode) -> Self {
        self.command_location_mode = mode;
        self
    }

    /// Buffers the successful response body for the post-processor.
    #[must_use]
    pub fn buffer_response(mut self) -> Self {
        self.body_handling = BodyHandling::Buffer;
        self.destination = None;
        self
    }

    /// Streams the successful response body into `destination`.
    #[must_use]
    pub fn stream_response_to(mut self, destination: &'d mut dyn ResponseDestination) -> Self {
        self.body_handling = BodyHandling::Stream;
        self.destination = Some(destination);
        self
    }

    /// Sets the digest behavior for a streamed response body.
    #[must_use]
    pub fn with_checksum(mut self, checksum: ChecksumMode) -> Self {
        self.checksum = checksum;
        self
    }

    /// Requires a streamed response body of exactly `length` bytes.
    #[must_use]
    pub fn with_exact_body_length(mut self, length: u64) -> Self {
        self.exact_body_length = Some(length);
        self
    }

    /// Caps a streamed response body at `length` bytes.
    #[must_use]
    pub fn with_max_body_length(mut self, length: u64) -> Self {
        self.max_body_length = Some(length);
        self
    }

    /// Bounds the whole operation, retries and backoff included.
    ///
    /// Without this, only the per-attempt timeout applies; there is no
    /// overall deadline.
    #[must_use]
    pub fn with_max_execution_time(mut self, max: Duration) -> Self {
        self.max_execution_time = Some(max);
        self
    }

    pub(crate) fn spec(&self) -> &S {
        &self.spec
    }

    pub(crate) fn endpoints(&self) -> &StorageEndpoints {
        &self.endpoints
    }

    pub(crate) fn location_mode(&self) -> LocationMode {
        self.location_mode
    }

    pub(crate) fn command_location_mode(&self) -> CommandLocationMode {
        self.command_location_mode
    }

    pub(crate) fn body_handling(&self) -> BodyHandling {
        self.body_handling
    }

    pub(crate) fn checksum(&self) -> ChecksumMode {
        self.checksum
    }

    pub(crate) fn exact_body_length(&self) -> Option<u64> {
        self.exact_body_length
    }

    pub(crate) fn max_body_length(&self) -> Option<u64> {
        self.max_body_length
    }

    pub(crate) fn max_execution_time(&self) -> Option<Duration> {
        self.max_execution_time
    }

    pub(crate) fn take_destination(&mut self) -> Option<&'d mut dyn ResponseDestination> {
        self.destination.take()
    }
}

impl<S: RequestSpec> std::fmt::Debug for Command<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("endpoints", &self.endpoints)
            .field("location_mode", &self.location_mode)
            .field("command_location_mode", &self.command_location_mode)
            .field("body_handling", &self.body_handling)
            .field("checksum", &self.checksum)
            .field("max_execution_time", &self.max_execution_time)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_location_per_mode() {
        assert_eq!(
            LocationMode::PrimaryOnly.initial_location(),
            StorageLocation::Primary
        );
        assert_eq!(
            LocationMode::PrimaryThenSecondary.initial_location(),
            StorageLocation::Primary
        );
        assert_eq!(
            LocationMode::SecondaryOnly.initial_location(),
            StorageLocation::Secondary
        );
        assert_eq!(
            LocationMode::SecondaryThenPrimary.initial_location(),
            StorageLocation::Secondary
        );
    }

    #[test]
    fn test_alternation_flips_only_for_alternating_modes() {
        assert_eq!(
            LocationMode::PrimaryThenSecondary.alternate(StorageLocation::Primary),
            StorageLocation::Secondary
        );
        assert_eq!(
            LocationMode::PrimaryThenSecondary.alternate(StorageLocation::Secondary),
            StorageLocation::Primary
        );
        assert_eq!(
            LocationMode::PrimaryOnly.alternate(StorageLocation::Primary),
            StorageLocation::Primary
        );
        assert_eq!(
            LocationMode::SecondaryOnly.alternate(StorageLocation::Secondary),
            StorageLocation::Secondary
        );
    }

    #[test]
    fn test_unconstrained_apply_keeps_requested_mode() {
        for mode in [
            LocationMode::PrimaryOnly,
            LocationMode::SecondaryOnly,
            LocationMode::PrimaryThenSecondary,
            LocationMode::SecondaryThenPrimary,
        ] {
            assert_eq!(
                CommandLocationMode::Unconstrained.apply(mode).unwrap(),
                mode
            );
        }
    }

    #[test]
    fn test_primary_only_constraint_narrows_alternating_modes() {
        assert_eq!(
            CommandLocationMode::PrimaryOnly
                .apply(LocationMode::PrimaryThenSecondary)
                .unwrap(),
            LocationMode::PrimaryOnly
        );
        assert_eq!(
            CommandLocationMode::PrimaryOnly
                .apply(LocationMode::SecondaryThenPrimary)
                .unwrap(),
            LocationMode::PrimaryOnly
        );
    }

    #[test]
    fn test_incompatible_constraint_is_configuration_error() {
        let error = CommandLocationMode::PrimaryOnly
            .apply(LocationMode::SecondaryOnly)
            .unwrap_err();
        assert!(matches!(error, StorageError::Configuration { .. }));

        let error = CommandLocationMode::SecondaryOnly
            .apply(LocationMode::PrimaryOnly)
            .unwrap_err();
        assert!(matches!(error, StorageError::Configuration { .. }));
    }

    #[test]
    fn test_force_overrides_proposed_location() {
        assert_eq!(
            CommandLocationMode::PrimaryOnly.force(StorageLocation::Secondary),
            StorageLocation::Primary
        );
        assert_eq!(
            CommandLocationMode::SecondaryOnly.force(StorageLocation::Primary),
            StorageLocation::Secondary
        );
        assert_eq!(
            CommandLocationMode::Unconstrained.force(StorageLocation::Secondary),
            StorageLocation::Secondary
        );
    }

    #[test]
    fn test_endpoints_without_secondary_reject_secondary_lookup() {
        let endpoints = StorageEndpoints::new(Url::parse("https://acct.example.net").unwrap());
        assert!(endpoints.uri_for(StorageLocation::Primary).is_ok());
        assert!(matches!(
            endpoints.uri_for(StorageLocation::Secondary),
            Err(StorageError::Configuration { .. })
        ));
    }

    #[test]
    fn test_endpoints_with_secondary_resolve_both() {
        let endpoints = StorageEndpoints::new(Url::parse("https://acct.example.net").unwrap())
            .with_secondary(Url::parse("https://acct-secondary.example.net").unwrap());
        assert!(endpoints.has_secondary());
        assert_eq!(
            endpoints
                .uri_for(StorageLocation::Secondary)
                .unwrap()
                .as_str(),
            "https://acct-secondary.example.net/"
        );
    }

    #[test]
    fn test_response_info_header_accessors() {
        let mut headers = HeaderMap::new();
        headers.insert("etag", "\"0xABC\"".parse().unwrap());
        headers.insert(SERVICE_REQUEST_ID_HEADER, "req-1".parse().unwrap());
        let info = ResponseInfo::new("https://example.net/b".to_string(), 200, headers);

        assert_eq!(info.status(), 200);
        assert_eq!(info.etag(), Some("\"0xABC\""));
        assert_eq!(info.request_id(), Some("req-1"));
        assert_eq!(info.header("missing"), None);
    }
}
