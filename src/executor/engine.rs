//! The executor: drives one storage operation through its attempt loop.
//!
//! Each attempt runs build → sign → send → interpret → body phase, and on
//! failure the loop classifies the error, advances the target replica by
//! the alternation rule, consults the retry policy, and backs off — all
//! under a per-attempt timeout and an optional whole-operation deadline.
//!
//! # Overview
//!
//! - Every attempt appends one [`RequestResult`] to the operation context,
//!   so `context.request_results().len() == retries + 1` at any settled
//!   point.
//! - A caller cancellation is always terminal and is never reported as a
//!   timeout, even when both fire close together: the cancellation branch
//!   wins the (biased) race.
//! - Retry delays are clamped to the configured cap, and the loop refuses
//!   to start a sleep that would overshoot the operation deadline.
//!
//! # Example
//!
//! ```no_run
//! use cloudstore_core::{
//!     Command, Executor, ExponentialBackoff, OperationContext, StorageEndpoints,
//! };
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! # use cloudstore_core::{AttemptResponse, RequestSpec, StorageError};
//! # struct GetProperties;
//! # #[async_trait::async_trait]
//! # impl RequestSpec for GetProperties {
//! #     type Output = u16;
//! #     fn build_request(
//! #         &self,
//! #         uri: &Url,
//! #         _context: &OperationContext,
//! #     ) -> Result<reqwest::Request, StorageError> {
//! #         Ok(reqwest::Request::new(reqwest::Method::HEAD, uri.clone()))
//! #     }
//! #     async fn post_process(
//! #         &self,
//! #         response: AttemptResponse,
//! #         _context: &OperationContext,
//! #     ) -> Result<u16, StorageError> {
//! #         Ok(response.info.status())
//! #     }
//! # }
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = Executor::new();
//! let endpoints = StorageEndpoints::new(Url::parse("https://acct.blob.example.net")?);
//! let command = Command::new(GetProperties, endpoints);
//! let context = OperationContext::new();
//! let status = executor
//!     .execute(
//!         command,
//!         &ExponentialBackoff::default(),
//!         &context,
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! println!("status {status}, attempts {}", context.attempt_count());
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::io::SeekFrom;
use std::time::{Duration, Instant};

use futures_util::TryStreamExt;
use reqwest::Client;
use reqwest::header::{HeaderName, HeaderValue, USER_AGENT};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::command::{
    AttemptResponse, BodyHandling, Command, RequestSpec, ResponseDestination, ResponseInfo,
    ResponsePayload,
};
use super::constants::{
    CLIENT_REQUEST_ID_HEADER, DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_MAX_ERROR_BODY_BYTES,
    DEFAULT_MAX_RETRY_DELAY,
};
use super::context::{OperationContext, RequestResult};
use super::copier::{CopyError, CopyOptions, copy_stream};
use super::error::StorageError;
use super::retry::{RetryContext, RetryPolicy, is_secondary_miss};
use super::state::ExecutionState;

/// Tunable execution settings.
///
/// The per-attempt timeout applies whether or not the caller sets an
/// overall deadline on the command; it is deliberately configuration, not a
/// hardcoded constant.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on one attempt (send through body phase).
    pub attempt_timeout: Duration,
    /// Cap applied to whatever delay a retry policy returns.
    pub max_retry_delay: Duration,
    /// Cap on buffered error-body bytes kept for envelope parsing.
    pub max_error_body_bytes: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            max_error_body_bytes: DEFAULT_MAX_ERROR_BODY_BYTES,
        }
    }
}

/// Executes storage operations described by [`Command`]s.
///
/// The executor is cheap to clone conceptually but designed to be created
/// once and reused: the underlying HTTP client pools connections across
/// operations.
#[derive(Debug, Clone)]
pub struct Executor {
    client: Client,
    config: ExecutorConfig,
}

impl Executor {
    /// Creates an executor with a default HTTP client and default config.
    ///
    /// The client carries no request timeout of its own; the executor arms
    /// its own per-attempt deadline.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let client = Client::builder()
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self::with_client(client)
    }

    /// Creates an executor around an existing HTTP client.
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            config: ExecutorConfig::default(),
        }
    }

    /// Creates an executor with explicit settings.
    #[must_use]
    pub fn with_config(client: Client, config: ExecutorConfig) -> Self {
        Self { client, config }
    }

    /// Returns the executor's settings.
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Runs one logical operation to completion.
    ///
    /// Attempts run strictly sequentially; pass
    /// [`NoRetry`](super::NoRetry) as the policy for single-shot semantics.
    /// The `cancel` token is combined with the per-attempt timeout at every
    /// suspension point; cancelling is always terminal.
    ///
    /// # Errors
    ///
    /// Returns the **last** attempt's classified [`StorageError`]; every
    /// attempt, including failed intermediate ones, remains inspectable via
    /// [`OperationContext::request_results`].
    #[instrument(
        level = "debug",
        skip_all,
        fields(client_request_id = %context.client_request_id())
    )]
    pub async fn execute<S: RequestSpec>(
        &self,
        mut command: Command<'_, S>,
        policy: &dyn RetryPolicy,
        context: &OperationContext,
        cancel: &CancellationToken,
    ) -> Result<S::Output, StorageError> {
        let mut policy = policy.fresh();

        // Incompatible mode constraints fail before any attempt starts.
        let effective_mode = command
            .command_location_mode()
            .apply(command.location_mode())?;
        let expiry = command.max_execution_time().map(|max| Instant::now() + max);
        let mut state = ExecutionState::new(effective_mode, expiry);

        let mut destination = command.take_destination();
        let rewind_origin = match destination.as_deref_mut() {
            Some(dest) => Some(
                dest.stream_position()
                    .await
                    .map_err(|source| StorageError::Copy(CopyError::Write { source }))?,
            ),
            None => None,
        };

        loop {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            let attempt = state.attempt_number();
            let index = context.append_result(RequestResult::start(state.current_location));
            debug!(attempt, location = %state.current_location, "starting attempt");

            let outcome = self
                .run_attempt(
                    &command,
                    context,
                    &state,
                    destination.as_deref_mut(),
                    index,
                    cancel,
                )
                .await;

            if let Err(error) = &outcome {
                let envelope = match error {
                    StorageError::Service { extended, .. } => extended.clone(),
                    _ => None,
                };
                context.update_result(index, |result| {
                    result.record_error(error.to_string(), envelope);
                });
            }
            context.update_result(index, RequestResult::finish);
            context.fire_request_completed(index);

            let error = match outcome {
                Ok(output) => {
                    debug!(attempt, "operation succeeded");
                    return Ok(output);
                }
                Err(error) => error,
            };

            if error.is_terminal() {
                return Err(error);
            }

            let Some(last) = context.result_snapshot(index) else {
                return Err(error);
            };
            if !error.is_retryable() && !is_secondary_miss(&last) {
                debug!(attempt, "error is not retryable");
                return Err(error);
            }

            let retry_context = RetryContext {
                attempt,
                last_result: &last,
                next_location: state.next_location(),
                location_mode: state.effective_mode,
            };
            let Some(info) = policy.evaluate(&retry_context, &error) else {
                debug!(attempt, "retry policy declined");
                return Err(error);
            };

            let delay = info.delay.min(self.config.max_retry_delay);
            let now = Instant::now();
            if state
                .expiry
                .is_some_and(|expiry| now + delay >= expiry)
            {
                debug!(attempt, "no time budget left for another attempt");
                return Err(error);
            }

            command.spec().recover().await?;
            if let (Some(dest), Some(origin)) = (destination.as_deref_mut(), rewind_origin) {
                rewind_destination(dest, origin).await?;
            }

            if !state.apply_retry_target(
                command.command_location_mode(),
                info.target_location,
                info.updated_location_mode,
            ) {
                return Err(error);
            }

            debug!(
                delay_ms = delay.as_millis(),
                next_attempt = state.attempt_number(),
                location = %state.current_location,
                "retrying after backoff"
            );
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(StorageError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One attempt: build, sign, send, interpret, body phase.
    async fn run_attempt<S: RequestSpec>(
        &self,
        command: &Command<'_, S>,
        context: &OperationContext,
        state: &ExecutionState,
        destination: Option<&mut (dyn ResponseDestination + '_)>,
        result_index: usize,
        cancel: &CancellationToken,
    ) -> Result<S::Output, StorageError> {
        let uri = command.endpoints().uri_for(state.current_location)?;
        let url_text = uri.as_str().to_string();

        let mut request = command.spec().build_request(uri, context)?;
        apply_context_headers(&mut request, context)?;
        command.spec().sign_request(&mut request, context)?;

        let now = Instant::now();
        if state.expired(now) {
            return Err(StorageError::timeout(url_text));
        }
        let attempt_deadline = match state.expiry {
            Some(expiry) => now + (expiry - now).min(self.config.attempt_timeout),
            None => now + self.config.attempt_timeout,
        };

        let response = bounded(
            self.client.execute(request),
            attempt_deadline,
            &url_text,
            cancel,
        )
        .await?
        .map_err(|error| {
            if error.is_timeout() {
                StorageError::timeout(&url_text)
            } else {
                StorageError::network(&url_text, error)
            }
        })?;

        // An echoed correlation id must match what was sent; a mismatch
        // means an intermediary paired this response with the wrong request.
        if let Some(echoed) = response
            .headers()
            .get(CLIENT_REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            if echoed != context.client_request_id() {
                return Err(StorageError::correlation(
                    context.client_request_id(),
                    echoed,
                ));
            }
        }

        let status = response.status().as_u16();
        let info = ResponseInfo::new(url_text.clone(), status, response.headers().clone());
        context.update_result(result_index, |result| {
            result.record_response(
                status,
                info.request_id().map(str::to_string),
                info.etag().map(str::to_string),
            );
        });

        command.spec().pre_process(&info, context)?;

        if !(200..300).contains(&status) {
            let body = self
                .buffer_error_body(response, attempt_deadline, &url_text, cancel)
                .await?;
            let extended = command.spec().parse_error(&body, &info);
            return Err(StorageError::service_with_envelope(
                url_text,
                status,
                info.request_id().map(str::to_string),
                extended,
            ));
        }

        let payload = match (command.body_handling(), destination) {
            (BodyHandling::Stream, Some(dest)) => {
                let options = CopyOptions {
                    exact_length: command.exact_body_length(),
                    max_length: command.max_body_length(),
                    checksum: command.checksum(),
                };
                let stream = response.bytes_stream().map_err(std::io::Error::other);
                let mut reader = StreamReader::new(Box::pin(stream));
                let outcome = bounded(
                    copy_stream(&mut reader, dest, &options, cancel),
                    attempt_deadline,
                    &url_text,
                    cancel,
                )
                .await??;
                context.update_result(result_index, |result| {
                    result.record_content_md5(outcome.md5.clone());
                });
                ResponsePayload::Streamed(outcome)
            }
            (BodyHandling::Stream, None) => {
                return Err(StorageError::configuration(
                    "response streaming requested without a destination",
                ));
            }
            (BodyHandling::Buffer, _) => {
                let bytes = bounded(response.bytes(), attempt_deadline, &url_text, cancel)
                    .await?
                    .map_err(|error| StorageError::network(&url_text, error))?;
                ResponsePayload::Buffered(bytes)
            }
            (BodyHandling::Ignore, _) => ResponsePayload::Empty,
        };

        command
            .spec()
            .post_process(AttemptResponse { info, payload }, context)
            .await
    }

    /// Buffers an error body (capped, no checksum) for envelope parsing.
    async fn buffer_error_body(
        &self,
        response: reqwest::Response,
        deadline: Instant,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, StorageError> {
        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let mut reader = StreamReader::new(Box::pin(stream)).take(self.config.max_error_body_bytes);
        let mut buffer = std::io::Cursor::new(Vec::new());
        bounded(
            copy_stream(&mut reader, &mut buffer, &CopyOptions::unbounded(), cancel),
            deadline,
            url,
            cancel,
        )
        .await??;
        Ok(buffer.into_inner())
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

/// Races `future` against the attempt deadline and the caller's token.
///
/// The race is biased: a cancellation that fires alongside a timeout is
/// reported as a cancellation, never as a timeout.
async fn bounded<F, T>(
    future: F,
    deadline: Instant,
    url: &str,
    cancel: &CancellationToken,
) -> Result<T, StorageError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(StorageError::Cancelled),
        () = tokio::time::sleep_until(deadline.into()) => Err(StorageError::timeout(url)),
        output = future => Ok(output),
    }
}

async fn rewind_destination(
    destination: &mut (dyn ResponseDestination + '_),
    origin: u64,
) -> Result<(), StorageError> {
    destination
        .seek(SeekFrom::Start(origin))
        .await
        .map_err(|source| StorageError::Copy(CopyError::Write { source }))?;
    Ok(())
}

/// Applies the context's correlation id, user agent, and custom headers.
fn apply_context_headers(
    request: &mut reqwest::Request,
    context: &OperationContext,
) -> Result<(), StorageError> {
    let headers = request.headers_mut();

    let id_value = HeaderValue::from_str(context.client_request_id()).map_err(|_| {
        StorageError::configuration("client request id is not a valid header value")
    })?;
    headers.insert(HeaderName::from_static(CLIENT_REQUEST_ID_HEADER), id_value);

    if let Some(user_agent) = context.user_agent() {
        let value = HeaderValue::from_str(user_agent).map_err(|_| {
            StorageError::configuration("custom user agent is not a valid header value")
        })?;
        headers.insert(USER_AGENT, value);
    }

    for (name, value) in context.user_headers() {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            StorageError::configuration(format!("invalid custom header name: {name}"))
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|_| {
            StorageError::configuration(format!("invalid custom header value for {name}"))
        })?;
        headers.insert(header_name, header_value);
    }

    Ok(())
}
