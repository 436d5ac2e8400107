//! Operation context and the per-attempt audit trail.
//!
//! An [`OperationContext`] travels with one logical operation: it carries
//! the caller-chosen correlation id and custom headers applied to every
//! attempt, and accumulates one [`RequestResult`] per attempt. The result
//! list is append-only and lock-protected because callers may inspect it
//! from another thread while the operation is still in flight.
//!
//! Only the final attempt's error is returned from
//! [`Executor::execute`](super::Executor::execute); every earlier attempt
//! stays inspectable here.

use std::sync::Mutex;
use std::time::SystemTime;

use rand::Rng;

use super::command::StorageLocation;
use super::error::ExtendedErrorInfo;

/// The immutable record of one attempt's outcome.
///
/// Created when the attempt starts and finalized (end time set) before the
/// loop either retries or terminates; never mutated after that.
#[derive(Debug, Clone)]
pub struct RequestResult {
    target_location: StorageLocation,
    start_time: SystemTime,
    end_time: Option<SystemTime>,
    status_code: Option<u16>,
    service_request_id: Option<String>,
    etag: Option<String>,
    content_md5: Option<String>,
    error_message: Option<String>,
    extended_error: Option<ExtendedErrorInfo>,
}

impl RequestResult {
    pub(crate) fn start(target_location: StorageLocation) -> Self {
        Self {
            target_location,
            start_time: SystemTime::now(),
            end_time: None,
            status_code: None,
            service_request_id: None,
            etag: None,
            content_md5: None,
            error_message: None,
            extended_error: None,
        }
    }

    /// Which replica this attempt targeted.
    #[must_use]
    pub fn target_location(&self) -> StorageLocation {
        self.target_location
    }

    /// When the attempt started.
    #[must_use]
    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    /// When the attempt finished; `None` only while still in flight.
    #[must_use]
    pub fn end_time(&self) -> Option<SystemTime> {
        self.end_time
    }

    /// The HTTP status, when a response was received.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// The service-assigned request id, when echoed.
    #[must_use]
    pub fn service_request_id(&self) -> Option<&str> {
        self.service_request_id.as_deref()
    }

    /// The resource ETag, when present.
    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Hex MD5 of the streamed body, when one was computed.
    #[must_use]
    pub fn content_md5(&self) -> Option<&str> {
        self.content_md5.as_deref()
    }

    /// The attempt's classified error message, when it failed.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Service error details parsed from the error body, when available.
    #[must_use]
    pub fn extended_error(&self) -> Option<&ExtendedErrorInfo> {
        self.extended_error.as_ref()
    }

    pub(crate) fn record_response(
        &mut self,
        status: u16,
        request_id: Option<String>,
        etag: Option<String>,
    ) {
        self.status_code = Some(status);
        self.service_request_id = request_id;
        self.etag = etag;
    }

    pub(crate) fn record_content_md5(&mut self, md5: Option<String>) {
        self.content_md5 = md5;
    }

    pub(crate) fn record_error(
        &mut self,
        message: String,
        extended: Option<ExtendedErrorInfo>,
    ) {
        self.error_message = Some(message);
        if extended.is_some() {
            self.extended_error = extended;
        }
    }

    pub(crate) fn finish(&mut self) {
        self.end_time = Some(SystemTime::now());
    }
}

/// Callback invoked after each attempt finishes, success or failure.
pub type RequestCompletedCallback = Box<dyn Fn(&RequestResult) + Send + Sync>;

/// Per-operation coordination object shared with the caller.
pub struct OperationContext {
    client_request_id: String,
    user_agent: Option<String>,
    user_headers: Vec<(String, String)>,
    results: Mutex<Vec<RequestResult>>,
    request_completed: Option<RequestCompletedCallback>,
}

impl OperationContext {
    /// Creates a context with a freshly generated correlation id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client_request_id: generate_client_request_id(),
            user_agent: None,
            user_headers: Vec::new(),
            results: Mutex::new(Vec::new()),
            request_completed: None,
        }
    }

    /// Overrides the generated correlation id.
    #[must_use]
    pub fn with_client_request_id(mut self, id: impl Into<String>) -> Self {
        self.client_request_id = id.into();
        self
    }

    /// Sets a custom User-Agent for every attempt.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Adds a custom header applied to every attempt.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_headers.push((name.into(), value.into()));
        self
    }

    /// Registers a callback fired after each attempt finishes.
    #[must_use]
    pub fn on_request_completed(
        mut self,
        callback: impl Fn(&RequestResult) + Send + Sync + 'static,
    ) -> Self {
        self.request_completed = Some(Box::new(callback));
        self
    }

    /// The correlation id attached to every attempt of this operation.
    #[must_use]
    pub fn client_request_id(&self) -> &str {
        &self.client_request_id
    }

    /// The custom User-Agent, when set.
    #[must_use]
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// Custom headers applied to every attempt.
    #[must_use]
    pub fn user_headers(&self) -> &[(String, String)] {
        &self.user_headers
    }

    /// Snapshot of the per-attempt audit trail, oldest first.
    ///
    /// Safe to call from another thread while the operation is in flight;
    /// in-flight attempts appear with `end_time() == None`.
    #[must_use]
    pub fn request_results(&self) -> Vec<RequestResult> {
        self.results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Number of attempts started so far.
    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Appends a new attempt record, returning its index.
    pub(crate) fn append_result(&self, result: RequestResult) -> usize {
        let mut results = self
            .results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        results.push(result);
        results.len() - 1
    }

    /// Mutates an in-flight attempt record under the lock.
    pub(crate) fn update_result(&self, index: usize, update: impl FnOnce(&mut RequestResult)) {
        let mut results = self
            .results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(result) = results.get_mut(index) {
            update(result);
        }
    }

    /// Clone of one attempt record, for retry-policy context.
    pub(crate) fn result_snapshot(&self, index: usize) -> Option<RequestResult> {
        self.results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(index)
            .cloned()
    }

    /// Fires the request-completed notification for a finished attempt.
    pub(crate) fn fire_request_completed(&self, index: usize) {
        if let Some(callback) = &self.request_completed {
            if let Some(result) = self.result_snapshot(index) {
                callback(&result);
            }
        }
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("client_request_id", &self.client_request_id)
            .field("user_agent", &self.user_agent)
            .field("user_headers", &self.user_headers)
            .field("attempt_count", &self.attempt_count())
            .finish_non_exhaustive()
    }
}

/// Generates a random 32-hex-char correlation id.
fn generate_client_request_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.r#gen();
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
