//! Error types for the executor module.
//!
//! This module defines the classified error taxonomy the attempt loop works
//! with. Every error carries enough context to be inspected after the fact,
//! and [`StorageError::is_retryable`] encodes the classification the retry
//! machinery consults before asking a policy for a decision.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::copier::CopyError;

/// Errors that can occur while executing a storage operation.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Invalid configuration supplied by the caller or the operation itself.
    ///
    /// Examples: incompatible location-mode constraints, a secondary-only
    /// operation against an account with no secondary endpoint. Never
    /// retried.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the invalid configuration.
        message: String,
    },

    /// An attempt or the whole operation exceeded its deadline.
    #[error("timeout executing request against {url}")]
    Timeout {
        /// The URL the timed-out attempt targeted.
        url: String,
    },

    /// The caller cancelled the operation. Always terminal.
    #[error("operation cancelled by caller")]
    Cancelled,

    /// Network-level failure (DNS resolution, connection refused, TLS, etc.)
    #[error("network error executing request against {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The service answered with a non-success status.
    #[error("service returned HTTP {status} for {url}")]
    Service {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The service-assigned request id, when echoed.
        request_id: Option<String>,
        /// Parsed error envelope, when the body carried one.
        extended: Option<ExtendedErrorInfo>,
    },

    /// The echoed client-request-id does not match the one sent.
    ///
    /// Signals request/response correlation corruption by an intermediary
    /// (e.g. a proxy bug). Fatal, never retried.
    #[error("client-request-id mismatch: sent {sent:?}, received {received:?}")]
    Correlation {
        /// The id attached to the outgoing request.
        sent: String,
        /// The id echoed back by the response.
        received: String,
    },

    /// A body copy failed (length bounds, local I/O, checksum).
    #[error(transparent)]
    Copy(CopyError),
}

impl StorageError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a timeout error for the given attempt URL.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a service error without an envelope.
    pub fn service(url: impl Into<String>, status: u16, request_id: Option<String>) -> Self {
        Self::Service {
            url: url.into(),
            status,
            request_id,
            extended: None,
        }
    }

    /// Creates a service error carrying a parsed error envelope.
    pub fn service_with_envelope(
        url: impl Into<String>,
        status: u16,
        request_id: Option<String>,
        extended: Option<ExtendedErrorInfo>,
    ) -> Self {
        Self::Service {
            url: url.into(),
            status,
            request_id,
            extended,
        }
    }

    /// Creates a correlation error from the sent and echoed ids.
    pub fn correlation(sent: impl Into<String>, received: impl Into<String>) -> Self {
        Self::Correlation {
            sent: sent.into(),
            received: received.into(),
        }
    }

    /// Returns the HTTP status associated with this error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Service { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns whether another attempt could plausibly succeed.
    ///
    /// Terminal classifications (configuration, cancellation, correlation)
    /// are never retryable; the rest follow the status/transport tables in
    /// [`is_status_retryable`].
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Configuration { .. } | Self::Cancelled | Self::Correlation { .. } => false,
            Self::Timeout { .. } => true,
            Self::Network { source, .. } => !is_tls_error(source),
            Self::Service { status, .. } => is_status_retryable(*status),
            Self::Copy(source) => matches!(source, CopyError::Read { .. }),
        }
    }

    /// Returns whether this error must terminate the operation immediately,
    /// bypassing the retry policy entirely.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::Cancelled | Self::Correlation { .. }
        )
    }
}

impl From<CopyError> for StorageError {
    /// A cancelled copy surfaces as operation cancellation; everything else
    /// keeps its copy-specific classification.
    fn from(error: CopyError) -> Self {
        match error {
            CopyError::Cancelled => Self::Cancelled,
            other => Self::Copy(other),
        }
    }
}

/// Classifies an HTTP status code as retryable or not.
///
/// | Status | Retryable | Rationale |
/// |--------|-----------|-----------|
/// | 408 | yes | Request timeout - may succeed |
/// | 429 | yes | Throttled - retry with backoff |
/// | 500 | yes | Internal server error - may be temporary |
/// | 501 | no  | Not implemented - won't change |
/// | 502 | yes | Bad gateway - proxy issue |
/// | 503 | yes | Service unavailable - temporary |
/// | 504 | yes | Gateway timeout - temporary |
/// | 505 | no  | HTTP version unsupported - won't change |
/// | other 4xx | no | Client errors won't succeed on retry |
#[must_use]
pub fn is_status_retryable(status: u16) -> bool {
    match status {
        408 | 429 => true,
        501 | 505 => false,
        status if (500..600).contains(&status) => true,
        _ => false,
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
///
/// TLS failures are configuration problems, not transient network glitches,
/// so they are classified as non-retryable.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}

/// Service-specific error details parsed from an error-response body.
///
/// Concrete per-service layers supply an envelope parser through
/// [`RequestSpec::parse_error`](super::RequestSpec::parse_error); the
/// executor falls back to [`parse_json_error_envelope`] when they do not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedErrorInfo {
    /// Service-defined error code (e.g. `ContainerNotFound`).
    pub code: String,
    /// Human-readable message from the service.
    pub message: String,
    /// Additional name/value details from the envelope.
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

/// Best-effort parse of a JSON error envelope.
///
/// Accepts both the nested `{"error": {"code": ..., "message": ...}}` shape
/// and the flat `{"code": ..., "message": ...}` shape. Returns `None` when
/// the body is not a recognizable envelope; the status-only error is still
/// raised in that case.
#[must_use]
pub fn parse_json_error_envelope(body: &[u8]) -> Option<ExtendedErrorInfo> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let envelope = value.get("error").unwrap_or(&value);

    let code = envelope.get("code")?.as_str()?.to_string();
    let message = envelope
        .get("message")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut details = BTreeMap::new();
    if let Some(object) = envelope.as_object() {
        for (key, entry) in object {
            if key == "code" || key == "message" {
                continue;
            }
            if let Some(text) = entry.as_str() {
                details.insert(key.clone(), text.to_string());
            }
        }
    }

    Some(ExtendedErrorInfo {
        code,
        message,
        details,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_display() {
        let error = StorageError::configuration("secondary endpoint not configured");
        let msg = error.to_string();
        assert!(msg.contains("configuration error"), "got: {msg}");
        assert!(msg.contains("secondary endpoint"), "got: {msg}");
    }

    #[test]
    fn test_service_error_display_contains_status_and_url() {
        let error = StorageError::service("https://acct.blob.example.net/c/b", 503, None);
        let msg = error.to_string();
        assert!(msg.contains("503"), "got: {msg}");
        assert!(msg.contains("https://acct.blob.example.net/c/b"), "got: {msg}");
    }

    #[test]
    fn test_correlation_error_is_terminal_and_not_retryable() {
        let error = StorageError::correlation("abc", "def");
        assert!(error.is_terminal());
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_cancelled_is_terminal() {
        assert!(StorageError::Cancelled.is_terminal());
        assert!(!StorageError::Cancelled.is_retryable());
    }

    #[test]
    fn test_timeout_is_retryable_but_not_terminal() {
        let error = StorageError::timeout("https://example.net/blob");
        assert!(error.is_retryable());
        assert!(!error.is_terminal());
    }

    #[test]
    fn test_status_classification_tables() {
        assert!(is_status_retryable(408));
        assert!(is_status_retryable(429));
        assert!(is_status_retryable(500));
        assert!(is_status_retryable(502));
        assert!(is_status_retryable(503));
        assert!(is_status_retryable(504));
        assert!(!is_status_retryable(501));
        assert!(!is_status_retryable(505));
        assert!(!is_status_retryable(400));
        assert!(!is_status_retryable(404));
        assert!(!is_status_retryable(409));
        assert!(!is_status_retryable(412));
    }

    #[test]
    fn test_copy_cancellation_maps_to_cancelled() {
        let error: StorageError = CopyError::Cancelled.into();
        assert!(matches!(error, StorageError::Cancelled));
    }

    #[test]
    fn test_copy_length_mismatch_not_retryable() {
        let error: StorageError = CopyError::LengthMismatch {
            expected: 100,
            actual: 60,
        }
        .into();
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_parse_nested_json_envelope() {
        let body = br#"{"error": {"code": "ContainerNotFound", "message": "no such container", "resource": "c1"}}"#;
        let info = parse_json_error_envelope(body).unwrap();
        assert_eq!(info.code, "ContainerNotFound");
        assert_eq!(info.message, "no such container");
        assert_eq!(info.details.get("resource").map(String::as_str), Some("c1"));
    }

    #[test]
    fn test_parse_flat_json_envelope() {
        let body = br#"{"code": "ServerBusy", "message": "try again"}"#;
        let info = parse_json_error_envelope(body).unwrap();
        assert_eq!(info.code, "ServerBusy");
        assert_eq!(info.message, "try again");
        assert!(info.details.is_empty());
    }

    #[test]
    fn test_parse_invalid_envelope_returns_none() {
        assert!(parse_json_error_envelope(b"<not json>").is_none());
        assert!(parse_json_error_envelope(br#"{"message": "no code"}"#).is_none());
    }
}
