//! Stream copy utility with length bounds and optional MD5.
//!
//! This module provides [`copy_stream`], the byte-moving primitive the
//! executor uses for response bodies and buffered error envelopes. The copy
//! is double-buffered: while one chunk is being written, the next read is
//! already in flight on the same task, so throughput does not pay for
//! alternating read/write latency.
//!
//! # Length bounds
//!
//! At most one of [`CopyOptions::exact_length`] and
//! [`CopyOptions::max_length`] may be set. An `exact_length` source that
//! ends short fails with [`CopyError::LengthMismatch`] once the source is
//! exhausted; a source that overruns either bound fails as soon as the
//! overrun is observed, not after the full transfer.
//!
//! # Checksums
//!
//! [`ChecksumMode::BestEffort`] exposes the digest as an `Option` and never
//! fails the copy over checksum trouble; [`ChecksumMode::Required`] turns a
//! missing digest into [`CopyError::ChecksumUnavailable`]. The distinction
//! is part of the public contract even though the current MD5 backend cannot
//! fail to finalize.

use std::fmt::Write as _;

use md5::{Digest, Md5};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Copy buffer size (64 KiB per buffer, two buffers in flight).
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Errors that can occur while copying a stream.
#[derive(Debug, Error)]
pub enum CopyError {
    /// Both `exact_length` and `max_length` were specified.
    #[error("invalid copy bounds: {message}")]
    InvalidBounds {
        /// Description of the invalid bound combination.
        message: String,
    },

    /// The source produced a different byte count than `exact_length`.
    #[error("stream length mismatch: expected {expected} bytes, observed {actual}")]
    LengthMismatch {
        /// The declared exact length.
        expected: u64,
        /// Bytes observed when the mismatch was detected.
        actual: u64,
    },

    /// The source produced more bytes than `max_length` allows.
    #[error("stream exceeded maximum length: limit {limit} bytes, observed {actual}")]
    LengthExceeded {
        /// The configured maximum.
        limit: u64,
        /// Bytes observed when the overrun was detected.
        actual: u64,
    },

    /// A required checksum could not be produced.
    #[error("required checksum could not be produced")]
    ChecksumUnavailable,

    /// Reading from the source failed.
    #[error("read error during stream copy: {source}")]
    Read {
        /// The underlying read error.
        #[source]
        source: std::io::Error,
    },

    /// Writing to the destination failed.
    #[error("write error during stream copy: {source}")]
    Write {
        /// The underlying write error.
        #[source]
        source: std::io::Error,
    },

    /// The copy was cancelled cooperatively.
    #[error("stream copy cancelled")]
    Cancelled,
}

/// Whether and how strictly to compute a content digest during a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumMode {
    /// No digest is computed.
    #[default]
    None,

    /// Compute a digest when possible; the outcome carries `Option<String>`
    /// and digest trouble never fails the copy.
    BestEffort,

    /// The copy fails if a digest cannot be produced.
    Required,
}

impl ChecksumMode {
    fn wants_digest(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Bounds and checksum settings for one copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    /// The source must produce exactly this many bytes.
    pub exact_length: Option<u64>,
    /// The source must not produce more than this many bytes.
    pub max_length: Option<u64>,
    /// Digest behavior.
    pub checksum: ChecksumMode,
}

impl CopyOptions {
    /// Options with no bounds and no checksum.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Requires the source to produce exactly `length` bytes.
    #[must_use]
    pub fn with_exact_length(mut self, length: u64) -> Self {
        self.exact_length = Some(length);
        self
    }

    /// Caps the source at `length` bytes.
    #[must_use]
    pub fn with_max_length(mut self, length: u64) -> Self {
        self.max_length = Some(length);
        self
    }

    /// Sets the digest behavior.
    #[must_use]
    pub fn with_checksum(mut self, checksum: ChecksumMode) -> Self {
        self.checksum = checksum;
        self
    }

    fn validate(&self) -> Result<(), CopyError> {
        if self.exact_length.is_some() && self.max_length.is_some() {
            return Err(CopyError::InvalidBounds {
                message: "exact_length and max_length are mutually exclusive".to_string(),
            });
        }
        Ok(())
    }

    fn byte_ceiling(&self) -> Option<u64> {
        self.exact_length.or(self.max_length)
    }
}

/// Result of a completed copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    /// Total bytes moved from source to destination.
    pub bytes_copied: u64,
    /// Lowercase hex MD5 of the copied bytes, when a digest was requested.
    pub md5: Option<String>,
}

/// Copies `source` to `destination` with cooperative cancellation.
///
/// Reads and writes overlap: the settled chunk is written while the next
/// read is in flight. Cancellation is observed before every read/write pair
/// and aborts without flushing or finalizing anything; the destination is
/// left in an unspecified partial state for the caller to rewind or discard.
///
/// # Errors
///
/// Returns [`CopyError`] on invalid bounds, length violations, I/O failure,
/// or cancellation. See the module docs for the bound semantics.
pub async fn copy_stream<R, W>(
    source: &mut R,
    destination: &mut W,
    options: &CopyOptions,
    cancel: &CancellationToken,
) -> Result<CopyOutcome, CopyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    options.validate()?;
    let ceiling = options.byte_ceiling();

    let mut hasher = options.checksum.wants_digest().then(Md5::new);
    let mut front = vec![0u8; COPY_BUFFER_SIZE];
    let mut back = vec![0u8; COPY_BUFFER_SIZE];
    let mut bytes_copied: u64 = 0;

    let mut pending = read_cancellable(source, &mut front, cancel).await?;
    while pending > 0 {
        bytes_copied += pending as u64;
        if let Some(limit) = ceiling {
            if bytes_copied > limit {
                return Err(overrun_error(options, limit, bytes_copied));
            }
        }
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&front[..pending]);
        }

        // Overlap the settled write with the next read.
        let write_front = destination.write_all(&front[..pending]);
        let read_back = source.read(&mut back);
        let (write_result, read_result) = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(CopyError::Cancelled),
            pair = async { tokio::join!(write_front, read_back) } => pair,
        };
        write_result.map_err(|source| CopyError::Write { source })?;
        pending = read_result.map_err(|source| CopyError::Read { source })?;
        std::mem::swap(&mut front, &mut back);
    }

    destination
        .flush()
        .await
        .map_err(|source| CopyError::Write { source })?;

    if let Some(expected) = options.exact_length {
        if bytes_copied != expected {
            return Err(CopyError::LengthMismatch {
                expected,
                actual: bytes_copied,
            });
        }
    }

    let md5 = hasher.map(|hasher| to_hex(&hasher.finalize()));
    if options.checksum == ChecksumMode::Required && md5.is_none() {
        return Err(CopyError::ChecksumUnavailable);
    }

    debug!(bytes_copied, md5 = md5.as_deref(), "stream copy complete");
    Ok(CopyOutcome { bytes_copied, md5 })
}

/// Overrun under `exact_length` is a mismatch; under `max_length` it is an
/// exceeded limit. Both are detected incrementally with the running count.
fn overrun_error(options: &CopyOptions, limit: u64, actual: u64) -> CopyError {
    if options.exact_length.is_some() {
        CopyError::LengthMismatch {
            expected: limit,
            actual,
        }
    } else {
        CopyError::LengthExceeded { limit, actual }
    }
}

async fn read_cancellable<R>(
    source: &mut R,
    buffer: &mut [u8],
    cancel: &CancellationToken,
) -> Result<usize, CopyError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CopyError::Cancelled),
        read = source.read(buffer) => read.map_err(|source| CopyError::Read { source }),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use tokio::io::AsyncRead;

    fn cursor(data: &[u8]) -> Cursor<Vec<u8>> {
        Cursor::new(data.to_vec())
    }

    #[tokio::test]
    async fn test_copy_unbounded_moves_all_bytes() {
        let mut source = cursor(b"hello world");
        let mut destination = Cursor::new(Vec::new());

        let outcome = copy_stream(
            &mut source,
            &mut destination,
            &CopyOptions::unbounded(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.bytes_copied, 11);
        assert_eq!(outcome.md5, None);
        assert_eq!(destination.into_inner(), b"hello world");
    }

    #[tokio::test]
    async fn test_copy_computes_known_md5() {
        let mut source = cursor(b"hello world");
        let mut destination = Cursor::new(Vec::new());

        let outcome = copy_stream(
            &mut source,
            &mut destination,
            &CopyOptions::unbounded().with_checksum(ChecksumMode::Required),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // md5("hello world")
        assert_eq!(
            outcome.md5.as_deref(),
            Some("5eb63bbbe01eeed093cb22bb8f5acdc3")
        );
    }

    #[tokio::test]
    async fn test_copy_large_body_survives_double_buffering() {
        // Larger than two buffers so several swaps happen.
        let data: Vec<u8> = (0..(COPY_BUFFER_SIZE * 3 + 17))
            .map(|i| (i % 251) as u8)
            .collect();
        let mut source = cursor(&data);
        let mut destination = Cursor::new(Vec::new());

        let outcome = copy_stream(
            &mut source,
            &mut destination,
            &CopyOptions::unbounded().with_checksum(ChecksumMode::BestEffort),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.bytes_copied, data.len() as u64);
        assert_eq!(destination.into_inner(), data);

        let mut hasher = Md5::new();
        hasher.update(&data);
        assert_eq!(outcome.md5.unwrap(), to_hex(&hasher.finalize()));
    }

    #[tokio::test]
    async fn test_exact_length_shortfall_fails_after_exhaustion() {
        let mut source = cursor(&[0u8; 60]);
        let mut destination = Cursor::new(Vec::new());

        let result = copy_stream(
            &mut source,
            &mut destination,
            &CopyOptions::unbounded().with_exact_length(100),
            &CancellationToken::new(),
        )
        .await;

        match result {
            Err(CopyError::LengthMismatch { expected, actual }) => {
                assert_eq!(expected, 100);
                assert_eq!(actual, 60);
            }
            other => panic!("expected LengthMismatch, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exact_length_overrun_detected_incrementally() {
        let mut source = cursor(&[0u8; 200]);
        let mut destination = Cursor::new(Vec::new());

        let result = copy_stream(
            &mut source,
            &mut destination,
            &CopyOptions::unbounded().with_exact_length(100),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(CopyError::LengthMismatch { .. })));
    }

    #[tokio::test]
    async fn test_max_length_overrun_aborts_before_full_consumption() {
        // An endless source: the copy must abort on the overrun, not drain it.
        let mut source = tokio::io::repeat(0x5a);
        let mut destination = Cursor::new(Vec::new());

        let result = copy_stream(
            &mut source,
            &mut destination,
            &CopyOptions::unbounded().with_max_length(50),
            &CancellationToken::new(),
        )
        .await;

        match result {
            Err(CopyError::LengthExceeded { limit, actual }) => {
                assert_eq!(limit, 50);
                // Detected within the first buffered chunk.
                assert!(actual <= COPY_BUFFER_SIZE as u64);
            }
            other => panic!("expected LengthExceeded, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_max_length_exact_fit_succeeds() {
        let mut source = cursor(&[7u8; 50]);
        let mut destination = Cursor::new(Vec::new());

        let outcome = copy_stream(
            &mut source,
            &mut destination,
            &CopyOptions::unbounded().with_max_length(50),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.bytes_copied, 50);
    }

    #[tokio::test]
    async fn test_both_bounds_is_a_caller_error() {
        let mut source = cursor(b"data");
        let mut destination = Cursor::new(Vec::new());
        let options = CopyOptions {
            exact_length: Some(4),
            max_length: Some(4),
            checksum: ChecksumMode::None,
        };

        let result = copy_stream(
            &mut source,
            &mut destination,
            &options,
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(CopyError::InvalidBounds { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_without_digest() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut source = cursor(&[0u8; 1024]);
        let mut destination = Cursor::new(Vec::new());

        let result = copy_stream(
            &mut source,
            &mut destination,
            &CopyOptions::unbounded().with_checksum(ChecksumMode::Required),
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(CopyError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancellation_mid_copy_aborts() {
        /// Reader that cancels the token after the first chunk, then pends.
        struct CancelAfterFirst {
            served: bool,
            cancel: CancellationToken,
        }

        impl AsyncRead for CancelAfterFirst {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                if self.served {
                    self.cancel.cancel();
                    // Never ready again; cancellation must unblock the copy.
                    return std::task::Poll::Pending;
                }
                self.served = true;
                buf.put_slice(&[1u8; 16]);
                std::task::Poll::Ready(Ok(()))
            }
        }

        let cancel = CancellationToken::new();
        let mut source = CancelAfterFirst {
            served: false,
            cancel: cancel.clone(),
        };
        let mut destination = Cursor::new(Vec::new());

        let result = copy_stream(
            &mut source,
            &mut destination,
            &CopyOptions::unbounded(),
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(CopyError::Cancelled)));
    }

    #[test]
    fn test_to_hex_formats_lowercase() {
        assert_eq!(to_hex(&[0x00, 0xab, 0xff]), "00abff");
    }
}
