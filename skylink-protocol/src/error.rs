//! Error handling for the Skylink SDK
//!
//! This module provides the error type shared by every SDK component.
//! Underlying library errors are converted automatically with `thiserror`,
//! and network I/O errors can be refined into more specific variants with
//! [`SdkError::from_io_error`].
//!
//! ## Error Handling Patterns
//!
//! ### Basic Usage
//!
//! ```rust
//! use skylink_protocol::Result;
//!
//! fn parse_config(data: &[u8]) -> Result<serde_json::Value> {
//!     // Errors are automatically converted using the From trait
//!     let value: serde_json::Value = serde_json::from_slice(data)?;
//!     Ok(value)
//! }
//! ```
//!
//! ### Error Matching
//!
//! Match on specific variants for custom handling:
//!
//! ```rust
//! use skylink_protocol::SdkError;
//!
//! fn describe(error: &SdkError) -> &'static str {
//!     match error {
//!         SdkError::Busy(_) => "try again once the current session ends",
//!         SdkError::Rejected(_) => "the device refused the connection",
//!         SdkError::Timeout => "the device stopped acknowledging",
//!         _ => "see the error message",
//!     }
//! }
//! ```
//!
//! ## Completion statuses vs errors
//!
//! Per-request completion statuses (`Ok`/`Failed`/`Canceled`/`Aborted`) are
//! *not* errors: they are delivered exactly once on the request's status
//! channel. `SdkError` covers everything rejected before a request is
//! accepted, plus transport and codec failures.

use thiserror::Error;

/// Result type for SDK operations
///
/// A type alias for `Result<T, SdkError>` that simplifies error handling
/// throughout the SDK.
///
/// # Examples
///
/// ```rust
/// use skylink_protocol::Result;
///
/// fn example() -> Result<()> {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, SdkError>;

/// Errors surfaced by the Skylink SDK
///
/// The variants form the authoritative error taxonomy of the SDK; callers
/// should match on them rather than on message strings.
///
/// # Automatic Conversions
///
/// The following types automatically convert to `SdkError`:
/// - `std::io::Error` → [`SdkError::Io`]
/// - `serde_json::Error` → [`SdkError::Json`]
#[derive(Error, Debug)]
pub enum SdkError {
    /// Null, empty or out-of-range input, rejected before any side effect
    ///
    /// # Examples
    ///
    /// ```rust
    /// use skylink_protocol::SdkError;
    ///
    /// let error = SdkError::invalid_argument("empty device name");
    /// assert_eq!(error.to_string(), "invalid argument: empty device name");
    /// ```
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Duplicate session of the same kind, double-connect, or duplicate
    /// registration
    ///
    /// # Examples
    ///
    /// ```rust
    /// use skylink_protocol::SdkError;
    ///
    /// let error = SdkError::Busy("media list session already active".to_string());
    /// assert!(error.to_string().starts_with("busy:"));
    /// ```
    #[error("busy: {0}")]
    Busy(String),

    /// Operation issued in the wrong state
    ///
    /// Typical example: creating a command interface before the device
    /// reached `connected`.
    #[error("not permitted: {0}")]
    NotPermitted(String),

    /// Handle unknown, device absent, or listener already removed
    ///
    /// # Examples
    ///
    /// ```rust
    /// use skylink_protocol::SdkError;
    ///
    /// let error = SdkError::NotFound("device 0x1234".to_string());
    /// assert_eq!(error.to_string(), "not found: device 0x1234");
    /// ```
    #[error("not found: {0}")]
    NotFound(String),

    /// FTP response mismatch, socket error or disk error
    ///
    /// Carries the protocol response code or errno-style code when one
    /// exists, `-1` otherwise.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use skylink_protocol::SdkError;
    ///
    /// let error = SdkError::io_failed(550, "RETR refused");
    /// assert_eq!(error.to_string(), "io failed (code 550): RETR refused");
    /// ```
    #[error("io failed (code {code}): {msg}")]
    IoFailed {
        /// Protocol response code or negated errno
        code: i32,
        /// Human-readable failure context
        msg: String,
    },

    /// User-initiated cancellation
    ///
    /// Distinguished from [`SdkError::Aborted`] so callers can tell their
    /// own cancellation apart from an internal teardown.
    #[error("canceled")]
    Canceled,

    /// Internal teardown while the request was pending
    #[error("aborted")]
    Aborted,

    /// Ack-retry budget exhausted on a with-ack command
    ///
    /// # Examples
    ///
    /// ```rust
    /// use skylink_protocol::SdkError;
    ///
    /// let error = SdkError::Timeout;
    /// assert!(error.is_recoverable());
    /// ```
    #[error("timeout")]
    Timeout,

    /// Connection handshake refused by the peer, or negotiated protocol
    /// version outside the supported range
    ///
    /// Carries the peer's non-zero status code, or `-1` for a version
    /// mismatch.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use skylink_protocol::SdkError;
    ///
    /// let error = SdkError::Rejected(2);
    /// assert_eq!(error.to_string(), "rejected by peer (status 2)");
    /// ```
    #[error("rejected by peer (status {0})")]
    Rejected(i32),

    /// Mux feature requested but no mux context is available
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// I/O error (file system, network, etc.)
    ///
    /// Automatically converted from `std::io::Error`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use skylink_protocol::{Result, SdkError};
    ///
    /// fn read_trace() -> Result<Vec<u8>> {
    ///     // IO errors automatically convert to SdkError::Io
    ///     Ok(std::fs::read("/tmp/trace.bin")?)
    /// }
    /// ```
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    ///
    /// Automatically converted from `serde_json::Error`.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SdkError {
    /// Convert a generic I/O error into a more specific variant
    ///
    /// Connection-shaped errors become [`SdkError::IoFailed`] with the OS
    /// error code attached, timeouts become [`SdkError::Timeout`]; everything
    /// else stays a plain [`SdkError::Io`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use skylink_protocol::SdkError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let io_error = Error::new(ErrorKind::TimedOut, "connection timeout");
    /// let error = SdkError::from_io_error(io_error, "connecting to device");
    /// assert!(matches!(error, SdkError::Timeout));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => SdkError::Timeout,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => SdkError::IoFailed {
                code: error.raw_os_error().unwrap_or(-1),
                msg: format!("{}: {}", context, error),
            },
            _ => SdkError::Io(error),
        }
    }

    /// Whether the error is transient and the operation can be retried
    ///
    /// Retryable low-level errors are never surfaced to per-request
    /// completion callbacks; this predicate decides that policy.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use skylink_protocol::SdkError;
    ///
    /// assert!(SdkError::Timeout.is_recoverable());
    /// assert!(!SdkError::Rejected(2).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SdkError::Timeout | SdkError::IoFailed { .. } | SdkError::Io(_)
        )
    }

    /// Create an invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        SdkError::InvalidArgument(msg.into())
    }

    /// Create a not-permitted error
    pub fn not_permitted(msg: impl Into<String>) -> Self {
        SdkError::NotPermitted(msg.into())
    }

    /// Create an io-failed error with its protocol or errno code
    pub fn io_failed(code: i32, msg: impl Into<String>) -> Self {
        SdkError::IoFailed {
            code,
            msg: msg.into(),
        }
    }
}
