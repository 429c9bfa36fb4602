//! Error handling for apconnect.
//!
//! Errors carry an [`ErrorKind`] modelled on gRPC status codes plus the
//! underlying cause. Wire-level failures of the access point protocol are
//! described by [`ProtocolError`] and converted into the matching kind:
//!
//! | Failure            | Kind                 | Fatal |
//! |--------------------|----------------------|-------|
//! | `Timeout`          | `DeadlineExceeded`   | yes   |
//! | `LengthMismatch`   | (logged only)        | no    |
//! | `SignatureInvalid` | `PermissionDenied`   | yes   |
//! | `LoginRejected`    | `Unauthenticated`    | yes   |
//! | `MacMismatch`      | `DataLoss`           | yes   |
//! | `NonceExhausted`   | `ResourceExhausted`  | yes   |
//!
//! A socket closed by the peer is not an error: the session simply ends.
//!
//! # Example
//!
//! ```rust
//! use apconnect::error::{Error, ErrorKind, ProtocolError, Result};
//!
//! fn verify(ok: bool) -> Result<()> {
//!     if !ok {
//!         return Err(ProtocolError::SignatureInvalid.into());
//!     }
//!     Ok(())
//! }
//!
//! let err = verify(false).unwrap_err();
//! assert_eq!(err.kind, ErrorKind::PermissionDenied);
//! ```

#![allow(clippy::enum_glob_use)]

use std::{fmt, time::Duration};

use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    /// Attempts to downcast the underlying error to a concrete type.
    ///
    /// Callers use this to tell protocol failures apart:
    ///
    /// ```rust
    /// use apconnect::error::{Error, ProtocolError};
    ///
    /// let error = Error::from(ProtocolError::MacMismatch);
    /// assert_eq!(error.downcast::<ProtocolError>(), Some(&ProtocolError::MacMismatch));
    /// ```
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

/// Standard result type for apconnect operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories based on gRPC status codes.
///
/// See [gRPC status codes](https://github.com/googleapis/googleapis/blob/master/google/rpc/code.proto)
/// for the original definitions.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum ErrorKind {
    #[error("operation was cancelled")]
    Cancelled = 1,

    #[error("unknown error")]
    Unknown = 2,

    #[error("invalid argument specified")]
    InvalidArgument = 3,

    #[error("operation timed out")]
    DeadlineExceeded = 4,

    #[error("not found")]
    NotFound = 5,

    #[error("attempt to create what already exists")]
    AlreadyExists = 6,

    #[error("permission denied")]
    PermissionDenied = 7,

    #[error("no valid authentication credentials")]
    Unauthenticated = 16,

    #[error("resource has been exhausted")]
    ResourceExhausted = 8,

    #[error("invalid state")]
    FailedPrecondition = 9,

    #[error("operation aborted")]
    Aborted = 10,

    #[error("out of range")]
    OutOfRange = 11,

    #[error("not implemented")]
    Unimplemented = 12,

    #[error("internal error")]
    Internal = 13,

    #[error("service unavailable")]
    Unavailable = 14,

    #[error("unrecoverable data loss or corruption")]
    DataLoss = 15,
}

/// Failures of the access point wire protocol.
///
/// Every variant except [`LengthMismatch`](Self::LengthMismatch) ends the
/// handshake or session it occurs in. Retrying is up to the caller.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// No (complete) answer within the allotted time.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The declared length prefix disagrees with the bytes received.
    #[error("length prefix declares {declared} bytes but {actual} were received")]
    LengthMismatch { declared: usize, actual: usize },

    /// The server's Diffie-Hellman value is not signed by the access point key.
    #[error("server key signature invalid")]
    SignatureInvalid,

    /// The server's Diffie-Hellman value is outside `[2, p - 2]`.
    #[error("server public value out of range")]
    InvalidPublicValue,

    /// The access point did not accept the login.
    #[error("login rejected: {0}")]
    LoginRejected(String),

    /// The packet tag does not match the receive cipher state.
    ///
    /// Both cipher states are desynchronized from here on.
    #[error("packet authentication tag mismatch")]
    MacMismatch,

    /// The per-direction packet counter would wrap around.
    #[error("nonce counter exhausted")]
    NonceExhausted,

    /// A payload does not fit its length prefix.
    #[error("{what} of {len} bytes exceeds {max} bytes")]
    PacketTooLarge {
        what: &'static str,
        len: usize,
        max: usize,
    },
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    /// Creates an error for operations that were interrupted mid-execution,
    /// such as a connection reset by the peer.
    pub fn aborted<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Aborted, error)
    }

    pub fn already_exists<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::AlreadyExists, error)
    }

    /// Creates an error for cancelled operations.
    pub fn cancelled<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Cancelled, error)
    }

    /// Creates an error for data corruption or loss.
    ///
    /// Use when the byte stream can no longer be trusted, for example after
    /// a truncated packet or a tag mismatch.
    pub fn data_loss<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::DataLoss, error)
    }

    /// Creates an error for operations that exceeded their deadline.
    pub fn deadline_exceeded<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::DeadlineExceeded, error)
    }

    /// Creates an error for unexpected internal errors.
    pub fn internal<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Internal, error)
    }

    /// Creates an error for malformed input, whether from the caller or
    /// from the wire.
    pub fn invalid_argument<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::InvalidArgument, error)
    }

    pub fn not_found<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::NotFound, error)
    }

    /// Creates an error for values that fall outside their valid range.
    pub fn out_of_range<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::OutOfRange, error)
    }

    pub fn permission_denied<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::PermissionDenied, error)
    }

    pub fn resource_exhausted<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::ResourceExhausted, error)
    }

    /// Creates an error for missing or rejected credentials.
    ///
    /// Use when the bearer token is unavailable or expired, or when the
    /// access point refuses the login.
    pub fn unauthenticated<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unauthenticated, error)
    }

    /// Creates an error for services that cannot be reached.
    pub fn unavailable<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unavailable, error)
    }

    pub fn unknown<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unknown, error)
    }
}

/// Returns the underlying error source.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Formats the error as "{kind}: {details}".
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

/// Converts protocol failures into their error kinds.
impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        use ProtocolError::*;
        match err {
            Timeout { .. } => Self::deadline_exceeded(err),
            LengthMismatch { .. } => Self::data_loss(err),
            SignatureInvalid | InvalidPublicValue => Self::permission_denied(err),
            LoginRejected(_) => Self::unauthenticated(err),
            MacMismatch => Self::data_loss(err),
            NonceExhausted => Self::resource_exhausted(err),
            PacketTooLarge { .. } => Self::out_of_range(err),
        }
    }
}

/// Converts IO errors into appropriate error kinds.
///
/// Maps standard IO errors to their logical equivalents:
/// * `NotFound` -> `NotFound`
/// * `ConnectionReset` -> `Aborted`
/// * `UnexpectedEof` -> `DataLoss`
/// * etc.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => Self::not_found(err),
            PermissionDenied => Self::permission_denied(err),
            AddrInUse | AlreadyExists => Self::already_exists(err),
            AddrNotAvailable | ConnectionRefused | NotConnected => Self::unavailable(err),
            BrokenPipe | ConnectionReset | ConnectionAborted => Self::aborted(err),
            Interrupted | WouldBlock => Self::cancelled(err),
            UnexpectedEof => Self::data_loss(err),
            TimedOut => Self::deadline_exceeded(err),
            InvalidInput | InvalidData => Self::invalid_argument(err),
            WriteZero => Self::resource_exhausted(err),
            _ => Self::unknown(err),
        }
    }
}

/// Converts Protocol Buffer errors to `InvalidArgument`.
impl From<protobuf::Error> for Error {
    fn from(err: protobuf::Error) -> Self {
        Self::invalid_argument(err)
    }
}

/// Converts RSA errors to `Internal`.
///
/// Signature mismatches never take this path: they are reported as
/// [`ProtocolError::SignatureInvalid`].
impl From<rsa::Error> for Error {
    fn from(err: rsa::Error) -> Self {
        Self::internal(err.to_string())
    }
}

/// Converts MAC key length errors to `Internal`.
impl From<hmac::digest::InvalidLength> for Error {
    fn from(err: hmac::digest::InvalidLength) -> Self {
        Self::internal(err.to_string())
    }
}

/// Converts timeout errors to `DeadlineExceeded`.
impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::deadline_exceeded(e.to_string())
    }
}

/// Converts task join errors: panics are `Internal`, cancellations are
/// `Cancelled`.
impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Self::cancelled(e.to_string())
        } else {
            Self::internal(e.to_string())
        }
    }
}

/// Converts TOML parsing errors to `InvalidArgument`.
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts UTF-8 errors to `InvalidArgument`.
impl From<std::string::FromUtf8Error> for Error {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Self::invalid_argument(e)
    }
}
