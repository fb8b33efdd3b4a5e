//! Error types and the host-facing error result convention.
//!
//! Every fallible operation returns [`Result`]. Failures fall in three
//! groups that hosts treat differently:
//!
//! - Resource failures ([`CascLibError::InvalidHandle`]) and engine failures
//!   ([`CascLibError::Engine`]) are runtime conditions. They convert into an
//!   [`ErrorResult`] (message plus native error number) so a host can branch
//!   on them without unwinding.
//! - Argument and configuration failures are programming errors. They have no
//!   error result and should abort the host call.
//!
//! End of stream is never an error; reads report it as `None`.

use std::io;
use thiserror::Error;

/// Native error numbers used by the archive engines.
///
/// CascLib's portability layer maps its Windows error names onto errno
/// values on other platforms; the engines in this crate report the same
/// numbers so hosts see identical codes regardless of backend.
pub mod codes {
    /// Operation succeeded.
    pub const ERROR_SUCCESS: i32 = 0;
    /// Entry or storage does not exist.
    pub const ERROR_FILE_NOT_FOUND: i32 = 2;
    /// Low-level I/O failure.
    pub const ERROR_READ_FAULT: i32 = 5;
    /// Handle is closed or was never opened.
    pub const ERROR_INVALID_HANDLE: i32 = 9;
    /// Access to the entry was refused.
    pub const ERROR_ACCESS_DENIED: i32 = 13;
    /// Parameter outside the accepted range.
    pub const ERROR_INVALID_PARAMETER: i32 = 22;
    /// Operation not available for this storage kind.
    pub const ERROR_NOT_SUPPORTED: i32 = 95;
    /// Stored data failed validation.
    pub const ERROR_FILE_CORRUPT: i32 = 1004;
}

/// Result type for casclib operations.
pub type Result<T> = std::result::Result<T, CascLibError>;

/// Result type for raw engine calls.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Failure reported by an archive engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EngineError {
    /// Native error number.
    pub code: i32,
    /// Platform text for the error.
    pub message: String,
}

impl EngineError {
    /// Create an engine error with an explicit message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create an engine error carrying the standard text for `code`.
    pub fn from_code(code: i32) -> Self {
        Self::new(code, describe_code(code).unwrap_or("Unknown error"))
    }

    /// Entry or storage does not exist.
    pub fn not_found() -> Self {
        Self::from_code(codes::ERROR_FILE_NOT_FOUND)
    }

    /// Handle unknown to the engine.
    pub fn invalid_handle() -> Self {
        Self::from_code(codes::ERROR_INVALID_HANDLE)
    }

    /// Parameter outside the accepted range.
    pub fn invalid_parameter() -> Self {
        Self::from_code(codes::ERROR_INVALID_PARAMETER)
    }

    /// Operation not available.
    pub fn not_supported() -> Self {
        Self::from_code(codes::ERROR_NOT_SUPPORTED)
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        let code = err.raw_os_error().unwrap_or_else(|| match err.kind() {
            io::ErrorKind::NotFound => codes::ERROR_FILE_NOT_FOUND,
            io::ErrorKind::PermissionDenied => codes::ERROR_ACCESS_DENIED,
            io::ErrorKind::InvalidInput => codes::ERROR_INVALID_PARAMETER,
            io::ErrorKind::InvalidData => codes::ERROR_FILE_CORRUPT,
            io::ErrorKind::Unsupported => codes::ERROR_NOT_SUPPORTED,
            _ => codes::ERROR_READ_FAULT,
        });
        match describe_code(code) {
            Some(text) => Self::new(code, text),
            None => Self::new(code, err.to_string()),
        }
    }
}

/// Standard text for a native error number known to this crate.
pub fn describe_code(code: i32) -> Option<&'static str> {
    let text = match code {
        codes::ERROR_SUCCESS => "Success",
        codes::ERROR_FILE_NOT_FOUND => "No such file or directory",
        codes::ERROR_READ_FAULT => "Input/output error",
        codes::ERROR_INVALID_HANDLE => "Bad file descriptor",
        codes::ERROR_ACCESS_DENIED => "Permission denied",
        codes::ERROR_INVALID_PARAMETER => "Invalid argument",
        codes::ERROR_NOT_SUPPORTED => "Operation not supported",
        codes::ERROR_FILE_CORRUPT => "File is corrupt",
        _ => return None,
    };
    Some(text)
}

/// Errors surfaced by storages, files and finders.
#[derive(Debug, Error)]
pub enum CascLibError {
    /// Operation attempted on a closed storage, file or finder.
    #[error("Bad file descriptor")]
    InvalidHandle,

    /// The archive engine rejected the call.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Malformed option, format, mode or pattern.
    #[error("bad argument to '{function}' ({message})")]
    InvalidArgument {
        /// Operation that rejected the argument.
        function: &'static str,
        /// What was wrong with it.
        message: String,
    },

    /// Configuration cannot be used.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Host-facing failure: message and native error number.
///
/// Hosts that follow the `nil, message, code` convention return these two
/// values after their nil-equivalent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResult {
    /// Platform text for the error.
    pub message: String,
    /// Native error number.
    pub code: i32,
}

impl CascLibError {
    pub(crate) fn argument(function: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            function,
            message: message.into(),
        }
    }

    /// Native error number, if this error has one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::InvalidHandle => Some(codes::ERROR_INVALID_HANDLE),
            Self::Engine(err) => Some(err.code),
            Self::InvalidArgument { .. } | Self::Config(_) => None,
        }
    }

    /// Convert into the host error result.
    ///
    /// Returns `None` for argument and configuration errors; those are raised
    /// rather than returned.
    pub fn to_error_result(&self) -> Option<ErrorResult> {
        self.code().map(|code| ErrorResult {
            message: self.to_string(),
            code,
        })
    }

    /// Whether the error is a caller programming error.
    pub fn is_argument_error(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. } | Self::Config(_))
    }

    /// Whether the error is the closed-handle condition.
    pub fn is_invalid_handle(&self) -> bool {
        matches!(self, Self::InvalidHandle)
    }
}

impl From<CascLibError> for io::Error {
    fn from(err: CascLibError) -> Self {
        let kind = match err.code() {
            Some(codes::ERROR_FILE_NOT_FOUND) => io::ErrorKind::NotFound,
            Some(codes::ERROR_ACCESS_DENIED) => io::ErrorKind::PermissionDenied,
            Some(codes::ERROR_FILE_CORRUPT) => io::ErrorKind::InvalidData,
            Some(codes::ERROR_NOT_SUPPORTED) => io::ErrorKind::Unsupported,
            Some(codes::ERROR_INVALID_PARAMETER) | None => io::ErrorKind::InvalidInput,
            Some(_) => io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}
