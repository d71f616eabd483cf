//! Error taxonomy for the handle layer.
//!
//! Every call into a [`Transport`] hands its raw result to [`check`] together
//! with the name of the calling operation. Negative status codes become one of
//! four typed errors; successful values pass through untouched.

use crate::transport::{RawResult, ReturnCode, Transport};
use std::io;
use thiserror::Error;

/// Result type for every handle operation.
pub type Result<T> = std::result::Result<T, Error>;

/// Discriminant of an [`Error`], for matching without destructuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller supplied a value or name the transport cannot accept.
    InvalidArgument,
    /// The transport or device reported an operational failure.
    Failure,
    /// The capability does not exist on this platform or device.
    NotSupported,
    /// The transport could not allocate a native resource.
    AllocationFailure,
}

/// A failed serial port operation.
///
/// The message always names the operation that failed. `Failure` additionally
/// carries the transport's last error message and platform error code, as
/// they stood when the failure was translated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Invalid argument passed to {function}")]
    InvalidArgument { function: &'static str },

    #[error("{function} failed: {message}")]
    Failure {
        function: &'static str,
        message: String,
        code: i32,
    },

    #[error("{function} not possible: requested operation unsupported")]
    NotSupported { function: &'static str },

    #[error("{function} failed: memory allocation failed")]
    AllocationFailure { function: &'static str },
}

impl Error {
    /// Translate a transport return code raised by `function`.
    ///
    /// For [`ReturnCode::Fail`] the transport is queried for its last error
    /// message and code, so this must run before any further transport call.
    pub fn from_return_code(
        code: ReturnCode,
        function: &'static str,
        transport: &dyn Transport,
    ) -> Self {
        match code {
            ReturnCode::Arg => Self::InvalidArgument { function },
            ReturnCode::Fail => {
                let last = transport.last_error();
                Self::Failure {
                    function,
                    message: last.message,
                    code: last.code,
                }
            }
            ReturnCode::Mem => Self::AllocationFailure { function },
            ReturnCode::Supp => Self::NotSupported { function },
        }
    }

    /// Shorthand for an argument rejected before reaching the transport.
    pub(crate) fn invalid_argument(function: &'static str) -> Self {
        Self::InvalidArgument { function }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Failure { .. } => ErrorKind::Failure,
            Self::NotSupported { .. } => ErrorKind::NotSupported,
            Self::AllocationFailure { .. } => ErrorKind::AllocationFailure,
        }
    }

    /// Name of the operation that failed.
    pub fn function(&self) -> &'static str {
        match self {
            Self::InvalidArgument { function }
            | Self::Failure { function, .. }
            | Self::NotSupported { function }
            | Self::AllocationFailure { function } => function,
        }
    }

    /// Platform error code, present only for `Failure`.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Failure { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::InvalidArgument { .. } => io::ErrorKind::InvalidInput,
            Error::Failure { code, .. } if *code != 0 => {
                io::Error::from_raw_os_error(*code).kind()
            }
            Error::Failure { .. } => io::ErrorKind::Other,
            Error::NotSupported { .. } => io::ErrorKind::Unsupported,
            Error::AllocationFailure { .. } => io::ErrorKind::OutOfMemory,
        };
        io::Error::new(kind, err)
    }
}

/// Translate a raw transport result raised by `function`.
///
/// This is the single translation step every handle operation goes through.
pub fn check<T>(
    transport: &dyn Transport,
    function: &'static str,
    result: RawResult<T>,
) -> Result<T> {
    result.map_err(|code| Error::from_return_code(code, function, transport))
}

/// Translate an integer status as returned by a C-style driver call.
///
/// Non-negative values are counts and pass through. Negative values outside
/// the known status table are treated as generic failures.
pub fn check_status(transport: &dyn Transport, function: &'static str, status: i32) -> Result<usize> {
    check(transport, function, ReturnCode::from_status(status))
}
