//! Error kinds surfaced by convolution and deconvolution calls.
//!
//! Every failure is reported synchronously to the caller of the top-level
//! operation. The four categories mirror who is responsible: `User` for
//! invalid input, `Allocation` for storage or plan allocation failures,
//! `Internal` for violated library invariants and `Numeric` for unrecoverable
//! numeric conditions detected during iteration.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors reported by the deconvolution library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid input from the caller: missing PSF, data length inconsistent
    /// with the given dimensions, non-positive SNR.
    User(String),
    /// Storage or plan allocation failed.
    Allocation(String),
    /// A library invariant was violated. Indicates a bug in this crate, not
    /// in the caller; the message carries the file and line of origin.
    Internal(String),
    /// An unrecoverable numeric condition, such as a negative first estimate
    /// of the regularization factor.
    Numeric(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::User(msg) => write!(f, "UserError: {msg}"),
            Error::Allocation(msg) => write!(f, "AllocationError: {msg}"),
            Error::Internal(msg) => write!(f, "InternalError: {msg}"),
            Error::Numeric(msg) => write!(f, "NumericError: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

/// Builds an [`Error::Internal`] carrying the file and line of origin.
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::error::Error::Internal(
            format!("[{}:{}] {}", file!(), line!(), format_args!($($arg)*)),
        )
    };
}

pub(crate) use internal_error;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_category() {
        let err = Error::User("no point spread function set".into());
        assert_eq!(
            err.to_string(),
            "UserError: no point spread function set"
        );

        let err = internal_error!("buffer length {} is odd", 3);
        match &err {
            Error::Internal(msg) => {
                assert!(msg.contains("error.rs"));
                assert!(msg.ends_with("buffer length 3 is odd"));
            }
            other => panic!("unexpected error kind: {other:?}"),
        }
    }
}
