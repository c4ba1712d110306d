// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::libc::{
    c_int,
    ECANCELED,
    EIO,
    ESHUTDOWN,
    ETIMEDOUT,
};
use ::std::{
    error,
    fmt,
    io,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Failure
#[derive(Clone)]
pub struct Fail {
    /// Error code.
    pub errno: c_int,
    /// Cause.
    pub cause: String,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Failures
impl Fail {
    /// Creates a new Failure
    pub fn new(errno: i32, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
        }
    }

    /// Creates a Failure that carries a timeout outcome.
    pub fn timed_out(cause: &str) -> Self {
        Self::new(ETIMEDOUT, cause)
    }

    /// Creates a Failure that carries a cancellation outcome.
    pub fn cancelled(cause: &str) -> Self {
        Self::new(ECANCELED, cause)
    }

    /// Creates a Failure for operations attempted after shutdown.
    pub fn shutting_down(cause: &str) -> Self {
        Self::new(ESHUTDOWN, cause)
    }

    /// Checks whether this Failure carries a timeout outcome.
    pub fn is_timeout(&self) -> bool {
        self.errno == ETIMEDOUT
    }

    /// Checks whether this Failure carries a cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        self.errno == ECANCELED
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Display Trait Implementation for Failures
impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

/// Debug Trait Implementation for Failures
impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

/// Error Trait Implementation for Failures
impl error::Error for Fail {}

/// Conversion Trait Implementation for Failures
impl From<io::Error> for Fail {
    fn from(e: io::Error) -> Self {
        Self {
            errno: e.raw_os_error().unwrap_or(EIO),
            cause: e.to_string(),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Fail;
    use ::anyhow::Result;

    #[test]
    fn test_fail_outcome_queries() -> Result<()> {
        crate::ensure_eq!(Fail::timed_out("wait").is_timeout(), true);
        crate::ensure_eq!(Fail::timed_out("wait").is_cancelled(), false);
        crate::ensure_eq!(Fail::cancelled("wait").is_cancelled(), true);
        crate::ensure_eq!(Fail::new(libc::EINVAL, "bad argument").is_timeout(), false);

        Ok(())
    }

    #[test]
    fn test_fail_from_io_error_keeps_errno() -> Result<()> {
        let io_error = std::io::Error::from_raw_os_error(libc::ECONNREFUSED);
        let fail: Fail = io_error.into();
        crate::ensure_eq!(fail.errno, libc::ECONNREFUSED);

        Ok(())
    }
}
