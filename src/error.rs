//! Errors shared by every layer of the container.

use std::io;
use thiserror::Error;

/// Result alias used by all fallible container operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An error surfaced by the container engine.
///
/// Nothing is retried internally. Every error propagates to the caller, which
/// is responsible for mapping it to user-visible filesystem errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A parameter is out of range or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The operation is not allowed in the current state of the container.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The block handle was taken before the last compaction and may point at
    /// the wrong physical location.
    #[error("stale block handle: the mapping version changed")]
    StaleHandle,
    /// The operation was attempted from a thread that does not own the
    /// container.
    #[error("the container is owned by another thread")]
    WrongOwner,
    /// An operation on the backing file failed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Every logical block address is in use.
    #[error("out of space: all block addresses are in use")]
    OutOfSpace,
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            e => io::Error::new(io::ErrorKind::Other, e),
        }
    }
}

/// Builds an [`Error::InvalidArgument`] from a format string.
macro_rules! invalid_arg {
    ($($arg:tt)*) => {
        $crate::error::Error::InvalidArgument(format!($($arg)*))
    };
}

/// Builds an [`Error::InvalidState`] from a format string.
macro_rules! invalid_state {
    ($($arg:tt)*) => {
        $crate::error::Error::InvalidState(format!($($arg)*))
    };
}

pub(crate) use invalid_arg;
pub(crate) use invalid_state;
