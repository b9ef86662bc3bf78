//! The error currency of Sluice.
//!
//! Every zone operation, event handler and control command reports one of
//! these codes.  Module-specific failures are mapped into the taxonomy at
//! the point where they cross into the event machinery, so blockers and
//! control callers always observe a plain code.

use std::fmt;
use std::io;

//----------- Error ------------------------------------------------------------

/// An operational error code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// A bad argument, malformed input or semantic contradiction.
    Invalid,

    /// A key or zone is absent.
    NotFound,

    /// A key or zone already exists.
    Exists,

    /// An allocation failed.
    OutOfMemory,

    /// Journal or disk limits were exceeded.
    OutOfSpace,

    /// A cooperative "flush and retry" signal; not a failure.
    Busy,

    /// An ACL or TSIG check failed.
    Denied,

    /// A DNSSEC signature is outside its validity window.
    Expired,

    /// A DNSSEC signature failed cryptographic verification.
    InvalidSignature,

    /// An I/O deadline elapsed.
    Timeout,

    /// An unrecoverable failure; the affected zone shuts down.
    Fatal,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Invalid => "invalid parameter or malformed data",
            Self::NotFound => "no such zone or key",
            Self::Exists => "the zone or key already exists",
            Self::OutOfMemory => "out of memory",
            Self::OutOfSpace => "storage limits exceeded",
            Self::Busy => "busy, retry after flush",
            Self::Denied => "operation denied",
            Self::Expired => "the signature validity window has passed",
            Self::InvalidSignature => "the signature is invalid",
            Self::Timeout => "the operation timed out",
            Self::Fatal => "fatal failure",
        })
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::AlreadyExists => Self::Exists,
            io::ErrorKind::PermissionDenied => Self::Denied,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::OutOfMemory => Self::OutOfMemory,
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => Self::OutOfSpace,
            _ => Self::Fatal,
        }
    }
}

impl From<sluice_base::wire::ParseError> for Error {
    fn from(_: sluice_base::wire::ParseError) -> Self {
        Self::Invalid
    }
}

impl From<sluice_base::changeset::SerialStepError> for Error {
    fn from(_: sluice_base::changeset::SerialStepError) -> Self {
        Self::Invalid
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::CollectionNotFound(_) => Self::NotFound,
            sled::Error::Unsupported(_) => Self::Invalid,
            sled::Error::Io(err) => err.into(),
            _ => Self::Fatal,
        }
    }
}

/// The result of a zone operation.
pub type Result<T> = std::result::Result<T, Error>;
