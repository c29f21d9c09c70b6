//! Implements the errors for the store.
//!
//! Every public operation has its own error enum so callers can match on exactly the
//! failures that operation can produce.  Operations that wrap others carry the inner
//! error as a variant with a `From` impl.

pub mod deserialize;
pub mod optimize;
pub mod read;
pub mod serialize;
pub mod write;

use std::error::Error;
use std::fmt;
use std::io;

/// Error loading the 11-byte global file header.
#[derive(Debug)]
pub enum LoadHeaderError {
    /// A header field held an out-of-range byte- corrupted or not a store file.
    Format,
    /// An underlying IO error while loading the header.
    IO(io::Error),
}

impl Error for LoadHeaderError {}

impl fmt::Display for LoadHeaderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::Format => write!(f, "invalid header"),
            Self::IO(e) => write!(f, "io: {}", e),
        }
    }
}

impl From<io::Error> for LoadHeaderError {
    fn from(io_err: io::Error) -> Self {
        Self::IO(io_err)
    }
}

/// Error from the status machine that admits operations to the file.
#[derive(Debug)]
pub enum StatusError {
    /// The retry budget for a transitional status was exhausted.
    Busy,
    /// The status byte was corrupt.
    Header(LoadHeaderError),
    /// An underlying IO error while checking status.
    IO(io::Error),
}

impl Error for StatusError {}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::Busy => write!(f, "store busy, retries exhausted"),
            Self::Header(e) => write!(f, "header: {}", e),
            Self::IO(e) => write!(f, "io: {}", e),
        }
    }
}

impl From<io::Error> for StatusError {
    fn from(io_err: io::Error) -> Self {
        Self::IO(io_err)
    }
}

impl From<LoadHeaderError> for StatusError {
    fn from(err: LoadHeaderError) -> Self {
        Self::Header(err)
    }
}

/// Error walking a record chain.
#[derive(Debug)]
pub enum WalkError {
    /// The walk revisited an offset- the chain is corrupted into a cycle.
    Cycle,
    /// A record header could not be read at a chain offset.
    Format,
    /// An underlying IO error during the walk.
    IO(io::Error),
}

impl Error for WalkError {}

impl fmt::Display for WalkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::Cycle => write!(f, "record chain contains a cycle"),
            Self::Format => write!(f, "invalid record header"),
            Self::IO(e) => write!(f, "io: {}", e),
        }
    }
}

impl From<io::Error> for WalkError {
    fn from(io_err: io::Error) -> Self {
        // A short read in the middle of a record header means the offset does not point
        // at a full record, which is a format problem not an IO failure.
        if io_err.kind() == io::ErrorKind::UnexpectedEof {
            Self::Format
        } else {
            Self::IO(io_err)
        }
    }
}

/// Error opening a store.
#[derive(Debug)]
pub enum OpenError {
    /// No usable path was configured (empty, or the parent is not writable).
    Config(String),
    /// Error loading the global header of an existing file.
    LoadHeader(LoadHeaderError),
    /// Error from the status machine while recreating the file.
    Status(StatusError),
    /// An underlying IO error during open or creation.
    IO(io::Error),
}

impl Error for OpenError {}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::Config(msg) => write!(f, "config: {}", msg),
            Self::LoadHeader(e) => write!(f, "header: {}", e),
            Self::Status(e) => write!(f, "status: {}", e),
            Self::IO(e) => write!(f, "io: {}", e),
        }
    }
}

impl From<io::Error> for OpenError {
    fn from(io_err: io::Error) -> Self {
        Self::IO(io_err)
    }
}

impl From<LoadHeaderError> for OpenError {
    fn from(err: LoadHeaderError) -> Self {
        Self::LoadHeader(err)
    }
}

impl From<StatusError> for OpenError {
    fn from(err: StatusError) -> Self {
        Self::Status(err)
    }
}
