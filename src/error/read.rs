//! Contains the error for read operations.

use crate::error::deserialize::DeserializeError;
use crate::error::{StatusError, WalkError};
use std::error::Error;
use std::fmt;
use std::io;

/// Custom error type for reads (get, ttl, range, has, count and friends).
///
/// Note that an absent, expired or checksum-invalid record is not an error- those reads
/// return a "none" value.  This error covers the cases where the store itself could not
/// be consulted.
#[derive(Debug)]
pub enum ReadError {
    /// The status machine refused the read (store busy being recreated).
    Status(StatusError),
    /// The record chain could not be walked.
    Walk(WalkError),
    /// The stored bytes could not be deserialized into the value type.
    Deserialize(DeserializeError),
    /// An underlying IO error.
    IO(io::Error),
}

impl Error for ReadError {}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::Status(e) => write!(f, "status: {}", e),
            Self::Walk(e) => write!(f, "walk: {}", e),
            Self::Deserialize(e) => write!(f, "deserialize: {}", e),
            Self::IO(e) => write!(f, "io: {}", e),
        }
    }
}

impl From<StatusError> for ReadError {
    fn from(err: StatusError) -> Self {
        Self::Status(err)
    }
}

impl From<WalkError> for ReadError {
    fn from(err: WalkError) -> Self {
        Self::Walk(err)
    }
}

impl From<DeserializeError> for ReadError {
    fn from(err: DeserializeError) -> Self {
        Self::Deserialize(err)
    }
}

impl From<io::Error> for ReadError {
    fn from(io_err: io::Error) -> Self {
        Self::IO(io_err)
    }
}
