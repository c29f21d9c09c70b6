//! Contains the error for write operations.

use crate::error::serialize::SerializeError;
use crate::error::{StatusError, WalkError};
use std::error::Error;
use std::fmt;
use std::io;

/// Custom error type for writes (set, remove, increase, the list mutations and friends).
#[derive(Debug)]
pub enum WriteError {
    /// The status machine refused the write after its retry budget.
    Status(StatusError),
    /// The record chain could not be walked.
    Walk(WalkError),
    /// Error serializing the value to store.
    Serialize(SerializeError),
    /// Keys must not be empty.
    EmptyKey,
    /// Keys are limited to 65,535 bytes by the record format.
    KeyTooLong,
    /// The operation needed an existing key or pivot value that was absent.
    NotFound,
    /// A positional argument was outside the list.
    BadIndex,
    /// An underlying IO error.
    IO(io::Error),
}

impl Error for WriteError {}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::Status(e) => write!(f, "status: {}", e),
            Self::Walk(e) => write!(f, "walk: {}", e),
            Self::Serialize(e) => write!(f, "serialize: {}", e),
            Self::EmptyKey => write!(f, "empty key"),
            Self::KeyTooLong => write!(f, "key longer than 65535 bytes"),
            Self::NotFound => write!(f, "key or pivot not found"),
            Self::BadIndex => write!(f, "index out of range"),
            Self::IO(e) => write!(f, "io: {}", e),
        }
    }
}

impl From<StatusError> for WriteError {
    fn from(err: StatusError) -> Self {
        Self::Status(err)
    }
}

impl From<WalkError> for WriteError {
    fn from(err: WalkError) -> Self {
        Self::Walk(err)
    }
}

impl From<SerializeError> for WriteError {
    fn from(err: SerializeError) -> Self {
        Self::Serialize(err)
    }
}

impl From<io::Error> for WriteError {
    fn from(io_err: io::Error) -> Self {
        Self::IO(io_err)
    }
}
