//! Contains the error for the online compaction.

use crate::error::write::WriteError;
use crate::error::{LoadHeaderError, StatusError, WalkError};
use std::error::Error;
use std::fmt;
use std::io;

/// Custom error type for optimize().
#[derive(Debug)]
pub enum OptimizeError {
    /// The status machine refused access to the store.
    Status(StatusError),
    /// Error loading a global header during the protocol.
    Header(LoadHeaderError),
    /// The rename of the store to its `.op` name kept failing.
    Rename(io::Error),
    /// A chain walk of the old store failed.
    Walk(WalkError),
    /// Re-inserting a record into the new store failed.
    Backfill(WriteError),
    /// An underlying IO error.
    IO(io::Error),
}

impl Error for OptimizeError {}

impl fmt::Display for OptimizeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Self::Status(e) => write!(f, "status: {}", e),
            Self::Header(e) => write!(f, "header: {}", e),
            Self::Rename(e) => write!(f, "rename: {}", e),
            Self::Walk(e) => write!(f, "walk: {}", e),
            Self::Backfill(e) => write!(f, "backfill: {}", e),
            Self::IO(e) => write!(f, "io: {}", e),
        }
    }
}

impl From<StatusError> for OptimizeError {
    fn from(err: StatusError) -> Self {
        Self::Status(err)
    }
}

impl From<LoadHeaderError> for OptimizeError {
    fn from(err: LoadHeaderError) -> Self {
        Self::Header(err)
    }
}

impl From<WalkError> for OptimizeError {
    fn from(err: WalkError) -> Self {
        Self::Walk(err)
    }
}

impl From<WriteError> for OptimizeError {
    fn from(err: WriteError) -> Self {
        Self::Backfill(err)
    }
}

impl From<io::Error> for OptimizeError {
    fn from(io_err: io::Error) -> Self {
        Self::IO(io_err)
    }
}
