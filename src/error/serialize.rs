//! Define the serialization error.

use std::error::Error;
use std::fmt;

/// Error type for serialization of a value by a [`crate::store_bytes::StoreBytes`] impl.
#[derive(Debug)]
pub struct SerializeError {
    message: String,
}

impl Error for SerializeError {}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl SerializeError {
    /// Create a new SerializeError with a message.
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}
