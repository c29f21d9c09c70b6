//! Define the deserialization error.

use std::error::Error;
use std::fmt;

/// Error type for deserialization of stored bytes by a
/// [`crate::store_bytes::StoreBytes`] impl.
#[derive(Debug)]
pub struct DeserializeError {
    message: String,
}

impl Error for DeserializeError {}

impl fmt::Display for DeserializeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl DeserializeError {
    /// Create a new DeserializeError with a message.
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}
