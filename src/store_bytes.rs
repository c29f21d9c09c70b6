//! Contains the traits needed to serialize/deserialize store values.
//!
//! Values are stored as opaque byte strings; the [`StoreBytes`] pair is the hook that
//! turns a user type into those bytes and back.  The CRC32 stored with each record is
//! computed over the serialized bytes, so two values compare equal for list searches
//! exactly when their serializations do.

use crate::error::deserialize::DeserializeError;
use crate::error::serialize::SerializeError;

/// Trait that all value types must implement to convert to and from bytes for the store.
pub trait StoreBytes<T> {
    /// Serialize the type into buffer.
    /// Buffer is expected to contain exactly the serialized type and nothing more.
    /// Implementations can make no assumptions about the state of the buffer passed in.
    /// Resizing the buffer is expected (why it is a Vec not a slice) and may already have
    /// sufficient capacity.
    fn serialize(&self, buffer: &mut Vec<u8>) -> Result<(), SerializeError>;

    /// Deserialize a byte slice back into the type or error out.
    fn deserialize(buffer: &[u8]) -> Result<T, DeserializeError>;
}

impl StoreBytes<String> for String {
    fn serialize(&self, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        let bytes = self.as_bytes();
        buffer.resize(bytes.len(), 0);
        buffer.copy_from_slice(bytes);
        Ok(())
    }

    fn deserialize(buffer: &[u8]) -> Result<String, DeserializeError> {
        Ok(String::from_utf8_lossy(buffer).to_string())
    }
}

/// Allow raw bytes to be used as a value.
impl StoreBytes<Vec<u8>> for Vec<u8> {
    fn serialize(&self, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.resize(self.len(), 0);
        buffer.copy_from_slice(self);
        Ok(())
    }

    fn deserialize(buffer: &[u8]) -> Result<Vec<u8>, DeserializeError> {
        let mut v = vec![0_u8; buffer.len()];
        v.copy_from_slice(buffer);
        Ok(v)
    }
}

impl StoreBytes<u32> for u32 {
    fn serialize(&self, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.resize(4, 0);
        buffer.copy_from_slice(&self.to_le_bytes());
        Ok(())
    }

    fn deserialize(buffer: &[u8]) -> Result<u32, DeserializeError> {
        if buffer.len() != 4 {
            return Err(DeserializeError::new(format!(
                "expected 4 bytes for a u32, got {}",
                buffer.len()
            )));
        }
        let mut buf = [0_u8; 4];
        buf.copy_from_slice(buffer);
        Ok(Self::from_le_bytes(buf))
    }
}

impl StoreBytes<u64> for u64 {
    fn serialize(&self, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.resize(8, 0);
        buffer.copy_from_slice(&self.to_le_bytes());
        Ok(())
    }

    fn deserialize(buffer: &[u8]) -> Result<u64, DeserializeError> {
        if buffer.len() != 8 {
            return Err(DeserializeError::new(format!(
                "expected 8 bytes for a u64, got {}",
                buffer.len()
            )));
        }
        let mut buf = [0_u8; 8];
        buf.copy_from_slice(buffer);
        Ok(Self::from_le_bytes(buf))
    }
}

impl StoreBytes<i64> for i64 {
    fn serialize(&self, buffer: &mut Vec<u8>) -> Result<(), SerializeError> {
        buffer.resize(8, 0);
        buffer.copy_from_slice(&self.to_le_bytes());
        Ok(())
    }

    fn deserialize(buffer: &[u8]) -> Result<i64, DeserializeError> {
        if buffer.len() != 8 {
            return Err(DeserializeError::new(format!(
                "expected 8 bytes for an i64, got {}",
                buffer.len()
            )));
        }
        let mut buf = [0_u8; 8];
        buf.copy_from_slice(buffer);
        Ok(Self::from_le_bytes(buf))
    }
}

/// Trait for value types usable with the KV counter operation.
///
/// `increase` reads the current value, converts it to an integer, adds the delta and
/// writes the converted result back.  A value that does not parse as an integer counts
/// as zero, matching the behavior of absent keys.
pub trait StoreCount: Sized {
    /// Convert an integer count into a value for storage.
    fn from_count(count: i64) -> Self;

    /// Current integer interpretation of the value (zero if not numeric).
    fn to_count(&self) -> i64;
}

impl StoreCount for i64 {
    fn from_count(count: i64) -> Self {
        count
    }

    fn to_count(&self) -> i64 {
        *self
    }
}

impl StoreCount for String {
    fn from_count(count: i64) -> Self {
        count.to_string()
    }

    fn to_count(&self) -> i64 {
        self.trim().parse().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_round_trip() {
        let mut buffer = vec![1, 2, 3];
        "hello".to_string().serialize(&mut buffer).unwrap();
        assert_eq!(buffer, b"hello");
        assert_eq!(String::deserialize(&buffer).unwrap(), "hello");
    }

    #[test]
    fn test_int_round_trip() {
        let mut buffer = Vec::new();
        (-42_i64).serialize(&mut buffer).unwrap();
        assert_eq!(buffer.len(), 8);
        assert_eq!(i64::deserialize(&buffer).unwrap(), -42);
        assert!(i64::deserialize(&buffer[..4]).is_err());
    }

    #[test]
    fn test_counts() {
        assert_eq!("17".to_string().to_count(), 17);
        assert_eq!(" -3 ".to_string().to_count(), -3);
        assert_eq!("not a number".to_string().to_count(), 0);
        assert_eq!(String::from_count(9), "9");
    }
}
