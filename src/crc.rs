//! Wrapper functions for the CRC32 codes used throughout the store.  Values carry a
//! CRC32 of their raw serialized bytes and keys are mapped to buckets by the CRC32 of
//! their UTF-8 bytes.

use crate::BUCKET_COUNT;

/// CRC32 of a byte buffer.
pub(crate) fn crc32(buffer: &[u8]) -> u32 {
    let mut crc32_hasher = crc32fast::Hasher::new();
    crc32_hasher.update(buffer);
    crc32_hasher.finalize()
}

/// Bucket index for a key, `crc32(key) mod BUCKET_COUNT`.
pub(crate) fn bucket_of(key: &str) -> u32 {
    crc32(key.as_bytes()) % BUCKET_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_range() {
        assert!(bucket_of("") < BUCKET_COUNT);
        assert!(bucket_of("foo") < BUCKET_COUNT);
        assert!(bucket_of("a slightly longer key with spaces") < BUCKET_COUNT);
    }

    #[test]
    fn test_crc_stability() {
        // CRC32 of "123456789" is the classic check value.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }
}
