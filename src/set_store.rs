//! The key-set flavor: membership only, no values.
//!
//! A set record is `prev(4) | next(4) | md5raw(16)`- the stored key is the raw 16-byte
//! MD5 of the user key, so records are fixed size and membership compares are a single
//! 16-byte match.  There is no dead marker; removal unlinks the record from its chain
//! and compaction drops the orphaned bytes.  Distinct user keys collide only on a full
//! 128-bit MD5 collision, which is treated as impossible.

use crate::chain::ChainGuard;
use crate::crc::bucket_of;
use crate::error::optimize::OptimizeError;
use crate::error::read::ReadError;
use crate::error::write::WriteError;
use crate::error::{OpenError, StatusError, WalkError};
use crate::optimize::{self, Backfill};
use crate::store_config::StoreConfig;
use crate::store_file::StoreFile;
use crate::store_iter::SetIter;
use md5::{Digest, Md5};

/// Size of a set record.
pub(crate) const SET_RECORD_LEN: usize = 24;

/// Offset of the prev link within a set record.
const PREV_OFFSET: u64 = 0;
/// Offset of the next link within a set record.
pub(crate) const NEXT_OFFSET: u64 = 4;

/// Parsed set record.
#[derive(Debug, Copy, Clone)]
pub(crate) struct SetRecord {
    pub prev: u32,
    pub next: u32,
    pub digest: [u8; 16],
}

impl SetRecord {
    /// Read a set record at offset.
    pub fn load(sf: &mut StoreFile, offset: u32) -> Result<Self, WalkError> {
        let mut buffer = [0_u8; SET_RECORD_LEN];
        sf.read_exact_at(offset as u64, &mut buffer)?;
        let mut buf32 = [0_u8; 4];
        buf32.copy_from_slice(&buffer[0..4]);
        let prev = u32::from_le_bytes(buf32);
        buf32.copy_from_slice(&buffer[4..8]);
        let next = u32::from_le_bytes(buf32);
        let mut digest = [0_u8; 16];
        digest.copy_from_slice(&buffer[8..24]);
        Ok(Self { prev, next, digest })
    }

    /// Pack the record into its on-disk bytes.
    pub fn store(&self) -> [u8; SET_RECORD_LEN] {
        let mut buffer = [0_u8; SET_RECORD_LEN];
        buffer[0..4].copy_from_slice(&self.prev.to_le_bytes());
        buffer[4..8].copy_from_slice(&self.next.to_le_bytes());
        buffer[8..24].copy_from_slice(&self.digest);
        buffer
    }
}

/// Raw MD5 of a user key.
fn digest_of(key: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

/// Find the record holding digest in the bucket's chain.
fn find_digest(
    sf: &mut StoreFile,
    bucket: u32,
    digest: &[u8; 16],
) -> Result<Option<(u32, SetRecord)>, WalkError> {
    let head_pos = sf.bucket_offset(bucket);
    let mut offset = sf.read_u32(head_pos)?;
    let mut guard = ChainGuard::new(sf.config().chain_limit);
    while offset != 0 {
        if !guard.visit(offset)? {
            break;
        }
        let rec = SetRecord::load(sf, offset)?;
        if &rec.digest == digest {
            return Ok(Some((offset, rec)));
        }
        offset = rec.next;
    }
    Ok(None)
}

/// Link a digest at the head of its bucket chain if not already present.
fn add_locked(sf: &mut StoreFile, bucket: u32, digest: &[u8; 16]) -> Result<(), WriteError> {
    if find_digest(sf, bucket, digest)?.is_some() {
        return Ok(());
    }
    let head_pos = sf.bucket_offset(bucket);
    let head = sf.read_u32(head_pos)?;
    let rec = SetRecord {
        prev: 0,
        next: head,
        digest: *digest,
    };
    let new_off = sf.append(&rec.store())?;
    sf.write_u32(head_pos, new_off)?;
    if head != 0 {
        sf.write_u32(head as u64 + PREV_OFFSET, new_off)?;
    }
    sf.increase_count()?;
    Ok(())
}

/// Unlink a digest from its bucket chain.
fn remove_locked(sf: &mut StoreFile, bucket: u32, digest: &[u8; 16]) -> Result<bool, WriteError> {
    match find_digest(sf, bucket, digest)? {
        Some((_off, rec)) => {
            let fwd_pos = if rec.prev == 0 {
                sf.bucket_offset(bucket)
            } else {
                rec.prev as u64 + NEXT_OFFSET
            };
            sf.write_u32(fwd_pos, rec.next)?;
            if rec.next != 0 {
                sf.write_u32(rec.next as u64 + PREV_OFFSET, rec.prev)?;
            }
            sf.decrease_count()?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// An instance of a key-set store.
pub struct SetStore {
    file: StoreFile,
}

impl SetStore {
    /// Open a new or existing key-set store.
    pub fn open(config: StoreConfig) -> Result<Self, OpenError> {
        Ok(Self {
            file: StoreFile::open(config)?,
        })
    }

    /// Add key to the set.  Adding a member twice succeeds and stores it once.
    pub fn add(&mut self, key: &str) -> Result<(), WriteError> {
        check_key(key)?;
        let bucket = bucket_of(key);
        let digest = digest_of(key);
        self.file.lock_admitted(true)?;
        let res = add_locked(&mut self.file, bucket, &digest);
        self.file.unlock();
        res
    }

    /// True if key is a member.
    pub fn has(&mut self, key: &str) -> Result<bool, ReadError> {
        let bucket = bucket_of(key);
        let digest = digest_of(key);
        self.file.admit(false)?;
        if find_digest(&mut self.file, bucket, &digest)?.is_some() {
            return Ok(true);
        }
        if self.file.is_optimizing() {
            if let Some(mut old) = self.file.open_old(false) {
                return Ok(find_digest(&mut old, bucket, &digest)?.is_some());
            }
        }
        Ok(false)
    }

    /// Remove key from the set.  Removing a non-member succeeds.
    pub fn remove(&mut self, key: &str) -> Result<(), WriteError> {
        check_key(key)?;
        let bucket = bucket_of(key);
        let digest = digest_of(key);
        self.file.lock_admitted(true)?;
        let res = remove_locked(&mut self.file, bucket, &digest);
        self.file.unlock();
        // Unlink from the old store too so the compactor cannot re-insert it.
        if self.file.is_optimizing() {
            if let Some(mut old) = self.file.open_old(true) {
                let _ = remove_locked(&mut old, bucket, &digest);
            }
        }
        res.map(|_| ())
    }

    /// Number of members.  Advisory, like every count in the engine.
    pub fn count(&mut self) -> Result<u32, ReadError> {
        self.file.admit(false)?;
        Ok(self.file.read_header().map_err(StatusError::from)?.count)
    }

    /// Epoch seconds when the current file was created or last recreated.
    pub fn create_time(&mut self) -> Result<u32, ReadError> {
        self.file.admit(false)?;
        Ok(self
            .file
            .read_header()
            .map_err(StatusError::from)?
            .create_time)
    }

    /// True while some process is compacting this store.
    pub fn is_optimizing(&self) -> bool {
        self.file.is_optimizing()
    }

    /// Drop every member.  The file is rebuilt empty by the next operation.
    pub fn clear(&mut self) -> Result<(), WriteError> {
        Ok(self.file.clear()?)
    }

    /// Iterate all stored digests.  The user keys are not recoverable from the file-
    /// only their raw MD5 is stored.
    pub fn iter(&mut self) -> Result<SetIter, ReadError> {
        self.file.admit(false)?;
        let file = self.file.duplicate()?;
        Ok(SetIter::new(file))
    }

    /// Rewrite the file, dropping orphaned records.  See
    /// [`KvStore::optimize`](crate::kv::KvStore::optimize) for the protocol.
    pub fn optimize(
        &mut self,
        min_interval_secs: Option<u32>,
        progress: Option<&mut dyn FnMut(u8)>,
    ) -> Result<bool, OptimizeError> {
        let min_interval =
            min_interval_secs.unwrap_or(self.file.config().min_optimize_interval);
        optimize::run::<Self>(&mut self.file, min_interval, progress)
    }
}

impl Backfill for SetStore {
    fn backfill_bucket(
        old: &mut StoreFile,
        new: &mut StoreFile,
        bucket: u32,
        head: u32,
    ) -> Result<(), OptimizeError> {
        let mut guard = ChainGuard::new(old.config().chain_limit);
        let mut offset = head;
        while offset != 0 {
            if !guard.visit(offset)? {
                break;
            }
            let rec = SetRecord::load(old, offset)?;
            new.lock().map_err(WriteError::IO)?;
            let res = add_locked(new, bucket, &rec.digest);
            new.unlock();
            res?;
            offset = rec.next;
        }
        Ok(())
    }
}

fn check_key(key: &str) -> Result<(), WriteError> {
    if key.is_empty() {
        return Err(WriteError::EmptyKey);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> SetStore {
        StoreConfig::new(dir.path().join("db.set")).open_set().unwrap()
    }

    #[test]
    fn test_add_has_remove() {
        let dir = TempDir::new().unwrap();
        let mut set = open_store(&dir);
        assert!(!set.has("alpha").unwrap());
        set.add("alpha").unwrap();
        assert!(set.has("alpha").unwrap());
        assert!(!set.has("beta").unwrap());
        assert_eq!(set.count().unwrap(), 1);

        // Idempotent add keeps one record.
        set.add("alpha").unwrap();
        assert!(set.has("alpha").unwrap());
        assert_eq!(set.count().unwrap(), 1);

        set.remove("alpha").unwrap();
        assert!(!set.has("alpha").unwrap());
        assert_eq!(set.count().unwrap(), 0);
        set.remove("alpha").unwrap();
        assert_eq!(set.count().unwrap(), 0);
    }

    #[test]
    fn test_many_members() {
        let dir = TempDir::new().unwrap();
        let mut set = open_store(&dir);
        for i in 0..300 {
            set.add(&format!("member-{i}")).unwrap();
        }
        assert_eq!(set.count().unwrap(), 300);
        for i in (0..300).step_by(2) {
            set.remove(&format!("member-{i}")).unwrap();
        }
        for i in 0..300 {
            assert_eq!(set.has(&format!("member-{i}")).unwrap(), i % 2 == 1);
        }
        assert_eq!(set.count().unwrap(), 150);
    }

    #[test]
    fn test_digest_is_md5() {
        // Raw MD5 of "abc", the RFC 1321 test vector.
        assert_eq!(
            digest_of("abc"),
            [
                0x90, 0x01, 0x50, 0x98, 0x3c, 0xd2, 0x4f, 0xb0, 0xd6, 0x96, 0x3f, 0x7d,
                0x28, 0xe1, 0x7f, 0x72
            ]
        );
    }
}
