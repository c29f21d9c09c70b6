//! Restartable iteration over the live records of a store.
//!
//! Iteration reads the bucket array in windows (the configured iterator slice, default
//! 10,000 slots per read) and walks each nonzero bucket's chain.  No lock is taken, so
//! a concurrent writer can relink a chain mid-walk; when a record header stops parsing
//! the walk re-reads the pointer that led there and resumes from its new target.  A
//! larger slice means fewer reads but a longer staleness window; a slice of 1 minimizes
//! staleness at per-bucket read cost.  Callers that cannot tolerate dirty data should
//! check `is_optimizing()` first and avoid iterating during a compaction.

use crate::chain::ChainGuard;
use crate::crc::crc32;
use crate::error::WalkError;
use crate::kv::{self, KvRecord, KV_HEADER_LEN};
use crate::list_store::{self, collect_values, KeyHeader, KEY_HEADER_LEN, VALUE_HEADER_LEN};
use crate::set_store::{self, SetRecord};
use crate::store_bytes::StoreBytes;
use crate::store_file::{unix_now, StoreFile};
use crate::BUCKET_COUNT;
use std::fmt::Debug;
use std::io;
use std::marker::PhantomData;

/// Windowed reader over the bucket array, yielding nonzero (bucket, head) pairs.
pub(crate) struct BucketWindows {
    slice: u32,
    next_bucket: u32,
    buffer: Vec<u8>,
    base: u32,
    slots: u32,
    pos: u32,
}

impl BucketWindows {
    pub fn new(slice: u32) -> Self {
        Self {
            slice: slice.max(1),
            next_bucket: 0,
            buffer: Vec::new(),
            base: 0,
            slots: 0,
            pos: 0,
        }
    }

    /// Restart from bucket zero.
    pub fn rewind(&mut self) {
        self.next_bucket = 0;
        self.slots = 0;
        self.pos = 0;
    }

    /// Advance to the next bucket with a nonempty chain, reading a fresh window of
    /// slots as needed.  The final window reads the remainder.
    pub fn next_nonzero(&mut self, sf: &mut StoreFile) -> Result<Option<(u32, u32)>, io::Error> {
        loop {
            while self.pos < self.slots {
                let at = self.pos as usize * 4;
                self.pos += 1;
                let mut buf = [0_u8; 4];
                buf.copy_from_slice(&self.buffer[at..at + 4]);
                let head = u32::from_le_bytes(buf);
                if head != 0 {
                    return Ok(Some((self.base + self.pos - 1, head)));
                }
            }
            if self.next_bucket >= BUCKET_COUNT {
                return Ok(None);
            }
            let count = self.slice.min(BUCKET_COUNT - self.next_bucket);
            self.buffer.resize(count as usize * 4, 0);
            let offset = sf.bucket_offset(self.next_bucket);
            sf.read_exact_at(offset, &mut self.buffer)?;
            self.base = self.next_bucket;
            self.slots = count;
            self.pos = 0;
            self.next_bucket += count;
        }
    }
}

/// Shared chain-walk state: the current record offset plus the file position of the
/// pointer that led there, which is what recovery re-reads after a concurrent relink.
struct ChainCursor {
    offset: u32,
    link_pos: u64,
    guard: ChainGuard,
}

impl ChainCursor {
    fn new() -> Self {
        Self {
            offset: 0,
            link_pos: 0,
            guard: ChainGuard::new(None),
        }
    }

    fn start(&mut self, head: u32, slot_pos: u64, limit: Option<u32>) {
        self.offset = head;
        self.link_pos = slot_pos;
        self.guard = ChainGuard::new(limit);
    }

    /// Admit the current offset past the cycle/cap guard.  False means drop the chain.
    fn admit(&mut self, sf: &StoreFile) -> bool {
        match self.guard.visit(self.offset) {
            Ok(true) => true,
            Ok(false) => {
                self.offset = 0;
                false
            }
            Err(_) => {
                if !sf.quiet() {
                    tracing::warn!("cycle detected during iteration, dropping chain");
                }
                self.offset = 0;
                false
            }
        }
    }

    /// A record header failed to parse at the current offset.  Re-read the link that
    /// led there: a concurrent writer may have repointed it.  False means the chain is
    /// beyond recovery and is dropped.
    fn recover(&mut self, sf: &mut StoreFile) -> bool {
        match sf.read_u32(self.link_pos) {
            Ok(new_target) if new_target != self.offset => {
                self.offset = new_target;
                true
            }
            _ => {
                if !sf.quiet() {
                    tracing::warn!("unreadable record during iteration, dropping chain");
                }
                self.offset = 0;
                false
            }
        }
    }
}

/// Iterator over the live (key, value) pairs of a KV store.
pub struct KvIter<V>
where
    V: Debug + StoreBytes<V>,
{
    file: StoreFile,
    windows: BucketWindows,
    cursor: ChainCursor,
    _value: PhantomData<V>,
}

impl<V> KvIter<V>
where
    V: Debug + StoreBytes<V>,
{
    pub(crate) fn new(file: StoreFile) -> Self {
        let slice = file.config().iterator_slice;
        Self {
            file,
            windows: BucketWindows::new(slice),
            cursor: ChainCursor::new(),
            _value: PhantomData,
        }
    }

    /// Restart the iteration from the first bucket.
    pub fn rewind(&mut self) {
        self.windows.rewind();
        self.cursor = ChainCursor::new();
    }
}

impl<V> Iterator for KvIter<V>
where
    V: Debug + StoreBytes<V>,
{
    type Item = (String, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cursor.offset == 0 {
                let (bucket, head) = match self.windows.next_nonzero(&mut self.file) {
                    Ok(Some(next)) => next,
                    Ok(None) => return None,
                    Err(_) => return None,
                };
                let slot_pos = self.file.bucket_offset(bucket);
                self.cursor
                    .start(head, slot_pos, self.file.config().chain_limit);
            }
            if !self.cursor.admit(&self.file) {
                continue;
            }
            let offset = self.cursor.offset;
            let rec = match KvRecord::load(&mut self.file, offset) {
                Ok(rec) => rec,
                Err(_) => {
                    self.cursor.recover(&mut self.file);
                    continue;
                }
            };
            self.cursor.offset = rec.next;
            self.cursor.link_pos = offset as u64 + kv::NEXT_OFFSET;
            if rec.is_dead() || rec.is_expired(unix_now()) {
                continue;
            }
            let mut key_buf = vec![0_u8; rec.key_len as usize];
            if self
                .file
                .read_exact_at(offset as u64 + KV_HEADER_LEN as u64, &mut key_buf)
                .is_err()
            {
                continue;
            }
            let key = match String::from_utf8(key_buf) {
                Ok(key) => key,
                Err(_) => continue,
            };
            let bytes = match kv::read_value(&mut self.file, offset, &rec) {
                Ok(Some(bytes)) => bytes,
                _ => continue,
            };
            match V::deserialize(&bytes) {
                Ok(value) => return Some((key, value)),
                Err(_) => continue,
            }
        }
    }
}

/// Iterator over the raw 16-byte digests of a key-set store.  The original keys are
/// not recoverable- only their MD5 is on disk.
pub struct SetIter {
    file: StoreFile,
    windows: BucketWindows,
    cursor: ChainCursor,
}

impl SetIter {
    pub(crate) fn new(file: StoreFile) -> Self {
        let slice = file.config().iterator_slice;
        Self {
            file,
            windows: BucketWindows::new(slice),
            cursor: ChainCursor::new(),
        }
    }

    /// Restart the iteration from the first bucket.
    pub fn rewind(&mut self) {
        self.windows.rewind();
        self.cursor = ChainCursor::new();
    }
}

impl Iterator for SetIter {
    type Item = [u8; 16];

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cursor.offset == 0 {
                let (bucket, head) = match self.windows.next_nonzero(&mut self.file) {
                    Ok(Some(next)) => next,
                    Ok(None) => return None,
                    Err(_) => return None,
                };
                let slot_pos = self.file.bucket_offset(bucket);
                self.cursor
                    .start(head, slot_pos, self.file.config().chain_limit);
            }
            if !self.cursor.admit(&self.file) {
                continue;
            }
            let offset = self.cursor.offset;
            let rec = match SetRecord::load(&mut self.file, offset) {
                Ok(rec) => rec,
                Err(_) => {
                    self.cursor.recover(&mut self.file);
                    continue;
                }
            };
            self.cursor.offset = rec.next;
            self.cursor.link_pos = offset as u64 + set_store::NEXT_OFFSET;
            return Some(rec.digest);
        }
    }
}

/// Iterator over the live keys of a list store, each with its full value list.
/// Checksum-invalid and undeserializable values are skipped within a list.
pub struct ListIter<V>
where
    V: Debug + StoreBytes<V>,
{
    file: StoreFile,
    windows: BucketWindows,
    cursor: ChainCursor,
    _value: PhantomData<V>,
}

impl<V> ListIter<V>
where
    V: Debug + StoreBytes<V>,
{
    pub(crate) fn new(file: StoreFile) -> Self {
        let slice = file.config().iterator_slice;
        Self {
            file,
            windows: BucketWindows::new(slice),
            cursor: ChainCursor::new(),
            _value: PhantomData,
        }
    }

    /// Restart the iteration from the first bucket.
    pub fn rewind(&mut self) {
        self.windows.rewind();
        self.cursor = ChainCursor::new();
    }

    fn read_list(&mut self, head: u32) -> Result<Vec<V>, WalkError> {
        let entries = collect_values(&mut self.file, head, None)?;
        let mut values = Vec::with_capacity(entries.len());
        for (offset, rec) in entries {
            let mut bytes = vec![0_u8; rec.value_len as usize];
            self.file
                .read_exact_at(offset as u64 + VALUE_HEADER_LEN as u64, &mut bytes)?;
            if crc32(&bytes) != rec.crc {
                continue;
            }
            if let Ok(value) = V::deserialize(&bytes) {
                values.push(value);
            }
        }
        Ok(values)
    }
}

impl<V> Iterator for ListIter<V>
where
    V: Debug + StoreBytes<V>,
{
    type Item = (String, Vec<V>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cursor.offset == 0 {
                let (bucket, head) = match self.windows.next_nonzero(&mut self.file) {
                    Ok(Some(next)) => next,
                    Ok(None) => return None,
                    Err(_) => return None,
                };
                let slot_pos = self.file.bucket_offset(bucket);
                self.cursor
                    .start(head, slot_pos, self.file.config().chain_limit);
            }
            if !self.cursor.admit(&self.file) {
                continue;
            }
            let offset = self.cursor.offset;
            let hdr = match KeyHeader::load(&mut self.file, offset) {
                Ok(hdr) => hdr,
                Err(_) => {
                    self.cursor.recover(&mut self.file);
                    continue;
                }
            };
            self.cursor.offset = hdr.next;
            self.cursor.link_pos = offset as u64 + list_store::KH_NEXT_OFFSET;
            if hdr.is_dead() {
                continue;
            }
            let mut key_buf = vec![0_u8; hdr.key_len as usize];
            if self
                .file
                .read_exact_at(offset as u64 + KEY_HEADER_LEN as u64, &mut key_buf)
                .is_err()
            {
                continue;
            }
            let key = match String::from_utf8(key_buf) {
                Ok(key) => key,
                Err(_) => continue,
            };
            match self.read_list(hdr.value_head) {
                Ok(values) => return Some((key, values)),
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::kv::KvStore;
    use crate::list_store::ListStore;
    use crate::set_store::SetStore;
    use crate::store_config::StoreConfig;
    use std::collections::{HashMap, HashSet};
    use tempfile::TempDir;

    #[test]
    fn test_kv_iteration() {
        let dir = TempDir::new().unwrap();
        let mut db: KvStore<String> =
            StoreConfig::new(dir.path().join("db.kv")).open_kv().unwrap();
        for i in 0..250 {
            db.set(&format!("key-{i}"), &format!("value-{i}"), 0).unwrap();
        }
        db.remove("key-7").unwrap();
        db.set("mortal", &"x".to_string(), 600).unwrap();
        db.expire("mortal", -1).unwrap();

        let seen: HashMap<String, String> = db.iter().unwrap().collect();
        // Dead and expired records are invisible.
        assert_eq!(seen.len(), 249);
        assert!(!seen.contains_key("key-7"));
        assert!(!seen.contains_key("mortal"));
        assert_eq!(seen.get("key-3").map(String::as_str), Some("value-3"));
        assert_eq!(seen.get("key-249").map(String::as_str), Some("value-249"));
    }

    #[test]
    fn test_rewind_restarts() {
        let dir = TempDir::new().unwrap();
        let mut db: KvStore<String> =
            StoreConfig::new(dir.path().join("db.kv")).open_kv().unwrap();
        for i in 0..40 {
            db.set(&format!("k{i}"), &"v".to_string(), 0).unwrap();
        }
        let mut iter = db.iter().unwrap();
        assert_eq!(iter.by_ref().count(), 40);
        assert_eq!(iter.by_ref().count(), 0);
        iter.rewind();
        assert_eq!(iter.count(), 40);
    }

    #[test]
    fn test_small_slice_windows() {
        // A tiny window exercises the remainder math across many reads.
        let dir = TempDir::new().unwrap();
        let mut db: KvStore<String> = StoreConfig::new(dir.path().join("db.kv"))
            .set_iterator_slice(777)
            .open_kv()
            .unwrap();
        for i in 0..60 {
            db.set(&format!("k{i}"), &format!("v{i}"), 0).unwrap();
        }
        assert_eq!(db.iter().unwrap().count(), 60);
    }

    #[test]
    fn test_set_iteration() {
        let dir = TempDir::new().unwrap();
        let mut set = StoreConfig::new(dir.path().join("db.set")).open_set().unwrap();
        for i in 0..50 {
            set.add(&format!("member-{i}")).unwrap();
        }
        set.remove("member-0").unwrap();
        let digests: HashSet<[u8; 16]> = set.iter().unwrap().collect();
        assert_eq!(digests.len(), 49);
    }

    #[test]
    fn test_list_iteration() {
        let dir = TempDir::new().unwrap();
        let mut list: ListStore<String> =
            StoreConfig::new(dir.path().join("db.list")).open_list().unwrap();
        list.set_values(&["a1".to_string(), "a2".to_string()]).unwrap();
        list.push("alpha").unwrap();
        list.set_values(&["b1".to_string()]).unwrap();
        list.push("beta").unwrap();
        list.set_values(&["c1".to_string()]).unwrap();
        list.push("gamma").unwrap();
        list.drop_key("gamma").unwrap();

        let seen: HashMap<String, Vec<String>> = list.iter().unwrap().collect();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen.get("alpha").cloned(),
            Some(vec!["a1".to_string(), "a2".to_string()])
        );
        assert_eq!(seen.get("beta").cloned(), Some(vec!["b1".to_string()]));
    }
}
