//! The KV flavor: opaque values with optional TTL and in-place integer counters.
//!
//! A KV record is a 26-byte header, the key bytes and a value slot:
//! `kLen(2) | eLen(4) | vLen(4) | crc(4) | expire(4) | prev(4) | next(4) | key | value`.
//! `eLen` is the allocated slot length and `vLen` the live bytes within it, so a value
//! that shrinks (or a pre-padded counter) updates in place without relinking.  A zero
//! `kLen` marks the record dead; the space stays until compaction reclaims it.

use crate::chain::ChainGuard;
use crate::crc::{bucket_of, crc32};
use crate::error::optimize::OptimizeError;
use crate::error::read::ReadError;
use crate::error::write::WriteError;
use crate::error::{OpenError, StatusError, WalkError};
use crate::optimize::{self, Backfill};
use crate::store_bytes::{StoreBytes, StoreCount};
use crate::store_config::StoreConfig;
use crate::store_file::{unix_now, StoreFile};
use crate::store_iter::KvIter;
use std::fmt::Debug;
use std::marker::PhantomData;

/// Size of a KV record header.
pub(crate) const KV_HEADER_LEN: usize = 26;

/// Offset of the expire field within a KV record header.
const EXPIRE_OFFSET: u64 = 14;
/// Offset of the prev link within a KV record header.
const PREV_OFFSET: u64 = 18;
/// Offset of the next link within a KV record header.
pub(crate) const NEXT_OFFSET: u64 = 22;

/// Counter records get at least this much slot so integer updates stay in place.
const COUNTER_SLOT: usize = 16;

/// Remaining lifetime of a key.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Ttl {
    /// The key has no expiry.
    Never,
    /// Seconds until expiry; zero when already expired at read time.
    Remaining(u32),
}

/// Parsed header of one KV record.
#[derive(Debug, Copy, Clone)]
pub(crate) struct KvRecord {
    pub key_len: u16,
    pub slot_len: u32,
    pub value_len: u32,
    pub crc: u32,
    pub expire: u32,
    pub prev: u32,
    pub next: u32,
}

impl KvRecord {
    /// Read a record header at offset.
    pub fn load(sf: &mut StoreFile, offset: u32) -> Result<Self, WalkError> {
        let mut buffer = [0_u8; KV_HEADER_LEN];
        sf.read_exact_at(offset as u64, &mut buffer)?;
        let mut buf16 = [0_u8; 2];
        let mut buf32 = [0_u8; 4];
        buf16.copy_from_slice(&buffer[0..2]);
        let key_len = u16::from_le_bytes(buf16);
        buf32.copy_from_slice(&buffer[2..6]);
        let slot_len = u32::from_le_bytes(buf32);
        buf32.copy_from_slice(&buffer[6..10]);
        let value_len = u32::from_le_bytes(buf32);
        buf32.copy_from_slice(&buffer[10..14]);
        let crc = u32::from_le_bytes(buf32);
        buf32.copy_from_slice(&buffer[14..18]);
        let expire = u32::from_le_bytes(buf32);
        buf32.copy_from_slice(&buffer[18..22]);
        let prev = u32::from_le_bytes(buf32);
        buf32.copy_from_slice(&buffer[22..26]);
        let next = u32::from_le_bytes(buf32);
        if value_len > slot_len {
            return Err(WalkError::Format);
        }
        Ok(Self {
            key_len,
            slot_len,
            value_len,
            crc,
            expire,
            prev,
            next,
        })
    }

    /// Pack the header into its on-disk bytes.
    pub fn store(&self) -> [u8; KV_HEADER_LEN] {
        let mut buffer = [0_u8; KV_HEADER_LEN];
        buffer[0..2].copy_from_slice(&self.key_len.to_le_bytes());
        buffer[2..6].copy_from_slice(&self.slot_len.to_le_bytes());
        buffer[6..10].copy_from_slice(&self.value_len.to_le_bytes());
        buffer[10..14].copy_from_slice(&self.crc.to_le_bytes());
        buffer[14..18].copy_from_slice(&self.expire.to_le_bytes());
        buffer[18..22].copy_from_slice(&self.prev.to_le_bytes());
        buffer[22..26].copy_from_slice(&self.next.to_le_bytes());
        buffer
    }

    /// True for a dead (deleted or superseded) record.
    pub fn is_dead(&self) -> bool {
        self.key_len == 0
    }

    /// True when the record has an expiry in the past.
    pub fn is_expired(&self, now: u32) -> bool {
        self.expire != 0 && self.expire <= now
    }
}

/// Find the live record for key in its bucket chain.
pub(crate) fn find_record(
    sf: &mut StoreFile,
    key: &str,
) -> Result<Option<(u32, KvRecord)>, WalkError> {
    let head_pos = sf.bucket_offset(bucket_of(key));
    let mut offset = sf.read_u32(head_pos)?;
    let mut guard = ChainGuard::new(sf.config().chain_limit);
    let mut key_buf = vec![0_u8; key.len()];
    while offset != 0 {
        if !guard.visit(offset)? {
            break;
        }
        let rec = KvRecord::load(sf, offset)?;
        if !rec.is_dead() && rec.key_len as usize == key.len() {
            sf.read_exact_at(offset as u64 + KV_HEADER_LEN as u64, &mut key_buf)?;
            if key_buf == key.as_bytes() {
                return Ok(Some((offset, rec)));
            }
        }
        offset = rec.next;
    }
    Ok(None)
}

/// Read and checksum a record's value bytes.  None when the stored CRC does not match.
pub(crate) fn read_value(
    sf: &mut StoreFile,
    offset: u32,
    rec: &KvRecord,
) -> Result<Option<Vec<u8>>, WalkError> {
    let mut bytes = vec![0_u8; rec.value_len as usize];
    sf.read_exact_at(
        offset as u64 + KV_HEADER_LEN as u64 + rec.key_len as u64,
        &mut bytes,
    )?;
    if crc32(&bytes) != rec.crc {
        return Ok(None);
    }
    Ok(Some(bytes))
}

/// Append a new record and link it at the head of its bucket chain.
/// Order matters for crash tolerance: the record lands first, then the bucket slot,
/// then the old head's back link.
fn insert_record(
    sf: &mut StoreFile,
    key: &str,
    bytes: &[u8],
    slot_len: u32,
    expire: u32,
) -> Result<u32, WriteError> {
    let head_pos = sf.bucket_offset(bucket_of(key));
    let head = sf.read_u32(head_pos)?;
    let rec = KvRecord {
        key_len: key.len() as u16,
        slot_len,
        value_len: bytes.len() as u32,
        crc: crc32(bytes),
        expire,
        prev: 0,
        next: head,
    };
    let total = KV_HEADER_LEN + key.len() + slot_len as usize;
    let mut buffer = Vec::with_capacity(total);
    buffer.extend_from_slice(&rec.store());
    buffer.extend_from_slice(key.as_bytes());
    buffer.extend_from_slice(bytes);
    buffer.resize(total, 0);
    let new_off = sf.append(&buffer)?;
    sf.write_u32(head_pos, new_off)?;
    if head != 0 {
        sf.write_u32(head as u64 + PREV_OFFSET, new_off)?;
    }
    sf.increase_count()?;
    Ok(new_off)
}

/// Replace a record whose slot is too small: append a copy carrying the old links,
/// repoint both neighbors, dead-mark the old record.
fn replace_record(
    sf: &mut StoreFile,
    old_off: u32,
    old: &KvRecord,
    key: &str,
    bytes: &[u8],
    slot_len: u32,
    expire: u32,
) -> Result<(), WriteError> {
    let rec = KvRecord {
        key_len: key.len() as u16,
        slot_len,
        value_len: bytes.len() as u32,
        crc: crc32(bytes),
        expire,
        prev: old.prev,
        next: old.next,
    };
    let total = KV_HEADER_LEN + key.len() + slot_len as usize;
    let mut buffer = Vec::with_capacity(total);
    buffer.extend_from_slice(&rec.store());
    buffer.extend_from_slice(key.as_bytes());
    buffer.extend_from_slice(bytes);
    buffer.resize(total, 0);
    let new_off = sf.append(&buffer)?;
    let fwd_pos = if old.prev == 0 {
        sf.bucket_offset(bucket_of(key))
    } else {
        old.prev as u64 + NEXT_OFFSET
    };
    sf.write_u32(fwd_pos, new_off)?;
    if old.next != 0 {
        sf.write_u32(old.next as u64 + PREV_OFFSET, new_off)?;
    }
    sf.write_all_at(old_off as u64, &0_u16.to_le_bytes())?;
    Ok(())
}

fn set_locked(sf: &mut StoreFile, key: &str, bytes: &[u8], expire: u32) -> Result<(), WriteError> {
    match find_record(sf, key)? {
        Some((off, rec)) => {
            if bytes.len() <= rec.slot_len as usize {
                let updated = KvRecord {
                    value_len: bytes.len() as u32,
                    crc: crc32(bytes),
                    expire,
                    ..rec
                };
                sf.write_all_at(off as u64, &updated.store())?;
                sf.write_all_at(
                    off as u64 + KV_HEADER_LEN as u64 + rec.key_len as u64,
                    bytes,
                )?;
            } else {
                replace_record(sf, off, &rec, key, bytes, bytes.len() as u32, expire)?;
            }
            Ok(())
        }
        None => insert_record(sf, key, bytes, bytes.len() as u32, expire).map(|_| ()),
    }
}

fn remove_locked(sf: &mut StoreFile, key: &str) -> Result<bool, WriteError> {
    match find_record(sf, key)? {
        Some((off, rec)) => {
            sf.write_all_at(off as u64, &0_u16.to_le_bytes())?;
            let fwd_pos = if rec.prev == 0 {
                sf.bucket_offset(bucket_of(key))
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

fn expire_locked(sf: &mut StoreFile, key: &str, stamp: u32) -> Result<bool, WriteError> {
    match find_record(sf, key)? {
        Some((off, _rec)) => {
            sf.write_u32(off as u64 + EXPIRE_OFFSET, stamp)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

fn expire_stamp(secs: i64, now: u32) -> u32 {
    if secs == 0 {
        0
    } else if secs < 0 {
        // Earliest possible expiry; zero would mean "never".
        1
    } else {
        now.saturating_add(secs.min(u32::MAX as i64) as u32)
    }
}

/// Re-insert a record into the new store during compaction.  Uses the normal write
/// path but skips keys that already exist- a concurrent writer has set a newer value
/// that must not be overwritten.
pub(crate) fn write_optimize(
    new: &mut StoreFile,
    key: &str,
    bytes: &[u8],
    expire: u32,
) -> Result<(), WriteError> {
    new.lock()?;
    let res = (|| {
        if find_record(new, key)?.is_some() {
            return Ok(());
        }
        insert_record(new, key, bytes, bytes.len() as u32, expire).map(|_| ())
    })();
    new.unlock();
    res
}

/// An instance of a KV store.
pub struct KvStore<V>
where
    V: Debug + StoreBytes<V>,
{
    file: StoreFile,
    scratch: Vec<u8>,
    _value: PhantomData<V>,
}

impl<V> KvStore<V>
where
    V: Debug + StoreBytes<V>,
{
    /// Open a new or existing KV store.
    pub fn open(config: StoreConfig) -> Result<Self, OpenError> {
        Ok(Self {
            file: StoreFile::open(config)?,
            scratch: Vec::new(),
            _value: PhantomData,
        })
    }

    /// Store value under key.  A ttl of zero means the key never expires, otherwise it
    /// expires ttl_secs from now.  Replaces any previous value and expiry.
    pub fn set(&mut self, key: &str, value: &V, ttl_secs: u32) -> Result<(), WriteError> {
        check_key(key)?;
        let mut buffer = std::mem::take(&mut self.scratch);
        let res = self.set_with_buffer(key, value, ttl_secs, &mut buffer);
        self.scratch = buffer;
        res
    }

    fn set_with_buffer(
        &mut self,
        key: &str,
        value: &V,
        ttl_secs: u32,
        buffer: &mut Vec<u8>,
    ) -> Result<(), WriteError> {
        value.serialize(buffer)?;
        let expire = if ttl_secs > 0 {
            unix_now().saturating_add(ttl_secs)
        } else {
            0
        };
        self.file.lock_admitted(true)?;
        let res = set_locked(&mut self.file, key, buffer, expire);
        self.file.unlock();
        res
    }

    /// Fetch the value stored at key.  Returns None for an absent, expired or
    /// checksum-invalid record.
    pub fn get(&mut self, key: &str) -> Result<Option<V>, ReadError> {
        self.file.admit(false)?;
        if let Some(value) = Self::get_in(&mut self.file, key)? {
            return Ok(Some(value));
        }
        // During a compaction the key may only exist in the renamed old store.
        if self.file.is_optimizing() {
            if let Some(mut old) = self.file.open_old(false) {
                return Self::get_in(&mut old, key);
            }
        }
        Ok(None)
    }

    fn get_in(sf: &mut StoreFile, key: &str) -> Result<Option<V>, ReadError> {
        let found = match find_record(sf, key)? {
            Some(found) => found,
            None => return Ok(None),
        };
        let (off, rec) = found;
        if rec.is_expired(unix_now()) {
            return Ok(None);
        }
        match read_value(sf, off, &rec)? {
            Some(bytes) => Ok(Some(V::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remaining lifetime of key.  None when the key is absent.
    pub fn ttl(&mut self, key: &str) -> Result<Option<Ttl>, ReadError> {
        self.file.admit(false)?;
        if let Some(ttl) = Self::ttl_in(&mut self.file, key)? {
            return Ok(Some(ttl));
        }
        if self.file.is_optimizing() {
            if let Some(mut old) = self.file.open_old(false) {
                return Self::ttl_in(&mut old, key);
            }
        }
        Ok(None)
    }

    fn ttl_in(sf: &mut StoreFile, key: &str) -> Result<Option<Ttl>, ReadError> {
        match find_record(sf, key)? {
            None => Ok(None),
            Some((_off, rec)) => {
                if rec.expire == 0 {
                    Ok(Some(Ttl::Never))
                } else {
                    Ok(Some(Ttl::Remaining(
                        rec.expire.saturating_sub(unix_now()),
                    )))
                }
            }
        }
    }

    /// Change the expiry of an existing key: negative expires it immediately, zero
    /// clears the expiry, positive sets it to secs from now.  Patches only the expire
    /// field of the record header.
    pub fn expire(&mut self, key: &str, secs: i64) -> Result<(), WriteError> {
        check_key(key)?;
        let stamp = expire_stamp(secs, unix_now());
        self.file.lock_admitted(true)?;
        let res = expire_locked(&mut self.file, key, stamp);
        self.file.unlock();
        // Patch the old store too, so a half-migrated record cannot resurrect the old
        // expiry when the compactor copies it over.
        let mut patched_old = false;
        if self.file.is_optimizing() {
            if let Some(mut old) = self.file.open_old(true) {
                patched_old = expire_locked(&mut old, key, stamp).unwrap_or(false);
            }
        }
        match res {
            Ok(true) => Ok(()),
            Ok(false) if patched_old => Ok(()),
            Ok(false) => Err(WriteError::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Atomically add delta to the integer value at key, creating it from zero when
    /// absent or expired, and return the new value.  The record's slot is pre-padded to
    /// 16 bytes on creation so later updates stay in place.  A ttl of zero leaves the
    /// existing expiry alone.
    pub fn increase(&mut self, key: &str, delta: i64, ttl_secs: u32) -> Result<i64, WriteError>
    where
        V: StoreCount,
    {
        check_key(key)?;
        self.file.lock_admitted(true)?;
        let res = Self::increase_locked(&mut self.file, key, delta, ttl_secs);
        self.file.unlock();
        res
    }

    fn increase_locked(
        sf: &mut StoreFile,
        key: &str,
        delta: i64,
        ttl_secs: u32,
    ) -> Result<i64, WriteError>
    where
        V: StoreCount,
    {
        let now = unix_now();
        let found = find_record(sf, key)?;
        let (current, keep_expire) = match &found {
            Some((off, rec)) if !rec.is_expired(now) => {
                let current = match read_value(sf, *off, rec)? {
                    Some(bytes) => V::deserialize(&bytes).map(|v| v.to_count()).unwrap_or(0),
                    None => 0,
                };
                (current, rec.expire)
            }
            // Absent or expired both count from zero with a fresh expiry.
            _ => (0, 0),
        };
        let new_count = current.wrapping_add(delta);
        let mut buffer = Vec::new();
        V::from_count(new_count).serialize(&mut buffer)?;
        let expire = if ttl_secs > 0 {
            now.saturating_add(ttl_secs)
        } else {
            keep_expire
        };
        match found {
            Some((off, rec)) => {
                // An expired record is a fresh creation in disguise: it must end up
                // with a counter-sized slot, not whatever stale slot the dead value
                // happened to occupy.
                let needed_slot = if rec.is_expired(now) {
                    buffer.len().max(COUNTER_SLOT)
                } else {
                    buffer.len()
                };
                if needed_slot <= rec.slot_len as usize {
                    let updated = KvRecord {
                        value_len: buffer.len() as u32,
                        crc: crc32(&buffer),
                        expire,
                        ..rec
                    };
                    sf.write_all_at(off as u64, &updated.store())?;
                    sf.write_all_at(
                        off as u64 + KV_HEADER_LEN as u64 + rec.key_len as u64,
                        &buffer,
                    )?;
                } else {
                    let slot = buffer.len().max(COUNTER_SLOT) as u32;
                    replace_record(sf, off, &rec, key, &buffer, slot, expire)?;
                }
            }
            None => {
                let slot = buffer.len().max(COUNTER_SLOT) as u32;
                insert_record(sf, key, &buffer, slot, expire)?;
            }
        }
        Ok(new_count)
    }

    /// Remove key.  Removing an absent key succeeds.
    pub fn remove(&mut self, key: &str) -> Result<(), WriteError> {
        check_key(key)?;
        self.file.lock_admitted(true)?;
        let res = remove_locked(&mut self.file, key);
        self.file.unlock();
        // Dead-mark in the old store as well so the compactor cannot re-insert it.
        if self.file.is_optimizing() {
            if let Some(mut old) = self.file.open_old(true) {
                let _ = remove_locked(&mut old, key);
            }
        }
        res.map(|_| ())
    }

    /// Number of live records.  Advisory- concurrent processes and crash recovery can
    /// make it drift from a full enumeration.
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

    /// Drop every record.  The file is rebuilt empty by the next operation from any
    /// process.
    pub fn clear(&mut self) -> Result<(), WriteError> {
        Ok(self.file.clear()?)
    }

    /// Iterate all live (key, value) pairs.  Takes no lock; see [`KvIter`] for the
    /// staleness trade-offs.
    pub fn iter(&mut self) -> Result<KvIter<V>, ReadError> {
        self.file.admit(false)?;
        let file = self.file.duplicate()?;
        Ok(KvIter::new(file))
    }

    /// Rewrite the file, dropping dead and expired records, while concurrent readers
    /// and writers keep operating.  Returns Ok(false) without doing anything when
    /// another process is already compacting or the file is younger than the minimum
    /// interval (config default when None).
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

impl<V> Backfill for KvStore<V>
where
    V: Debug + StoreBytes<V>,
{
    fn backfill_bucket(
        old: &mut StoreFile,
        new: &mut StoreFile,
        bucket: u32,
        head: u32,
    ) -> Result<(), OptimizeError> {
        let now = unix_now();
        let mut guard = ChainGuard::new(old.config().chain_limit);
        let mut offset = head;
        while offset != 0 {
            if !guard.visit(offset)? {
                break;
            }
            let rec = KvRecord::load(old, offset)?;
            if !rec.is_dead() && !rec.is_expired(now) {
                let mut key_buf = vec![0_u8; rec.key_len as usize];
                old.read_exact_at(offset as u64 + KV_HEADER_LEN as u64, &mut key_buf)?;
                if let Ok(key) = String::from_utf8(key_buf) {
                    debug_assert_eq!(bucket_of(&key), bucket);
                    if let Some(bytes) = read_value(old, offset, &rec)? {
                        write_optimize(new, &key, &bytes, rec.expire)?;
                    }
                }
            }
            offset = rec.next;
        }
        Ok(())
    }
}

fn check_key(key: &str) -> Result<(), WriteError> {
    if key.is_empty() {
        return Err(WriteError::EmptyKey);
    }
    if key.len() > u16::MAX as usize {
        return Err(WriteError::KeyTooLong);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> KvStore<String> {
        StoreConfig::new(dir.path().join("db.kv")).open_kv().unwrap()
    }

    #[test]
    fn test_set_get_remove() {
        let dir = TempDir::new().unwrap();
        let mut db = open_store(&dir);
        assert_eq!(db.get("missing").unwrap(), None);
        db.set("foo", &"value one".to_string(), 0).unwrap();
        assert_eq!(db.get("foo").unwrap().as_deref(), Some("value one"));
        assert_eq!(db.count().unwrap(), 1);

        // Same-size update stays in place, a longer one relinks; both must read back.
        db.set("foo", &"value two".to_string(), 0).unwrap();
        assert_eq!(db.get("foo").unwrap().as_deref(), Some("value two"));
        db.set("foo", &"a considerably longer value".to_string(), 0)
            .unwrap();
        assert_eq!(
            db.get("foo").unwrap().as_deref(),
            Some("a considerably longer value")
        );
        assert_eq!(db.count().unwrap(), 1);

        db.remove("foo").unwrap();
        assert_eq!(db.get("foo").unwrap(), None);
        assert_eq!(db.count().unwrap(), 0);
        // Idempotent.
        db.remove("foo").unwrap();
        assert_eq!(db.count().unwrap(), 0);
    }

    #[test]
    fn test_empty_key_rejected() {
        let dir = TempDir::new().unwrap();
        let mut db = open_store(&dir);
        assert!(matches!(
            db.set("", &"x".to_string(), 0),
            Err(WriteError::EmptyKey)
        ));
    }

    #[test]
    fn test_ttl_scenario() {
        let dir = TempDir::new().unwrap();
        let mut db = open_store(&dir);
        db.set("foo", &"foo".to_string(), 0).unwrap();
        assert_eq!(db.ttl("foo").unwrap(), Some(Ttl::Never));
        db.set("bar", &"bar".to_string(), 100).unwrap();
        match db.ttl("bar").unwrap() {
            Some(Ttl::Remaining(secs)) => assert!(secs > 98 && secs <= 100, "ttl {}", secs),
            other => panic!("expected a bounded ttl, got {:?}", other),
        }
        db.expire("foo", 600).unwrap();
        match db.ttl("foo").unwrap() {
            Some(Ttl::Remaining(secs)) => assert!(secs > 598 && secs <= 600, "ttl {}", secs),
            other => panic!("expected a bounded ttl, got {:?}", other),
        }
        db.expire("foo", -1).unwrap();
        assert_eq!(db.get("foo").unwrap(), None);
        db.expire("bar", 0).unwrap();
        assert_eq!(db.ttl("bar").unwrap(), Some(Ttl::Never));
        assert_eq!(db.ttl("gone").unwrap(), None);
    }

    #[test]
    fn test_expired_set_returns_none() {
        let dir = TempDir::new().unwrap();
        let mut db = open_store(&dir);
        db.set("soon", &"gone".to_string(), 1).unwrap();
        assert_eq!(db.get("soon").unwrap().as_deref(), Some("gone"));
        std::thread::sleep(std::time::Duration::from_millis(2100));
        assert_eq!(db.get("soon").unwrap(), None);
        assert_eq!(db.ttl("soon").unwrap(), Some(Ttl::Remaining(0)));
    }

    #[test]
    fn test_increase_scenario() {
        let dir = TempDir::new().unwrap();
        let mut db = open_store(&dir);
        assert_eq!(db.get("foo").unwrap(), None);
        assert_eq!(db.increase("foo", 1, 0).unwrap(), 1);
        assert_eq!(db.get("foo").unwrap().as_deref(), Some("1"));
        assert_eq!(db.increase("foo", 2, 0).unwrap(), 3);
        assert_eq!(db.get("bar").unwrap(), None);
        assert_eq!(db.increase("bar", 3, 0).unwrap(), 3);
        assert_eq!(db.increase("bar", 2, 0).unwrap(), 5);
        assert_eq!(db.increase("bar", -5, 0).unwrap(), 0);
    }

    #[test]
    fn test_increase_stays_in_place() {
        let dir = TempDir::new().unwrap();
        let mut db = open_store(&dir);
        db.increase("n", 1, 0).unwrap();
        let before = std::fs::metadata(dir.path().join("db.kv")).unwrap().len();
        // The 16-byte counter slot absorbs growth of the decimal representation.
        for _ in 0..100 {
            db.increase("n", 100, 0).unwrap();
        }
        let after = std::fs::metadata(dir.path().join("db.kv")).unwrap().len();
        assert_eq!(before, after);
        assert_eq!(db.increase("n", 0, 0).unwrap(), 10_001);
    }

    #[test]
    fn test_increase_repads_expired_slot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.kv");
        let mut db = open_store(&dir);
        // A plain one-byte value gets a one-byte slot, then ages out.
        db.set("n", &"7".to_string(), 0).unwrap();
        db.expire("n", -1).unwrap();
        assert_eq!(db.get("n").unwrap(), None);
        // Counting restarts from zero and the recreated record must carry the full
        // counter slot, so later updates stay in place.
        assert_eq!(db.increase("n", 5, 0).unwrap(), 5);
        let before = std::fs::metadata(&path).unwrap().len();
        for _ in 0..60 {
            db.increase("n", 100, 0).unwrap();
        }
        let after = std::fs::metadata(&path).unwrap().len();
        assert_eq!(before, after);
        assert_eq!(db.increase("n", 0, 0).unwrap(), 6005);
    }

    #[test]
    fn test_crc_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.kv");
        let mut db = open_store(&dir);
        db.set("victim", &"payload bytes".to_string(), 0).unwrap();
        drop(db);

        // Flip one byte of the stored value (it is the unique occurrence of this text).
        let mut raw = std::fs::read(&path).unwrap();
        let pos = raw
            .windows(13)
            .position(|w| w == b"payload bytes")
            .expect("value present in file");
        raw[pos + 3] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        let mut db: KvStore<String> = StoreConfig::new(&path).open_kv().unwrap();
        assert_eq!(db.get("victim").unwrap(), None);
    }

    #[test]
    fn test_bucket_collisions_chain() {
        let dir = TempDir::new().unwrap();
        let mut db = open_store(&dir);
        // Enough keys that several buckets collide; all must stay reachable through
        // their chains, including after deletions splice the middle out.
        for i in 0..500 {
            db.set(&format!("key-{i}"), &format!("value-{i}"), 0).unwrap();
        }
        assert_eq!(db.count().unwrap(), 500);
        for i in (0..500).step_by(3) {
            db.remove(&format!("key-{i}")).unwrap();
        }
        for i in 0..500 {
            let got = db.get(&format!("key-{i}")).unwrap();
            if i % 3 == 0 {
                assert_eq!(got, None);
            } else {
                assert_eq!(got.as_deref(), Some(format!("value-{i}").as_str()));
            }
        }
    }

    #[test]
    fn test_two_handles_see_writes() {
        let dir = TempDir::new().unwrap();
        let mut a = open_store(&dir);
        let mut b = open_store(&dir);
        a.set("shared", &"from a".to_string(), 0).unwrap();
        assert_eq!(b.get("shared").unwrap().as_deref(), Some("from a"));
        b.set("shared", &"from b".to_string(), 0).unwrap();
        assert_eq!(a.get("shared").unwrap().as_deref(), Some("from b"));
    }

    #[test]
    fn test_chain_pointer_symmetry() {
        let dir = TempDir::new().unwrap();
        let mut db = open_store(&dir);
        let keys: Vec<String> = (0..120).map(|i| format!("sym-{i}")).collect();
        for key in &keys {
            db.set(key, &"short".to_string(), 0).unwrap();
        }
        // Grown updates relink mid-chain, removals splice.
        for key in keys.iter().step_by(2) {
            db.set(key, &"a value long enough to force a grow relink".to_string(), 0)
                .unwrap();
        }
        for key in keys.iter().step_by(5) {
            db.remove(key).unwrap();
        }

        // Every chain must be back-linked exactly: the head's prev is zero and each
        // record's prev names the record whose next named it.  Dead records never
        // appear- deletion splices them out.
        let buckets: std::collections::HashSet<u32> =
            keys.iter().map(|k| bucket_of(k)).collect();
        let mut live = 0;
        for bucket in buckets {
            let head_pos = db.file.bucket_offset(bucket);
            let mut offset = db.file.read_u32(head_pos).unwrap();
            let mut prev = 0;
            while offset != 0 {
                let rec = KvRecord::load(&mut db.file, offset).unwrap();
                assert_eq!(rec.prev, prev, "back link broken in bucket {bucket}");
                assert!(!rec.is_dead(), "dead record left linked in bucket {bucket}");
                live += 1;
                prev = offset;
                offset = rec.next;
            }
        }
        let expected = keys.len() - keys.iter().step_by(5).count();
        assert_eq!(live, expected);
        assert_eq!(db.count().unwrap(), expected as u32);
    }

    #[test]
    fn test_concurrent_increase() {
        // Four handles on the same file, each with its own descriptor, racing the
        // counter.  The whole-file lock serializes them exactly as it would across
        // processes.
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.kv");
        drop(StoreConfig::new(&path).open_kv::<String>().unwrap());
        let mut workers = Vec::new();
        for _ in 0..4 {
            let path = path.clone();
            workers.push(std::thread::spawn(move || {
                let mut db: KvStore<String> = StoreConfig::new(&path).open_kv().unwrap();
                for _ in 0..50 {
                    db.increase("n", 1, 0).unwrap();
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        let mut db: KvStore<String> = StoreConfig::new(&path).open_kv().unwrap();
        assert_eq!(db.get("n").unwrap().as_deref(), Some("200"));
    }

    #[test]
    fn test_concurrent_disjoint_inserts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.kv");
        drop(StoreConfig::new(&path).open_kv::<String>().unwrap());
        let mut workers = Vec::new();
        for w in 0..3 {
            let path = path.clone();
            workers.push(std::thread::spawn(move || {
                let mut db: KvStore<String> = StoreConfig::new(&path).open_kv().unwrap();
                for i in 0..200 {
                    db.set(&format!("w{w}-key-{i}"), &format!("w{w}-val-{i}"), 0)
                        .unwrap();
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        let mut db: KvStore<String> = StoreConfig::new(&path).open_kv().unwrap();
        assert_eq!(db.count().unwrap(), 600);
        for w in 0..3 {
            for i in 0..200 {
                assert_eq!(
                    db.get(&format!("w{w}-key-{i}")).unwrap().as_deref(),
                    Some(format!("w{w}-val-{i}").as_str())
                );
            }
        }
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let mut db = open_store(&dir);
        db.set("a", &"1".to_string(), 0).unwrap();
        db.set("b", &"2".to_string(), 0).unwrap();
        db.clear().unwrap();
        assert_eq!(db.get("a").unwrap(), None);
        assert_eq!(db.count().unwrap(), 0);
        db.set("c", &"3".to_string(), 0).unwrap();
        assert_eq!(db.get("c").unwrap().as_deref(), Some("3"));
        assert_eq!(db.count().unwrap(), 1);
    }
}
