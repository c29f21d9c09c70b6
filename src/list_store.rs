//! The list flavor: every key owns an ordered, doubly-linked list of values.
//!
//! Two record shapes share the heap.  A key-header
//! (`kLen(2) | prev(4) | next(4) | valueHead(4) | key`) chains sibling keys within a
//! bucket and points at the head of that key's value list.  A value record
//! (`vLen(4) | prev(4) | next(4) | crc(4) | value`) links only to adjacent values of
//! the same key.  Key-headers die by a zero `kLen`; value records die by unlinking.
//!
//! Values to insert are staged in a pending buffer ([`ListStore::add_value`] and
//! friends); the insertion operations flush the buffer into the named key.  Indices are
//! zero-based and negative indices count from the end of the list.

use crate::chain::ChainGuard;
use crate::crc::{bucket_of, crc32};
use crate::error::deserialize::DeserializeError;
use crate::error::optimize::OptimizeError;
use crate::error::read::ReadError;
use crate::error::serialize::SerializeError;
use crate::error::write::WriteError;
use crate::error::{OpenError, StatusError, WalkError};
use crate::optimize::{self, Backfill};
use crate::store_bytes::StoreBytes;
use crate::store_config::StoreConfig;
use crate::store_file::header::Status;
use crate::store_file::StoreFile;
use crate::store_iter::ListIter;
use std::fmt::Debug;
use std::io;
use std::marker::PhantomData;

/// Size of a key-header record before its key bytes.
pub(crate) const KEY_HEADER_LEN: usize = 14;
/// Size of a value record before its value bytes.
pub(crate) const VALUE_HEADER_LEN: usize = 16;

/// Offset of the prev link within a key-header.
const KH_PREV_OFFSET: u64 = 2;
/// Offset of the next link within a key-header.
pub(crate) const KH_NEXT_OFFSET: u64 = 6;
/// Offset of the value-list head within a key-header.
const KH_HEAD_OFFSET: u64 = 10;

/// Offset of the prev link within a value record.
const V_PREV_OFFSET: u64 = 4;
/// Offset of the next link within a value record.
const V_NEXT_OFFSET: u64 = 8;

/// Parsed key-header record.
#[derive(Debug, Copy, Clone)]
pub(crate) struct KeyHeader {
    pub key_len: u16,
    pub prev: u32,
    pub next: u32,
    pub value_head: u32,
}

impl KeyHeader {
    /// Read a key-header at offset.
    pub fn load(sf: &mut StoreFile, offset: u32) -> Result<Self, WalkError> {
        let mut buffer = [0_u8; KEY_HEADER_LEN];
        sf.read_exact_at(offset as u64, &mut buffer)?;
        let mut buf16 = [0_u8; 2];
        let mut buf32 = [0_u8; 4];
        buf16.copy_from_slice(&buffer[0..2]);
        let key_len = u16::from_le_bytes(buf16);
        buf32.copy_from_slice(&buffer[2..6]);
        let prev = u32::from_le_bytes(buf32);
        buf32.copy_from_slice(&buffer[6..10]);
        let next = u32::from_le_bytes(buf32);
        buf32.copy_from_slice(&buffer[10..14]);
        let value_head = u32::from_le_bytes(buf32);
        Ok(Self {
            key_len,
            prev,
            next,
            value_head,
        })
    }

    /// Pack the header into its on-disk bytes.
    pub fn store(&self) -> [u8; KEY_HEADER_LEN] {
        let mut buffer = [0_u8; KEY_HEADER_LEN];
        buffer[0..2].copy_from_slice(&self.key_len.to_le_bytes());
        buffer[2..6].copy_from_slice(&self.prev.to_le_bytes());
        buffer[6..10].copy_from_slice(&self.next.to_le_bytes());
        buffer[10..14].copy_from_slice(&self.value_head.to_le_bytes());
        buffer
    }

    /// True for a dropped key.
    pub fn is_dead(&self) -> bool {
        self.key_len == 0
    }
}

/// Parsed value record.
#[derive(Debug, Copy, Clone)]
pub(crate) struct ValueRecord {
    pub value_len: u32,
    pub prev: u32,
    pub next: u32,
    pub crc: u32,
}

impl ValueRecord {
    /// Read a value record at offset.
    pub fn load(sf: &mut StoreFile, offset: u32) -> Result<Self, WalkError> {
        let mut buffer = [0_u8; VALUE_HEADER_LEN];
        sf.read_exact_at(offset as u64, &mut buffer)?;
        let mut buf32 = [0_u8; 4];
        buf32.copy_from_slice(&buffer[0..4]);
        let value_len = u32::from_le_bytes(buf32);
        buf32.copy_from_slice(&buffer[4..8]);
        let prev = u32::from_le_bytes(buf32);
        buf32.copy_from_slice(&buffer[8..12]);
        let next = u32::from_le_bytes(buf32);
        buf32.copy_from_slice(&buffer[12..16]);
        let crc = u32::from_le_bytes(buf32);
        Ok(Self {
            value_len,
            prev,
            next,
            crc,
        })
    }

    /// Pack the record into its on-disk bytes.
    pub fn store(&self) -> [u8; VALUE_HEADER_LEN] {
        let mut buffer = [0_u8; VALUE_HEADER_LEN];
        buffer[0..4].copy_from_slice(&self.value_len.to_le_bytes());
        buffer[4..8].copy_from_slice(&self.prev.to_le_bytes());
        buffer[8..12].copy_from_slice(&self.next.to_le_bytes());
        buffer[12..16].copy_from_slice(&self.crc.to_le_bytes());
        buffer
    }
}

/// Find the live key-header for key in its bucket chain.
pub(crate) fn find_header_in(
    sf: &mut StoreFile,
    key: &str,
) -> Result<Option<(u32, KeyHeader)>, WalkError> {
    let head_pos = sf.bucket_offset(bucket_of(key));
    let mut offset = sf.read_u32(head_pos)?;
    let mut guard = ChainGuard::new(sf.config().chain_limit);
    let mut key_buf = vec![0_u8; key.len()];
    while offset != 0 {
        if !guard.visit(offset)? {
            break;
        }
        let hdr = KeyHeader::load(sf, offset)?;
        if !hdr.is_dead() && hdr.key_len as usize == key.len() {
            sf.read_exact_at(offset as u64 + KEY_HEADER_LEN as u64, &mut key_buf)?;
            if key_buf == key.as_bytes() {
                return Ok(Some((offset, hdr)));
            }
        }
        offset = hdr.next;
    }
    Ok(None)
}

/// Append a key-header with an empty value list and link it at the bucket head.
fn create_header(sf: &mut StoreFile, key: &str) -> Result<(u32, KeyHeader), WriteError> {
    let head_pos = sf.bucket_offset(bucket_of(key));
    let head = sf.read_u32(head_pos)?;
    let hdr = KeyHeader {
        key_len: key.len() as u16,
        prev: 0,
        next: head,
        value_head: 0,
    };
    let mut buffer = Vec::with_capacity(KEY_HEADER_LEN + key.len());
    buffer.extend_from_slice(&hdr.store());
    buffer.extend_from_slice(key.as_bytes());
    let new_off = sf.append(&buffer)?;
    sf.write_u32(head_pos, new_off)?;
    if head != 0 {
        sf.write_u32(head as u64 + KH_PREV_OFFSET, new_off)?;
    }
    sf.increase_count()?;
    Ok((new_off, hdr))
}

/// Walk a key's value list collecting (offset, record) pairs in list order.
/// Value lists only get the cycle guard, not the bucket chain-length cap.
pub(crate) fn collect_values(
    sf: &mut StoreFile,
    head: u32,
    stop_after: Option<usize>,
) -> Result<Vec<(u32, ValueRecord)>, WalkError> {
    let mut entries = Vec::new();
    let mut guard = ChainGuard::new(None);
    let mut offset = head;
    while offset != 0 {
        guard.visit(offset)?;
        let rec = ValueRecord::load(sf, offset)?;
        entries.push((offset, rec));
        if let Some(stop) = stop_after {
            if entries.len() >= stop {
                break;
            }
        }
        offset = rec.next;
    }
    Ok(entries)
}

/// Read and checksum a value record's bytes.  None when the stored CRC does not match.
pub(crate) fn read_value_bytes(
    sf: &mut StoreFile,
    offset: u32,
    rec: &ValueRecord,
) -> Result<Option<Vec<u8>>, WalkError> {
    let mut bytes = vec![0_u8; rec.value_len as usize];
    sf.read_exact_at(offset as u64 + VALUE_HEADER_LEN as u64, &mut bytes)?;
    if crc32(&bytes) != rec.crc {
        return Ok(None);
    }
    Ok(Some(bytes))
}

/// Append one value record linked between prev_off and next_off (0 for the list head /
/// tail respectively) under the key-header at header_off.
pub(crate) fn insert_value(
    sf: &mut StoreFile,
    header_off: u32,
    prev_off: u32,
    next_off: u32,
    bytes: &[u8],
    crc: u32,
) -> Result<u32, io::Error> {
    let rec = ValueRecord {
        value_len: bytes.len() as u32,
        prev: prev_off,
        next: next_off,
        crc,
    };
    let mut buffer = Vec::with_capacity(VALUE_HEADER_LEN + bytes.len());
    buffer.extend_from_slice(&rec.store());
    buffer.extend_from_slice(bytes);
    let new_off = sf.append(&buffer)?;
    if prev_off == 0 {
        sf.write_u32(header_off as u64 + KH_HEAD_OFFSET, new_off)?;
    } else {
        sf.write_u32(prev_off as u64 + V_NEXT_OFFSET, new_off)?;
    }
    if next_off != 0 {
        sf.write_u32(next_off as u64 + V_PREV_OFFSET, new_off)?;
    }
    Ok(new_off)
}

/// Unlink the contiguous span between pred_off and succ_off (exclusive on both sides,
/// 0 meaning the list head / tail).
fn unlink_span(
    sf: &mut StoreFile,
    header_off: u32,
    pred_off: u32,
    succ_off: u32,
) -> Result<(), io::Error> {
    if pred_off == 0 {
        sf.write_u32(header_off as u64 + KH_HEAD_OFFSET, succ_off)?;
    } else {
        sf.write_u32(pred_off as u64 + V_NEXT_OFFSET, succ_off)?;
    }
    if succ_off != 0 {
        sf.write_u32(succ_off as u64 + V_PREV_OFFSET, pred_off)?;
    }
    Ok(())
}

/// Relink the list to exactly the surviving records, writing only the pointers that
/// actually change.
fn rewrite_survivors(
    sf: &mut StoreFile,
    header_off: u32,
    current_head: u32,
    survivors: &[(u32, ValueRecord)],
) -> Result<(), io::Error> {
    let (first_off, first) = match survivors.first() {
        Some(first) => first,
        None => return sf.write_u32(header_off as u64 + KH_HEAD_OFFSET, 0),
    };
    if current_head != *first_off {
        sf.write_u32(header_off as u64 + KH_HEAD_OFFSET, *first_off)?;
    }
    if first.prev != 0 {
        sf.write_u32(*first_off as u64 + V_PREV_OFFSET, 0)?;
    }
    for pair in survivors.windows(2) {
        let (a_off, a) = &pair[0];
        let (b_off, b) = &pair[1];
        if a.next != *b_off {
            sf.write_u32(*a_off as u64 + V_NEXT_OFFSET, *b_off)?;
        }
        if b.prev != *a_off {
            sf.write_u32(*b_off as u64 + V_PREV_OFFSET, *a_off)?;
        }
    }
    if let Some((last_off, last)) = survivors.last() {
        if last.next != 0 {
            sf.write_u32(*last_off as u64 + V_NEXT_OFFSET, 0)?;
        }
    }
    Ok(())
}

/// Copy a key's whole value list from the renamed old store into the live store.
/// Caller holds the exclusive lock on the live store.  Best effort: a key already
/// present (a concurrent writer beat us) or an old store being cleared are no-ops.
fn migrate_locked(sf: &mut StoreFile, key: &str) -> Result<(), WriteError> {
    if !sf.is_optimizing() {
        return Ok(());
    }
    let mut old = match sf.open_old(true) {
        Some(old) => old,
        None => return Ok(()),
    };
    // Never copy out of a store that clear() is emptying.
    match old.read_status() {
        Ok(Status::Clearing) | Err(_) => return Ok(()),
        Ok(_) => {}
    }
    if find_header_in(sf, key)?.is_some() {
        return Ok(());
    }
    let (_, old_hdr) = match find_header_in(&mut old, key)? {
        Some(found) => found,
        None => return Ok(()),
    };
    let entries = collect_values(&mut old, old_hdr.value_head, None)?;
    let (header_off, _) = create_header(sf, key)?;
    let mut prev = 0;
    for (value_off, rec) in entries {
        let mut bytes = vec![0_u8; rec.value_len as usize];
        old.read_exact_at(value_off as u64 + VALUE_HEADER_LEN as u64, &mut bytes)?;
        // Stored CRC is copied verbatim so a corrupt value stays detectably corrupt.
        prev = insert_value(sf, header_off, prev, 0, &bytes, rec.crc)?;
    }
    Ok(())
}

fn resolve_index(len: usize, idx: i64) -> Option<usize> {
    if idx < 0 {
        let i = len as i64 + idx;
        if i < 0 {
            None
        } else {
            Some(i as usize)
        }
    } else if (idx as usize) < len {
        Some(idx as usize)
    } else {
        None
    }
}

fn resolve_slice(len: usize, start: i64, length: Option<i64>) -> (usize, usize) {
    let len_i = len as i64;
    let start = if start < 0 {
        (len_i + start).max(0)
    } else {
        start.min(len_i)
    };
    let end = match length {
        None => len_i,
        Some(l) if l <= 0 => start,
        Some(l) => (start + l).min(len_i),
    };
    (start as usize, end.max(start) as usize)
}

/// An instance of a list store.
pub struct ListStore<V>
where
    V: Debug + StoreBytes<V>,
{
    file: StoreFile,
    pending: Vec<Vec<u8>>,
    _value: PhantomData<V>,
}

impl<V> ListStore<V>
where
    V: Debug + StoreBytes<V>,
{
    /// Open a new or existing list store.
    pub fn open(config: StoreConfig) -> Result<Self, OpenError> {
        Ok(Self {
            file: StoreFile::open(config)?,
            pending: Vec::new(),
            _value: PhantomData,
        })
    }

    /// Stage one value in the pending buffer for the next insertion operation.
    pub fn add_value(&mut self, value: &V) -> Result<(), SerializeError> {
        let mut buffer = Vec::new();
        value.serialize(&mut buffer)?;
        self.pending.push(buffer);
        Ok(())
    }

    /// Replace the pending buffer with values.
    pub fn set_values(&mut self, values: &[V]) -> Result<(), SerializeError> {
        self.pending.clear();
        for value in values {
            self.add_value(value)?;
        }
        Ok(())
    }

    /// Discard the pending buffer.
    pub fn clear_values(&mut self) {
        self.pending.clear();
    }

    /// Append the pending values to the tail of key's list, creating the key if
    /// absent.  An empty pending buffer is a no-op.
    pub fn push(&mut self, key: &str) -> Result<(), WriteError> {
        check_key(key)?;
        let values = std::mem::take(&mut self.pending);
        if values.is_empty() {
            return Ok(());
        }
        self.write_locked(key, |sf, key| {
            let (header_off, hdr) = match find_header_in(sf, key)? {
                Some(found) => found,
                None => create_header(sf, key)?,
            };
            let entries = collect_values(sf, hdr.value_head, None)?;
            let mut tail = entries.last().map(|(off, _)| *off).unwrap_or(0);
            for bytes in &values {
                tail = insert_value(sf, header_off, tail, 0, bytes, crc32(bytes))?;
            }
            Ok(())
        })
    }

    /// Prepend the pending values to the head of key's list in buffer order, creating
    /// the key if absent.  An empty pending buffer is a no-op.
    pub fn insert(&mut self, key: &str) -> Result<(), WriteError> {
        check_key(key)?;
        let values = std::mem::take(&mut self.pending);
        if values.is_empty() {
            return Ok(());
        }
        self.write_locked(key, |sf, key| {
            let (header_off, hdr) = match find_header_in(sf, key)? {
                Some(found) => found,
                None => create_header(sf, key)?,
            };
            let mut head = hdr.value_head;
            // Reverse so the buffer lands in order ahead of the old head.
            for bytes in values.iter().rev() {
                head = insert_value(sf, header_off, 0, head, bytes, crc32(bytes))?;
            }
            Ok(())
        })
    }

    /// Insert the pending values directly after the first value whose stored CRC
    /// matches the pivot's serialized CRC.  Fails with NotFound when the key or a
    /// matching value is absent.
    pub fn append(&mut self, key: &str, pivot: &V) -> Result<(), WriteError> {
        self.insert_at_pivot(key, pivot, false)
    }

    /// Insert the pending values directly before the first value whose stored CRC
    /// matches the pivot's serialized CRC.  Fails with NotFound when the key or a
    /// matching value is absent.
    pub fn prepend(&mut self, key: &str, pivot: &V) -> Result<(), WriteError> {
        self.insert_at_pivot(key, pivot, true)
    }

    fn insert_at_pivot(&mut self, key: &str, pivot: &V, before: bool) -> Result<(), WriteError> {
        check_key(key)?;
        let mut pivot_bytes = Vec::new();
        pivot.serialize(&mut pivot_bytes)?;
        let pivot_crc = crc32(&pivot_bytes);
        let values = std::mem::take(&mut self.pending);
        if values.is_empty() {
            return Ok(());
        }
        self.write_locked(key, |sf, key| {
            let (header_off, hdr) = match find_header_in(sf, key)? {
                Some(found) => found,
                None => return Err(WriteError::NotFound),
            };
            let entries = collect_values(sf, hdr.value_head, None)?;
            let (anchor_off, anchor) = match entries.iter().find(|(_, rec)| rec.crc == pivot_crc) {
                Some(found) => *found,
                None => return Err(WriteError::NotFound),
            };
            let (mut prev, next) = if before {
                (anchor.prev, anchor_off)
            } else {
                (anchor_off, anchor.next)
            };
            for bytes in &values {
                prev = insert_value(sf, header_off, prev, next, bytes, crc32(bytes))?;
            }
            Ok(())
        })
    }

    /// Insert the pending values after the value at idx (negative counts from the
    /// end).  The sentinel -1 behaves as [`push`](ListStore::push) and may create the
    /// key; any other index requires the key and position to exist.
    pub fn append_by_index(&mut self, key: &str, idx: i64) -> Result<(), WriteError> {
        if idx == -1 {
            return self.push(key);
        }
        self.insert_at_index(key, idx, false)
    }

    /// Insert the pending values before the value at idx (negative counts from the
    /// end).  The sentinel 0 behaves as [`insert`](ListStore::insert) and may create
    /// the key; any other index requires the key and position to exist.
    pub fn prepend_by_index(&mut self, key: &str, idx: i64) -> Result<(), WriteError> {
        if idx == 0 {
            return self.insert(key);
        }
        self.insert_at_index(key, idx, true)
    }

    fn insert_at_index(&mut self, key: &str, idx: i64, before: bool) -> Result<(), WriteError> {
        check_key(key)?;
        let values = std::mem::take(&mut self.pending);
        if values.is_empty() {
            return Ok(());
        }
        self.write_locked(key, |sf, key| {
            let (header_off, hdr) = match find_header_in(sf, key)? {
                Some(found) => found,
                None => return Err(WriteError::NotFound),
            };
            let entries = collect_values(sf, hdr.value_head, None)?;
            let at = match resolve_index(entries.len(), idx) {
                Some(at) => at,
                None => return Err(WriteError::BadIndex),
            };
            let (anchor_off, anchor) = entries[at];
            let (mut prev, next) = if before {
                (anchor.prev, anchor_off)
            } else {
                (anchor_off, anchor.next)
            };
            for bytes in &values {
                prev = insert_value(sf, header_off, prev, next, bytes, crc32(bytes))?;
            }
            Ok(())
        })
    }

    /// Overwrite the value at idx.  Updates in place when the new serialization is no
    /// longer than the old one, otherwise relinks a fresh record in its position.
    pub fn alter(&mut self, key: &str, idx: i64, value: &V) -> Result<(), WriteError> {
        check_key(key)?;
        let mut bytes = Vec::new();
        value.serialize(&mut bytes)?;
        self.write_locked(key, |sf, key| {
            let (header_off, hdr) = match find_header_in(sf, key)? {
                Some(found) => found,
                None => return Err(WriteError::NotFound),
            };
            let entries = collect_values(sf, hdr.value_head, None)?;
            let at = match resolve_index(entries.len(), idx) {
                Some(at) => at,
                None => return Err(WriteError::BadIndex),
            };
            let (off, rec) = entries[at];
            if bytes.len() <= rec.value_len as usize {
                let updated = ValueRecord {
                    value_len: bytes.len() as u32,
                    crc: crc32(&bytes),
                    ..rec
                };
                sf.write_all_at(off as u64, &updated.store())?;
                sf.write_all_at(off as u64 + VALUE_HEADER_LEN as u64, &bytes)?;
            } else {
                let new_off =
                    insert_value_unlinked(sf, rec.prev, rec.next, &bytes, crc32(&bytes))?;
                if rec.prev == 0 {
                    sf.write_u32(header_off as u64 + KH_HEAD_OFFSET, new_off)?;
                } else {
                    sf.write_u32(rec.prev as u64 + V_NEXT_OFFSET, new_off)?;
                }
                if rec.next != 0 {
                    sf.write_u32(rec.next as u64 + V_PREV_OFFSET, new_off)?;
                }
            }
            Ok(())
        })
    }

    /// Unlink and return the tail value.  None for an absent key or empty list.
    /// A value that fails its checksum is still unlinked but returns None.
    pub fn pop(&mut self, key: &str) -> Result<Option<V>, WriteError> {
        self.take_end(key, true)
    }

    /// Unlink and return the head value.  None for an absent key or empty list.
    /// A value that fails its checksum is still unlinked but returns None.
    pub fn shift(&mut self, key: &str) -> Result<Option<V>, WriteError> {
        self.take_end(key, false)
    }

    fn take_end(&mut self, key: &str, tail: bool) -> Result<Option<V>, WriteError> {
        check_key(key)?;
        let quiet = self.file.quiet();
        self.write_locked(key, |sf, key| {
            let (header_off, hdr) = match find_header_in(sf, key)? {
                Some(found) => found,
                None => return Ok(None),
            };
            let entries = collect_values(sf, hdr.value_head, None)?;
            if entries.is_empty() {
                return Ok(None);
            }
            let (off, rec, pred, succ) = if tail {
                let (off, rec) = entries[entries.len() - 1];
                let pred = if entries.len() > 1 {
                    entries[entries.len() - 2].0
                } else {
                    0
                };
                (off, rec, pred, 0)
            } else {
                let (off, rec) = entries[0];
                let succ = if entries.len() > 1 { entries[1].0 } else { 0 };
                (off, rec, 0, succ)
            };
            let bytes = read_value_bytes(sf, off, &rec)?;
            unlink_span(sf, header_off, pred, succ)?;
            match bytes {
                Some(bytes) => match V::deserialize(&bytes) {
                    Ok(value) => Ok(Some(value)),
                    Err(e) => {
                        if !quiet {
                            tracing::warn!("dropping undeserializable list value: {}", e);
                        }
                        Ok(None)
                    }
                },
                None => Ok(None),
            }
        })
    }

    /// Unlink the slice `[start, start+length)` from key's list; a None length means
    /// "to the end".  `remove(key, 0, None)` short-circuits to zeroing the key's value
    /// head.  Absent keys succeed.
    pub fn remove(&mut self, key: &str, start: i64, length: Option<i64>) -> Result<(), WriteError> {
        check_key(key)?;
        self.write_locked(key, |sf, key| {
            let (header_off, hdr) = match find_header_in(sf, key)? {
                Some(found) => found,
                None => return Ok(()),
            };
            if start == 0 && length.is_none() {
                sf.write_u32(header_off as u64 + KH_HEAD_OFFSET, 0)?;
                return Ok(());
            }
            let entries = collect_values(sf, hdr.value_head, None)?;
            let (s, e) = resolve_slice(entries.len(), start, length);
            if s >= e {
                return Ok(());
            }
            let pred = if s == 0 { 0 } else { entries[s - 1].0 };
            let succ = if e == entries.len() { 0 } else { entries[e].0 };
            unlink_span(sf, header_off, pred, succ)?;
            Ok(())
        })
    }

    /// Retain only the slice `[start, start+length)` of key's list; a None length
    /// means "to the end".  Absent keys succeed.
    pub fn keep(&mut self, key: &str, start: i64, length: Option<i64>) -> Result<(), WriteError> {
        check_key(key)?;
        self.write_locked(key, |sf, key| {
            let (header_off, hdr) = match find_header_in(sf, key)? {
                Some(found) => found,
                None => return Ok(()),
            };
            let entries = collect_values(sf, hdr.value_head, None)?;
            let (s, e) = resolve_slice(entries.len(), start, length);
            if s >= e {
                sf.write_u32(header_off as u64 + KH_HEAD_OFFSET, 0)?;
                return Ok(());
            }
            let (first_off, first) = entries[s];
            let (last_off, last) = entries[e - 1];
            if hdr.value_head != first_off {
                sf.write_u32(header_off as u64 + KH_HEAD_OFFSET, first_off)?;
            }
            if first.prev != 0 {
                sf.write_u32(first_off as u64 + V_PREV_OFFSET, 0)?;
            }
            if last.next != 0 {
                sf.write_u32(last_off as u64 + V_NEXT_OFFSET, 0)?;
            }
            Ok(())
        })
    }

    /// Unlink the values at the given indices (negative counts from the end,
    /// out-of-range entries are ignored), rewriting only the pointers that change.
    pub fn remove_index(&mut self, key: &str, idxs: &[i64]) -> Result<(), WriteError> {
        self.index_surgery(key, idxs, false)
    }

    /// Retain only the values at the given indices (negative counts from the end,
    /// out-of-range entries are ignored), rewriting only the pointers that change.
    pub fn keep_index(&mut self, key: &str, idxs: &[i64]) -> Result<(), WriteError> {
        self.index_surgery(key, idxs, true)
    }

    fn index_surgery(&mut self, key: &str, idxs: &[i64], keep: bool) -> Result<(), WriteError> {
        check_key(key)?;
        self.write_locked(key, |sf, key| {
            let (header_off, hdr) = match find_header_in(sf, key)? {
                Some(found) => found,
                None => return Ok(()),
            };
            let entries = collect_values(sf, hdr.value_head, None)?;
            let mut selected = vec![false; entries.len()];
            for idx in idxs {
                if let Some(at) = resolve_index(entries.len(), *idx) {
                    selected[at] = true;
                }
            }
            let survivors: Vec<(u32, ValueRecord)> = entries
                .iter()
                .enumerate()
                .filter(|(at, _)| selected[*at] == keep)
                .map(|(_, entry)| *entry)
                .collect();
            rewrite_survivors(sf, header_off, hdr.value_head, &survivors)?;
            Ok(())
        })
    }

    /// Values in the slice `[start, start+length)` of key's list; a None length means
    /// "to the end".  Empty for an absent key.  Checksum-invalid values are skipped.
    pub fn range(
        &mut self,
        key: &str,
        start: i64,
        length: Option<i64>,
    ) -> Result<Vec<V>, ReadError> {
        self.file.admit(false)?;
        let (_, hdr) = match self.find_header_reading(key)? {
            Some(found) => found,
            None => return Ok(Vec::new()),
        };
        // Forward-bounded queries stop the walk early; negative starts need the whole
        // list for positional slicing.
        let stop_after = match (start >= 0, length) {
            (true, Some(l)) if l >= 0 => Some((start + l) as usize),
            (true, None) => None,
            _ => None,
        };
        let entries = collect_values(&mut self.file, hdr.value_head, stop_after)?;
        let (s, e) = resolve_slice(entries.len(), start, length);
        let mut out = Vec::with_capacity(e - s);
        for (off, rec) in &entries[s..e] {
            if let Some(bytes) = read_value_bytes(&mut self.file, *off, rec)? {
                out.push(V::deserialize(&bytes)?);
            }
        }
        Ok(out)
    }

    /// Number of values in key's list, zero for an absent key.
    pub fn len(&mut self, key: &str) -> Result<usize, ReadError> {
        self.file.admit(false)?;
        match self.find_header_reading(key)? {
            Some((_, hdr)) => Ok(collect_values(&mut self.file, hdr.value_head, None)?.len()),
            None => Ok(0),
        }
    }

    /// Position of the first value whose stored CRC matches value's serialized CRC.
    pub fn search(&mut self, key: &str, value: &V) -> Result<Option<usize>, ReadError> {
        let mut bytes = Vec::new();
        if let Err(e) = value.serialize(&mut bytes) {
            return Err(ReadError::Deserialize(DeserializeError::new(e.to_string())));
        }
        let needle = crc32(&bytes);
        self.file.admit(false)?;
        let (_, hdr) = match self.find_header_reading(key)? {
            Some(found) => found,
            None => return Ok(None),
        };
        let entries = collect_values(&mut self.file, hdr.value_head, None)?;
        Ok(entries.iter().position(|(_, rec)| rec.crc == needle))
    }

    /// True if key has a live key-header, even with an empty value list.
    pub fn exists(&mut self, key: &str) -> Result<bool, ReadError> {
        self.file.admit(false)?;
        Ok(self.find_header_reading(key)?.is_some())
    }

    /// Drop key and its whole value list.  Dropping an absent key succeeds.
    pub fn drop_key(&mut self, key: &str) -> Result<(), WriteError> {
        check_key(key)?;
        let res = self.write_locked(key, |sf, key| {
            let (off, hdr) = match find_header_in(sf, key)? {
                Some(found) => found,
                None => return Ok(()),
            };
            sf.write_all_at(off as u64, &0_u16.to_le_bytes())?;
            let fwd_pos = if hdr.prev == 0 {
                sf.bucket_offset(bucket_of(key))
            } else {
                hdr.prev as u64 + KH_NEXT_OFFSET
            };
            sf.write_u32(fwd_pos, hdr.next)?;
            if hdr.next != 0 {
                sf.write_u32(hdr.next as u64 + KH_PREV_OFFSET, hdr.prev)?;
            }
            sf.decrease_count()?;
            Ok(())
        });
        // Dead-mark in the old store as well so the compactor cannot re-insert it.
        if self.file.is_optimizing() {
            if let Some(mut old) = self.file.open_old(true) {
                if let Ok(Some((off, _))) = find_header_in(&mut old, key) {
                    let _ = old.write_all_at(off as u64, &0_u16.to_le_bytes());
                }
            }
        }
        res
    }

    /// Number of live keys.  Advisory, like every count in the engine.
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

    /// Drop every key.  The file is rebuilt empty by the next operation.
    pub fn clear(&mut self) -> Result<(), WriteError> {
        Ok(self.file.clear()?)
    }

    /// Iterate all live keys with their value lists.
    pub fn iter(&mut self) -> Result<ListIter<V>, ReadError> {
        self.file.admit(false)?;
        let file = self.file.duplicate()?;
        Ok(ListIter::new(file))
    }

    /// Rewrite the file, dropping dead keys and orphaned values.  See
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

    /// Run op under the status machine, the exclusive lock and after the
    /// read-triggered migration of key from a store being compacted.
    fn write_locked<T>(
        &mut self,
        key: &str,
        op: impl FnOnce(&mut StoreFile, &str) -> Result<T, WriteError>,
    ) -> Result<T, WriteError> {
        self.file.lock_admitted(true)?;
        let res = (|| {
            migrate_locked(&mut self.file, key)?;
            op(&mut self.file, key)
        })();
        self.file.unlock();
        res
    }

    /// Header lookup for reads: check the live store, then migrate from the old store
    /// under the lock and look again.  Migration failures degrade to a miss.
    fn find_header_reading(
        &mut self,
        key: &str,
    ) -> Result<Option<(u32, KeyHeader)>, ReadError> {
        if let Some(found) = find_header_in(&mut self.file, key)? {
            return Ok(Some(found));
        }
        if self.file.is_optimizing() {
            self.file.lock()?;
            let res = migrate_locked(&mut self.file, key);
            self.file.unlock();
            if let Err(e) = res {
                if !self.file.quiet() {
                    tracing::warn!("list migration failed for a key during read: {}", e);
                }
            }
            return Ok(find_header_in(&mut self.file, key)?);
        }
        Ok(None)
    }
}

/// Append a value record without touching any neighbor links; the caller patches them.
fn insert_value_unlinked(
    sf: &mut StoreFile,
    prev_off: u32,
    next_off: u32,
    bytes: &[u8],
    crc: u32,
) -> Result<u32, io::Error> {
    let rec = ValueRecord {
        value_len: bytes.len() as u32,
        prev: prev_off,
        next: next_off,
        crc,
    };
    let mut buffer = Vec::with_capacity(VALUE_HEADER_LEN + bytes.len());
    buffer.extend_from_slice(&rec.store());
    buffer.extend_from_slice(bytes);
    sf.append(&buffer)
}

impl<V> Backfill for ListStore<V>
where
    V: Debug + StoreBytes<V>,
{
    fn backfill_bucket(
        old: &mut StoreFile,
        new: &mut StoreFile,
        _bucket: u32,
        head: u32,
    ) -> Result<(), OptimizeError> {
        let mut guard = ChainGuard::new(old.config().chain_limit);
        let mut offset = head;
        while offset != 0 {
            if !guard.visit(offset)? {
                break;
            }
            let hdr = KeyHeader::load(old, offset)?;
            if !hdr.is_dead() {
                let mut key_buf = vec![0_u8; hdr.key_len as usize];
                old.read_exact_at(offset as u64 + KEY_HEADER_LEN as u64, &mut key_buf)?;
                if let Ok(key) = String::from_utf8(key_buf) {
                    let entries = collect_values(old, hdr.value_head, None)?;
                    let mut values = Vec::with_capacity(entries.len());
                    for (value_off, rec) in entries {
                        let mut bytes = vec![0_u8; rec.value_len as usize];
                        old.read_exact_at(
                            value_off as u64 + VALUE_HEADER_LEN as u64,
                            &mut bytes,
                        )?;
                        values.push((bytes, rec.crc));
                    }
                    new.lock().map_err(WriteError::IO)?;
                    let res = (|| -> Result<(), WriteError> {
                        if find_header_in(new, &key)?.is_some() {
                            // A concurrent writer already owns this key in the new
                            // store; its list is newer than ours.
                            return Ok(());
                        }
                        let (header_off, _) = create_header(new, &key)?;
                        let mut prev = 0;
                        for (bytes, crc) in &values {
                            prev = insert_value(new, header_off, prev, 0, bytes, *crc)?;
                        }
                        Ok(())
                    })();
                    new.unlock();
                    res?;
                }
            }
            offset = hdr.next;
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

    fn open_store(dir: &TempDir) -> ListStore<String> {
        StoreConfig::new(dir.path().join("db.list")).open_list().unwrap()
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn seed(store: &mut ListStore<String>, key: &str, values: &[&str]) {
        store.set_values(&strings(values)).unwrap();
        store.push(key).unwrap();
    }

    #[test]
    fn test_push_insert_pivot() {
        let dir = TempDir::new().unwrap();
        let mut list = open_store(&dir);

        seed(&mut list, "foo", &["foo1", "foo2"]);
        assert_eq!(list.range("foo", 0, None).unwrap(), strings(&["foo1", "foo2"]));

        list.set_values(&strings(&["foo0"])).unwrap();
        list.insert("foo").unwrap();
        assert_eq!(
            list.range("foo", 0, None).unwrap(),
            strings(&["foo0", "foo1", "foo2"])
        );

        list.set_values(&strings(&["bar"])).unwrap();
        list.append("foo", &"foo1".to_string()).unwrap();
        assert_eq!(
            list.range("foo", 0, None).unwrap(),
            strings(&["foo0", "foo1", "bar", "foo2"])
        );

        list.set_values(&strings(&["biz"])).unwrap();
        list.prepend("foo", &"foo1".to_string()).unwrap();
        assert_eq!(
            list.range("foo", 0, None).unwrap(),
            strings(&["foo0", "biz", "foo1", "bar", "foo2"])
        );

        // Pivot insertion on a missing pivot or key fails.
        list.set_values(&strings(&["x"])).unwrap();
        assert!(matches!(
            list.append("foo", &"nope".to_string()),
            Err(WriteError::NotFound)
        ));
        list.set_values(&strings(&["x"])).unwrap();
        assert!(matches!(
            list.append("nokey", &"foo1".to_string()),
            Err(WriteError::NotFound)
        ));
    }

    #[test]
    fn test_slices() {
        let dir = TempDir::new().unwrap();
        let mut list = open_store(&dir);
        let all = ["f1", "f2", "f3", "f4", "f5", "f6"];

        seed(&mut list, "a", &all);
        list.remove("a", 2, None).unwrap();
        assert_eq!(list.range("a", 0, None).unwrap(), strings(&["f1", "f2"]));

        seed(&mut list, "b", &all);
        list.remove("b", -2, None).unwrap();
        assert_eq!(
            list.range("b", 0, None).unwrap(),
            strings(&["f1", "f2", "f3", "f4"])
        );

        seed(&mut list, "c", &all);
        list.keep("c", 2, Some(3)).unwrap();
        assert_eq!(list.range("c", 0, None).unwrap(), strings(&["f3", "f4", "f5"]));

        seed(&mut list, "d", &all);
        list.keep("d", -5, Some(3)).unwrap();
        assert_eq!(list.range("d", 0, None).unwrap(), strings(&["f2", "f3", "f4"]));

        // Full removal zeroes the head but keeps the key.
        seed(&mut list, "e", &all);
        list.remove("e", 0, None).unwrap();
        assert_eq!(list.range("e", 0, None).unwrap(), Vec::<String>::new());
        assert!(list.exists("e").unwrap());
    }

    #[test]
    fn test_index_sets() {
        let dir = TempDir::new().unwrap();
        let mut list = open_store(&dir);
        let all = ["f1", "f2", "f3", "f4", "f5", "f6"];

        seed(&mut list, "a", &all);
        list.remove_index("a", &[0, 2, 5]).unwrap();
        assert_eq!(list.range("a", 0, None).unwrap(), strings(&["f2", "f4", "f5"]));

        seed(&mut list, "b", &all);
        list.keep_index("b", &[0, 2, 5]).unwrap();
        assert_eq!(list.range("b", 0, None).unwrap(), strings(&["f1", "f3", "f6"]));

        // Negative and out-of-range indices.
        seed(&mut list, "c", &all);
        list.remove_index("c", &[-1, -6, 100]).unwrap();
        assert_eq!(
            list.range("c", 0, None).unwrap(),
            strings(&["f2", "f3", "f4", "f5"])
        );
    }

    #[test]
    fn test_pop_shift() {
        let dir = TempDir::new().unwrap();
        let mut list = open_store(&dir);
        seed(&mut list, "k", &["a", "b", "c"]);
        assert_eq!(list.pop("k").unwrap().as_deref(), Some("c"));
        assert_eq!(list.shift("k").unwrap().as_deref(), Some("a"));
        assert_eq!(list.range("k", 0, None).unwrap(), strings(&["b"]));
        assert_eq!(list.pop("k").unwrap().as_deref(), Some("b"));
        assert_eq!(list.pop("k").unwrap(), None);
        assert_eq!(list.shift("missing").unwrap(), None);
    }

    #[test]
    fn test_alter() {
        let dir = TempDir::new().unwrap();
        let mut list = open_store(&dir);
        seed(&mut list, "k", &["one", "two", "three"]);
        // Shorter value updates in place.
        list.alter("k", 1, &"II".to_string()).unwrap();
        assert_eq!(
            list.range("k", 0, None).unwrap(),
            strings(&["one", "II", "three"])
        );
        // Longer value grows and relinks, including at the head.
        list.alter("k", 0, &"the first value".to_string()).unwrap();
        assert_eq!(
            list.range("k", 0, None).unwrap(),
            strings(&["the first value", "II", "three"])
        );
        list.alter("k", -1, &"the last value".to_string()).unwrap();
        assert_eq!(
            list.range("k", 0, None).unwrap(),
            strings(&["the first value", "II", "the last value"])
        );
        assert!(matches!(
            list.alter("k", 9, &"x".to_string()),
            Err(WriteError::BadIndex)
        ));
    }

    #[test]
    fn test_range_len_search() {
        let dir = TempDir::new().unwrap();
        let mut list = open_store(&dir);
        seed(&mut list, "k", &["a", "b", "c", "d", "e"]);
        assert_eq!(list.len("k").unwrap(), 5);
        assert_eq!(list.range("k", 1, Some(2)).unwrap(), strings(&["b", "c"]));
        assert_eq!(list.range("k", -2, None).unwrap(), strings(&["d", "e"]));
        assert_eq!(list.range("k", -4, Some(2)).unwrap(), strings(&["b", "c"]));
        assert_eq!(list.range("k", 10, None).unwrap(), Vec::<String>::new());
        assert_eq!(list.search("k", &"c".to_string()).unwrap(), Some(2));
        assert_eq!(list.search("k", &"zz".to_string()).unwrap(), None);
        assert_eq!(list.len("missing").unwrap(), 0);
    }

    #[test]
    fn test_drop_key() {
        let dir = TempDir::new().unwrap();
        let mut list = open_store(&dir);
        seed(&mut list, "keep", &["1"]);
        seed(&mut list, "gone", &["2"]);
        assert_eq!(list.count().unwrap(), 2);
        list.drop_key("gone").unwrap();
        assert!(!list.exists("gone").unwrap());
        assert!(list.exists("keep").unwrap());
        assert_eq!(list.count().unwrap(), 1);
        // Idempotent.
        list.drop_key("gone").unwrap();
        assert_eq!(list.count().unwrap(), 1);
        // A dropped key can be recreated.
        seed(&mut list, "gone", &["3"]);
        assert_eq!(list.range("gone", 0, None).unwrap(), strings(&["3"]));
    }

    #[test]
    fn test_pending_buffer() {
        let dir = TempDir::new().unwrap();
        let mut list = open_store(&dir);
        list.add_value(&"a".to_string()).unwrap();
        list.add_value(&"b".to_string()).unwrap();
        list.clear_values();
        // Nothing staged: push is a no-op and creates no key.
        list.push("k").unwrap();
        assert!(!list.exists("k").unwrap());

        list.add_value(&"a".to_string()).unwrap();
        list.push("k").unwrap();
        // The buffer flushes on use.
        list.push("k").unwrap();
        assert_eq!(list.range("k", 0, None).unwrap(), strings(&["a"]));
    }

    #[test]
    fn test_by_index_sentinels() {
        let dir = TempDir::new().unwrap();
        let mut list = open_store(&dir);
        // End-of-list sentinels create the key like push/insert.
        list.set_values(&strings(&["b"])).unwrap();
        list.append_by_index("k", -1).unwrap();
        list.set_values(&strings(&["a"])).unwrap();
        list.prepend_by_index("k", 0).unwrap();
        assert_eq!(list.range("k", 0, None).unwrap(), strings(&["a", "b"]));

        list.set_values(&strings(&["mid"])).unwrap();
        list.append_by_index("k", 0).unwrap();
        assert_eq!(list.range("k", 0, None).unwrap(), strings(&["a", "mid", "b"]));

        list.set_values(&strings(&["late"])).unwrap();
        list.prepend_by_index("k", -1).unwrap();
        assert_eq!(
            list.range("k", 0, None).unwrap(),
            strings(&["a", "mid", "late", "b"])
        );

        list.set_values(&strings(&["x"])).unwrap();
        assert!(matches!(
            list.append_by_index("k", 17),
            Err(WriteError::BadIndex)
        ));
        list.set_values(&strings(&["x"])).unwrap();
        assert!(matches!(
            list.append_by_index("nokey", 2),
            Err(WriteError::NotFound)
        ));
    }
}
