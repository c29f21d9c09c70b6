#![deny(missing_docs)]

//! Crate to implement an embedded, single-file, multi-process persistent key/value store.
//! The whole store is one regular file: a small global header, a fixed-size array of
//! 589,823 hash buckets (32-bit head offsets) and an append-only record heap.  Records
//! that hash to the same bucket are chained through `prev`/`next` offsets kept in every
//! record header.  Keys map to buckets via CRC32 (see <https://github.com/srijs/rust-crc32fast>),
//! which is also used to checksum every stored value.
//!
//! Three store flavors share the engine:
//! - [`kv::KvStore`]: opaque values with optional TTL and in-place integer counters.
//! - [`set_store::SetStore`]: membership only, keyed by the raw 16-byte MD5 of the key.
//! - [`list_store::ListStore`]: each key owns an ordered doubly-linked list of values.
//!
//! Unrelated processes may open the same file concurrently.  Writes serialize through an
//! exclusive advisory lock on the whole file; reads take no lock and accept slightly
//! stale data.  Space from deleted records is reclaimed by an online compaction that
//! renames the file aside and rewrites it while readers and writers keep running.

pub mod chain;
pub(crate) mod crc;
pub mod error;
pub mod kv;
pub mod list_store;
pub(crate) mod optimize;
pub mod set_store;
pub mod store_bytes;
pub mod store_config;
pub(crate) mod store_file;
pub mod store_iter;

pub use crate::kv::{KvStore, Ttl};
pub use crate::list_store::ListStore;
pub use crate::set_store::SetStore;
pub use crate::store_bytes::{StoreBytes, StoreCount};
pub use crate::store_config::StoreConfig;

/// Number of hash buckets in every store file.  This is a file-format constant, fixed
/// for the life of a file.
pub const BUCKET_COUNT: u32 = 0x8FFFF;
