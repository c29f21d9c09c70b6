//! Define the configuration used to open a store.

use crate::error::OpenError;
use crate::kv::KvStore;
use crate::list_store::ListStore;
use crate::set_store::SetStore;
use crate::store_bytes::StoreBytes;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

/// Default number of bucket slots read per window while iterating.
pub const DEFAULT_ITERATOR_SLICE: u32 = 10_000;

/// Default minimum seconds between compactions of one file.
pub const DEFAULT_OPTIMIZE_INTERVAL: u32 = 7_200;

/// Configuration for a store.
///
/// All three flavors share this configuration; build one with [`StoreConfig::new`] and
/// finish with [`open_kv`](StoreConfig::open_kv), [`open_set`](StoreConfig::open_set) or
/// [`open_list`](StoreConfig::open_list).
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub(crate) path: PathBuf,
    pub(crate) quiet: bool,
    pub(crate) iterator_slice: u32,
    pub(crate) op_one_by_one: bool,
    pub(crate) chain_limit: Option<u32>,
    pub(crate) min_optimize_interval: u32,
}

impl StoreConfig {
    /// Create a new config for the store file at path.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            quiet: false,
            iterator_slice: DEFAULT_ITERATOR_SLICE,
            op_one_by_one: false,
            chain_limit: None,
            min_optimize_interval: DEFAULT_OPTIMIZE_INTERVAL,
        }
    }

    /// Path of the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Suppress operational warnings from the engine.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Set the number of bucket slots read per window while iterating.
    /// 1 minimizes the staleness window under concurrent writes, larger values minimize
    /// read cost.  Panics if slice is zero.
    pub fn set_iterator_slice(mut self, slice: u32) -> Self {
        if slice == 0 {
            panic!("iterator slice must be at least 1");
        }
        self.iterator_slice = slice;
        self
    }

    /// Force an iterator slice of 1 during compaction.  Recommended when concurrent
    /// writers are expected while optimize() runs.
    pub fn op_one_by_one(mut self) -> Self {
        self.op_one_by_one = true;
        self
    }

    /// Cap in-bucket chain walks at limit records.  Records beyond the cap are
    /// invisible to every operation.  Disabled by default.
    pub fn set_chain_limit(mut self, limit: u32) -> Self {
        self.chain_limit = Some(limit);
        self
    }

    /// Set the minimum seconds that must have passed since file creation before
    /// optimize() will run.  Can be overridden per call.
    pub fn set_min_optimize_interval(mut self, secs: u32) -> Self {
        self.min_optimize_interval = secs;
        self
    }

    /// Consume the config and open a KV store.
    pub fn open_kv<V>(self) -> Result<KvStore<V>, OpenError>
    where
        V: Debug + StoreBytes<V>,
    {
        KvStore::open(self)
    }

    /// Consume the config and open a key-set store.
    pub fn open_set(self) -> Result<SetStore, OpenError> {
        SetStore::open(self)
    }

    /// Consume the config and open a list store.
    pub fn open_list<V>(self) -> Result<ListStore<V>, OpenError>
    where
        V: Debug + StoreBytes<V>,
    {
        ListStore::open(self)
    }
}
