//! Pair: единица кэша: (file, key) → value.
//!
//! Метаданные пары (dirty, pending, clock count, attr, локи, ссылки списков)
//! живут в арене PairList под table lock. Содержимое (value, disk_data,
//! cloned) лежит в Arc<PairCells<V>>: к нему обращаются с отпущенным table
//! lock, а доступ арбитрируют value/disk PairLock'и, поэтому внутренние
//! mutex'ы ячеек никогда не конкурируют.

use anyhow::Result;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use super::files::FileCtx;
use crate::consts::CLOCK_INITIAL_COUNT;
use crate::sync::PairLock;
use crate::util::relock;

pub type CacheKey = u64;
pub type Lsn = u64;

/// Small integer naming an open cache file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FileNum(pub u32);

impl fmt::Display for FileNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Byte-size descriptor. Every component is summed independently.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PairAttr {
    pub size: i64,
    pub nonleaf_size: i64,
    pub leaf_size: i64,
    pub rollback_size: i64,
    pub cache_pressure_size: i64,
}

impl PairAttr {
    pub const ZERO: PairAttr =
        PairAttr { size: 0, nonleaf_size: 0, leaf_size: 0, rollback_size: 0, cache_pressure_size: 0 };

    /// Attr with only the total set.
    pub fn sized(size: i64) -> Self {
        PairAttr { size, ..PairAttr::ZERO }
    }

    pub fn with_cache_pressure(mut self, bytes: i64) -> Self {
        self.cache_pressure_size = bytes;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dirty {
    Clean,
    Dirty,
}

impl Dirty {
    #[inline]
    pub fn is_dirty(self) -> bool {
        self == Dirty::Dirty
    }
}

impl From<bool> for Dirty {
    fn from(b: bool) -> Self {
        if b {
            Dirty::Dirty
        } else {
            Dirty::Clean
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartialEvictionCost {
    Cheap,
    Expensive,
}

/// Arguments of a flush call.
///
/// `write_me`: serialize the value to disk. `keep_me`: the value stays cached
/// (false means the pair is being freed and the callee may drop its buffers).
/// `is_clone`: `value` is a checkpoint clone, not the live value.
pub struct FlushArgs<'a, V> {
    pub file: &'a FileCtx,
    pub key: CacheKey,
    pub value: &'a mut V,
    pub disk_data: &'a mut Option<Vec<u8>>,
    pub old_attr: PairAttr,
    pub write_me: bool,
    pub keep_me: bool,
    pub for_checkpoint: bool,
    pub is_clone: bool,
}

/// Result of a clone call.
pub struct ClonedValue<V> {
    pub value: V,
    /// Bytes held by the clone until its write completes.
    pub size: i64,
    /// New attr of the live pair, if cloning changed it.
    pub new_attr: Option<PairAttr>,
}

pub struct CleanerOutcome {
    pub dirty: bool,
    pub new_attr: Option<PairAttr>,
}

/// What a loader produces on a miss.
pub struct Fetched<V> {
    pub value: V,
    pub disk_data: Option<Vec<u8>>,
    pub attr: PairAttr,
    pub dirty: bool,
}

/// Write-side callbacks of a pair kind.
///
/// Called with the table lock released and the pair's value lock (or, for
/// clone writes, its disk lock) held by the calling path. Errors from
/// `flush`, `partial_evict`, `clone_value` and `cleaner` are fatal to the
/// process.
pub trait WriteCallbacks<V>: Send + Sync {
    /// Write and/or release a pair. Returns the pair's new attr when it
    /// stays cached and its size changed.
    fn flush(&self, args: FlushArgs<'_, V>) -> Result<Option<PairAttr>>;

    /// Estimated bytes a partial eviction would free, and its cost.
    fn pe_estimate(&self, _value: &V, _attr: PairAttr) -> (i64, PartialEvictionCost) {
        (0, PartialEvictionCost::Cheap)
    }

    /// Trim the in-memory footprint without dropping the pair.
    fn partial_evict(&self, _value: &mut V, attr: PairAttr) -> Result<PairAttr> {
        Ok(attr)
    }

    fn supports_clone(&self) -> bool {
        false
    }

    /// Snapshot the live value for a checkpoint write.
    fn clone_value(&self, _value: &mut V, _for_checkpoint: bool) -> Result<ClonedValue<V>> {
        anyhow::bail!("clone not supported by this pair kind")
    }

    /// Proactive cleaning of a pair chosen by cache pressure.
    fn cleaner(&self, _value: &mut V, _key: CacheKey, _fullhash: u32) -> Result<CleanerOutcome> {
        Ok(CleanerOutcome { dirty: false, new_attr: None })
    }

    /// Notified after a checkpoint write of the live value completed.
    fn checkpoint_complete(&self, _value: &mut V, _key: CacheKey) {}
}

/// Read-side callbacks.
pub trait PairLoader<V>: Send + Sync {
    fn fetch(&self, file: &FileCtx, key: CacheKey, fullhash: u32) -> Result<Fetched<V>>;

    fn partial_fetch_required(&self, _value: &V) -> bool {
        false
    }

    fn partial_fetch(
        &self,
        _value: &mut V,
        _disk_data: &mut Option<Vec<u8>>,
        _file: &FileCtx,
        attr: PairAttr,
    ) -> Result<PairAttr> {
        Ok(attr)
    }
}

/// Callbacks of one pair kind: write side and read side.
pub struct PairCallbacks<V> {
    pub write: Arc<dyn WriteCallbacks<V>>,
    pub load: Arc<dyn PairLoader<V>>,
}

impl<V> PairCallbacks<V> {
    /// Both sides served by one object.
    pub fn new<T>(cbs: Arc<T>) -> Self
    where
        T: WriteCallbacks<V> + PairLoader<V> + 'static,
    {
        let write: Arc<dyn WriteCallbacks<V>> = Arc::clone(&cbs) as Arc<dyn WriteCallbacks<V>>;
        Self { write, load: cbs }
    }
}

impl<V> Clone for PairCallbacks<V> {
    fn clone(&self) -> Self {
        Self { write: Arc::clone(&self.write), load: Arc::clone(&self.load) }
    }
}

/// Generational handle into the pair arena. A stale id is detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PairId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl PairId {
    pub(crate) const NIL: PairId = PairId { index: u32::MAX, generation: 0 };
}

/// Contents of a pair, touched only by the holder of the matching PairLock.
pub(crate) struct PairCells<V> {
    value: Mutex<Option<V>>,
    disk_data: Mutex<Option<Vec<u8>>>,
    cloned: Mutex<Option<V>>,
}

impl<V> PairCells<V> {
    pub(crate) fn new(value: Option<V>) -> Self {
        Self { value: Mutex::new(value), disk_data: Mutex::new(None), cloned: Mutex::new(None) }
    }

    pub(crate) fn value(&self) -> MutexGuard<'_, Option<V>> {
        relock(self.value.lock())
    }

    pub(crate) fn disk_data(&self) -> MutexGuard<'_, Option<Vec<u8>>> {
        relock(self.disk_data.lock())
    }

    pub(crate) fn cloned(&self) -> MutexGuard<'_, Option<V>> {
        relock(self.cloned.lock())
    }
}

pub(crate) struct Pair<V> {
    pub(crate) file: Arc<FileCtx>,
    pub(crate) key: CacheKey,
    pub(crate) fullhash: u32,
    pub(crate) cells: Arc<PairCells<V>>,
    pub(crate) write_cbs: Arc<dyn WriteCallbacks<V>>,

    pub(crate) attr: PairAttr,
    pub(crate) cloned_size: i64,
    pub(crate) dirty: Dirty,
    pub(crate) checkpoint_pending: bool,
    pub(crate) count: u8,
    /// Set by unpin_and_remove; lookups skip the pair from then on.
    pub(crate) removing: bool,

    pub(crate) value_lock: PairLock,
    pub(crate) disk_lock: PairLock,

    // links (owned by PairList)
    pub(crate) hash_next: Option<PairId>,
    pub(crate) clock_next: PairId,
    pub(crate) clock_prev: PairId,
    pub(crate) pending_next: Option<PairId>,
    pub(crate) pending_prev: Option<PairId>,
    pub(crate) cf_next: Option<PairId>,
    pub(crate) cf_prev: Option<PairId>,
}

impl<V> Pair<V> {
    pub(crate) fn new(
        file: Arc<FileCtx>,
        key: CacheKey,
        fullhash: u32,
        value: Option<V>,
        attr: PairAttr,
        dirty: Dirty,
        write_cbs: Arc<dyn WriteCallbacks<V>>,
    ) -> Self {
        Self {
            file,
            key,
            fullhash,
            cells: Arc::new(PairCells::new(value)),
            write_cbs,
            attr,
            cloned_size: 0,
            dirty,
            checkpoint_pending: false,
            count: CLOCK_INITIAL_COUNT,
            removing: false,
            value_lock: PairLock::new(),
            disk_lock: PairLock::new(),
            hash_next: None,
            clock_next: PairId::NIL,
            clock_prev: PairId::NIL,
            pending_next: None,
            pending_prev: None,
            cf_next: None,
            cf_prev: None,
        }
    }

    #[inline]
    pub(crate) fn filenum(&self) -> FileNum {
        self.file.filenum
    }

    /// Anybody holding or waiting on either lock.
    #[inline]
    pub(crate) fn is_busy(&self) -> bool {
        !self.value_lock.is_idle() || !self.disk_lock.is_idle()
    }
}

/// A pair pinned by the caller (its value lock is held).
///
/// Hand it back through `unpin` or `unpin_and_remove`; dropping it leaves
/// the pair locked forever.
#[must_use = "a pinned pair must be released with unpin or unpin_and_remove"]
pub struct PinnedPair<V> {
    pub(crate) id: PairId,
    pub(crate) filenum: FileNum,
    pub(crate) key: CacheKey,
    pub(crate) fullhash: u32,
    pub(crate) cells: Arc<PairCells<V>>,
}

impl<V> PinnedPair<V> {
    pub fn key(&self) -> CacheKey {
        self.key
    }

    pub fn fullhash(&self) -> u32 {
        self.fullhash
    }

    pub fn filenum(&self) -> FileNum {
        self.filenum
    }

    /// Access the pinned value.
    pub fn with_value<R>(&self, f: impl FnOnce(&mut V) -> R) -> R {
        let mut g = self.cells.value();
        match g.as_mut() {
            Some(v) => f(v),
            None => panic!("pinned pair {}:{} has no value", self.filenum, self.key),
        }
    }
}

impl<V> fmt::Debug for PinnedPair<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedPair")
            .field("filenum", &self.filenum)
            .field("key", &self.key)
            .field("fullhash", &self.fullhash)
            .finish()
    }
}

/// A dependent pair passed to the *_with_dep_pairs operations: already
/// pinned by the caller, with the dirty bit it should receive.
pub struct DepPair<'a, V> {
    pub pinned: &'a PinnedPair<V>,
    pub dirty: Dirty,
}
