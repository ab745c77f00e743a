//! cachetable: кэш страниц для дискового B-дерева.
//!
//! Один table lock (Mutex<Inner>) охраняет все метаданные: арену пар, хэш,
//! clock ring, pending list, учёт размеров, состояние чекпоинта и реестр
//! файлов. Он отпускается вокруг любого I/O и любого вызова пользовательских
//! callback'ов; эксклюзивный доступ к содержимому пары на это время держат
//! её PairLock'и (value / disk).
//!
//! Модули:
//! - pair: типы пары, callback-трейты, PinnedPair.
//! - list: арена + хэш + clock ring + pending list + списки по файлам.
//! - evictor: учёт размеров, clock sweep, частичная эвикция, flow control.
//! - checkpoint: begin/end, pending-бит, clone-путь.
//! - ops: get_and_pin / put / unpin / prefetch и т.п.
//! - files: реестр файлов, open/close/flush, хуки.
//! - cleaner: проход cleaner'а по cache pressure.

mod checkpoint;
mod cleaner;
mod evictor;
pub mod files;
mod list;
mod ops;
pub mod pair;

use anyhow::Result;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

pub use checkpoint::FileCheckpointState;
pub use files::{CacheFile, FileCtx, FileHooks, FileUniqueId};
pub use ops::{PairInfo, PutOutcome};
pub use pair::{
    CacheKey, CleanerOutcome, ClonedValue, DepPair, Dirty, Fetched, FileNum, FlushArgs, Lsn,
    PairAttr, PairCallbacks, PairId, PairLoader, PartialEvictionCost, PinnedPair, WriteCallbacks,
};

use checkpoint::CheckpointState;
use evictor::SizeStats;
use files::FileRegistry;
use list::PairList;

use crate::config::CacheTableConfig;
use crate::cron::Minicron;
use crate::metrics::{CacheCounters, StatusSnapshot};
use crate::pool::WorkerPool;
use crate::sync::{JobBarrier, PairLock, ReaderWriterLock};
use crate::util::relock;
use crate::wal::CheckpointLogger;

/// Everything guarded by the table lock.
pub(crate) struct Inner<V> {
    pub(crate) list: PairList<V>,
    pub(crate) ev: SizeStats,
    pub(crate) pending_lock: ReaderWriterLock,
    pub(crate) cp: CheckpointState,
    pub(crate) files: FileRegistry,
    pub(crate) env_dir: PathBuf,
}

pub(crate) type Guard<'a, V> = MutexGuard<'a, Inner<V>>;

pub(crate) struct Shared<V> {
    pub(crate) inner: Mutex<Inner<V>>,
    /// Flow-control waiters (too much queued for write-back).
    pub(crate) flow_control: Condvar,
    /// Assertion-only: >0 while `put` picks and inserts a key. The section
    /// never releases the table lock, so `begin_checkpoint` (which checks it
    /// under that lock) can only see it raised on a reentrant call from the
    /// key callback.
    pub(crate) checkpoint_prohibited: AtomicI32,
    /// Background clone writes of the checkpoint in progress.
    pub(crate) clones_bjm: JobBarrier,
    pub(crate) workers: WorkerPool,
    pub(crate) checkpoint_workers: WorkerPool,
    pub(crate) counters: CacheCounters,
    pub(crate) logger: Option<Arc<dyn CheckpointLogger>>,
    /// Serializes begin/end pairs of the periodic checkpointer against
    /// file open/close.
    pub(crate) checkpoint_serial: Mutex<()>,
    /// True from begin to end of any checkpoint, manual or periodic.
    pub(crate) checkpoint_running: Mutex<bool>,
    pub(crate) checkpoint_done: Condvar,
    pub(crate) cleaner_iterations: AtomicU32,
}

impl<V: Send + 'static> Shared<V> {
    #[inline]
    pub(crate) fn lock(&self) -> Guard<'_, V> {
        relock(self.inner.lock())
    }

    /// Acquire a pair's value lock (may wait with the table lock released).
    pub(crate) fn lock_value<'a>(&self, g: Guard<'a, V>, id: PairId) -> Guard<'a, V> {
        PairLock::lock(g, move |i: &mut Inner<V>| &mut i.list.pair_mut(id).value_lock)
    }

    pub(crate) fn lock_disk<'a>(&self, g: Guard<'a, V>, id: PairId) -> Guard<'a, V> {
        PairLock::lock(g, move |i: &mut Inner<V>| &mut i.list.pair_mut(id).disk_lock)
    }

    pub(crate) fn pending_read_lock<'a>(&self, g: Guard<'a, V>) -> Guard<'a, V> {
        ReaderWriterLock::read_lock(g, |i: &mut Inner<V>| &mut i.pending_lock)
    }

    pub(crate) fn pending_write_lock<'a>(&self, g: Guard<'a, V>) -> Guard<'a, V> {
        ReaderWriterLock::write_lock(g, |i: &mut Inner<V>| &mut i.pending_lock)
    }

    fn status(&self) -> StatusSnapshot {
        let mut s = StatusSnapshot::default();
        self.counters.fill(&mut s);
        let g = self.lock();
        g.ev.fill(&mut s);
        s.n_in_table = g.list.n_in_table();
        s.table_size = g.list.table_size();
        s.pending_pairs = g.list.pending_ids().len();
        s
    }
}

/// The page cache. `V` is the in-memory value type of the pairs.
pub struct CacheTable<V: Send + 'static> {
    shared: Arc<Shared<V>>,
    checkpointer: Minicron,
    cleaner: Minicron,
    closed: bool,
}

impl<V: Send + 'static> CacheTable<V> {
    /// Create a cache and start its worker pools and periodic threads.
    pub fn create(cfg: &CacheTableConfig, logger: Option<Arc<dyn CheckpointLogger>>) -> Result<Self> {
        let workers = WorkerPool::new("ct-worker", cfg.worker_threads)?;
        let checkpoint_workers = WorkerPool::new("ct-checkpoint", cfg.checkpoint_threads)?;
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                list: PairList::new(),
                ev: SizeStats::new(cfg.size_limit),
                pending_lock: ReaderWriterLock::new(),
                cp: CheckpointState::default(),
                files: FileRegistry::new(),
                env_dir: cfg.env_dir.clone(),
            }),
            flow_control: Condvar::new(),
            checkpoint_prohibited: AtomicI32::new(0),
            clones_bjm: JobBarrier::new(),
            workers,
            checkpoint_workers,
            counters: CacheCounters::new(),
            logger,
            checkpoint_serial: Mutex::new(()),
            checkpoint_running: Mutex::new(false),
            checkpoint_done: Condvar::new(),
            cleaner_iterations: AtomicU32::new(cfg.cleaner_iterations),
        });

        let weak = Arc::downgrade(&shared);
        let checkpointer = Minicron::start("ct-checkpointer", cfg.checkpoint_period_secs, move || {
            match weak.upgrade() {
                Some(s) => s.checkpoint(),
                None => Ok(()),
            }
        })?;
        let weak = Arc::downgrade(&shared);
        let cleaner = Minicron::start("ct-cleaner", cfg.cleaner_period_secs, move || {
            match weak.upgrade() {
                Some(s) => s.run_cleaner(),
                None => Ok(()),
            }
        })?;

        info!(
            "cachetable created: limit={} bytes, workers={}, checkpoint_workers={}, checkpoint_period={}s, cleaner_period={}s",
            cfg.size_limit,
            cfg.worker_threads,
            cfg.checkpoint_threads,
            cfg.checkpoint_period_secs,
            cfg.cleaner_period_secs
        );
        Ok(Self { shared, checkpointer, cleaner, closed: false })
    }

    // ---------------- tunables ----------------

    pub fn checkpoint_period(&self) -> u64 {
        self.checkpointer.period_secs()
    }

    pub fn set_checkpoint_period(&self, secs: u64) {
        self.checkpointer.change_period(secs);
    }

    pub fn cleaner_period(&self) -> u64 {
        self.cleaner.period_secs()
    }

    pub fn set_cleaner_period(&self, secs: u64) {
        self.cleaner.change_period(secs);
    }

    pub fn cleaner_iterations(&self) -> u32 {
        self.shared.cleaner_iterations.load(Ordering::Relaxed)
    }

    pub fn set_cleaner_iterations(&self, n: u32) {
        self.shared.cleaner_iterations.store(n, Ordering::Relaxed);
    }

    pub fn size_limit(&self) -> i64 {
        self.shared.lock().ev.size_limit
    }

    pub fn set_size_limit(&self, bytes: i64) {
        let mut g = self.shared.lock();
        g.ev.set_limit(bytes);
        drop(g);
        self.shared.maybe_flush_some_now(0);
    }

    pub fn env_dir(&self) -> PathBuf {
        self.shared.lock().env_dir.clone()
    }

    pub fn set_env_dir<P: Into<PathBuf>>(&self, dir: P) {
        self.shared.lock().env_dir = dir.into();
    }

    // ---------------- status / verification ----------------

    pub fn status(&self) -> StatusSnapshot {
        self.shared.status()
    }

    pub fn counters(&self) -> &CacheCounters {
        &self.shared.counters
    }

    /// Full structural consistency check; panics with a diagnostic on failure.
    pub fn verify(&self) {
        let g = self.shared.lock();
        g.list.verify();
        let mut sum = PairAttr::ZERO;
        for id in g.list.ids() {
            let a = g.list.pair(id).attr;
            sum.size += a.size;
            sum.nonleaf_size += a.nonleaf_size;
            sum.leaf_size += a.leaf_size;
            sum.rollback_size += a.rollback_size;
            sum.cache_pressure_size += a.cache_pressure_size;
        }
        g.ev.verify_against(&sum);
    }

    /// Number of pinned pairs, optionally restricted to one file.
    pub fn count_pinned(&self, file: Option<&CacheFile>) -> usize {
        let g = self.shared.lock();
        g.list
            .ids()
            .into_iter()
            .filter(|&id| {
                let p = g.list.pair(id);
                file.map(|f| f.filenum() == p.filenum()).unwrap_or(true)
                    && p.value_lock.active_writers() > 0
            })
            .count()
    }

    pub fn assert_all_unpinned(&self) {
        let n = self.count_pinned(None);
        assert_eq!(n, 0, "{} pairs are still pinned", n);
    }

    // ---------------- shutdown ----------------

    /// Stop periodic threads, close every open file and stop the pools.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.checkpointer.shutdown();
        self.cleaner.shutdown();

        let mut first_err = None;
        for cf in self.shared.open_files() {
            if let Err(e) = self.shared.close_file(&cf) {
                warn!("cachetable close: closing {} failed: {:#}", cf.path().display(), e);
                first_err.get_or_insert(e);
            }
        }
        self.shared.workers.shutdown();
        self.shared.checkpoint_workers.shutdown();
        info!("cachetable closed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<V: Send + 'static> Drop for CacheTable<V> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("cachetable drop: {:#}", e);
        }
    }
}
