//! Общие тестовые хелперы: уникальные корни, тестовый тип значения и
//! callbacks с записью событий, управляемые "ворота" для блокировки записи.
#![allow(dead_code)]

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use cachetable::{
    CacheKey, CacheTable, CacheTableBuilder, CheckpointLogger, CleanerOutcome, ClonedValue, FileCtx, FileHooks,
    Fetched, FlushArgs, Lsn, PairAttr, PairCallbacks, PairLoader, PartialEvictionCost, WriteCallbacks,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("cttest-{prefix}-{pid}-{t}-{id}"))
}

/// Cache over a fresh directory with both periodic threads paused.
pub fn test_cache(prefix: &str, limit: i64) -> Result<(PathBuf, CacheTable<Val>)> {
    test_cache_with_logger(prefix, limit, None)
}

pub fn test_cache_with_logger(
    prefix: &str,
    limit: i64,
    logger: Option<Arc<dyn CheckpointLogger>>,
) -> Result<(PathBuf, CacheTable<Val>)> {
    let root = unique_root(prefix);
    fs::create_dir_all(&root)?;
    let cfg = CacheTableBuilder::from_default()
        .size_limit(limit)
        .checkpoint_period_secs(0)
        .cleaner_period_secs(0)
        .env_dir(&root)
        .worker_threads(2)
        .checkpoint_threads(2)
        .build();
    let ct = CacheTable::create(&cfg, logger)?;
    Ok((root, ct))
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Val {
    pub key: CacheKey,
    pub version: u64,
    pub size: i64,
    pub pressure: i64,
    pub partial: bool,
}

impl Val {
    pub fn new(key: CacheKey, size: i64) -> Self {
        Self { key, version: 1, size, pressure: 0, partial: false }
    }

    pub fn attr(&self) -> PairAttr {
        PairAttr { size: self.size, leaf_size: self.size, cache_pressure_size: self.pressure, ..PairAttr::ZERO }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushEvent {
    pub key: CacheKey,
    pub version: u64,
    pub write_me: bool,
    pub keep_me: bool,
    pub for_checkpoint: bool,
    pub is_clone: bool,
}

/// Blocks callers of `pass` while closed.
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
    entered: AtomicUsize,
}

impl Gate {
    pub fn new(open: bool) -> Self {
        Self { open: Mutex::new(open), cv: Condvar::new(), entered: AtomicUsize::new(0) }
    }

    pub fn pass(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut g = self.open.lock().unwrap();
        while !*g {
            g = self.cv.wait(g).unwrap();
        }
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub fn close(&self) {
        *self.open.lock().unwrap() = false;
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

/// Callbacks over an in-memory "disk" (key -> last written version).
pub struct Mock {
    pub fetch_size: i64,
    pub clone: bool,
    pub pe: (i64, PartialEvictionCost),
    pub disk: Mutex<HashMap<CacheKey, u64>>,
    pub flushes: Mutex<Vec<FlushEvent>>,
    pub fetches: AtomicU64,
    pub partial_evictions: AtomicU64,
    pub partial_fetches: AtomicU64,
    pub cleaned: Mutex<Vec<CacheKey>>,
    pub completed: Mutex<Vec<CacheKey>>,
    /// Passed by every non-clone write.
    pub write_gate: Gate,
    /// Passed by every clone write.
    pub clone_gate: Gate,
    pub fetch_gate: Gate,
}

impl Mock {
    pub fn new(fetch_size: i64) -> Self {
        Self {
            fetch_size,
            clone: false,
            pe: (0, PartialEvictionCost::Cheap),
            disk: Mutex::new(HashMap::new()),
            flushes: Mutex::new(Vec::new()),
            fetches: AtomicU64::new(0),
            partial_evictions: AtomicU64::new(0),
            partial_fetches: AtomicU64::new(0),
            cleaned: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            write_gate: Gate::new(true),
            clone_gate: Gate::new(true),
            fetch_gate: Gate::new(true),
        }
    }

    pub fn with_clone(mut self) -> Self {
        self.clone = true;
        self
    }

    pub fn with_partial_eviction(mut self, bytes: i64, cost: PartialEvictionCost) -> Self {
        self.pe = (bytes, cost);
        self
    }

    pub fn callbacks(self: &Arc<Self>) -> PairCallbacks<Val> {
        PairCallbacks::new(Arc::clone(self))
    }

    pub fn write_cbs(self: &Arc<Self>) -> Arc<dyn WriteCallbacks<Val>> {
        Arc::clone(self) as Arc<dyn WriteCallbacks<Val>>
    }

    pub fn writes(&self) -> Vec<FlushEvent> {
        self.flushes.lock().unwrap().iter().filter(|e| e.write_me).cloned().collect()
    }

    pub fn writes_of(&self, key: CacheKey) -> Vec<FlushEvent> {
        self.writes().into_iter().filter(|e| e.key == key).collect()
    }

    pub fn on_disk(&self, key: CacheKey) -> Option<u64> {
        self.disk.lock().unwrap().get(&key).copied()
    }

    pub fn set_on_disk(&self, key: CacheKey, version: u64) {
        self.disk.lock().unwrap().insert(key, version);
    }
}

impl WriteCallbacks<Val> for Mock {
    fn flush(&self, args: FlushArgs<'_, Val>) -> Result<Option<PairAttr>> {
        self.flushes.lock().unwrap().push(FlushEvent {
            key: args.key,
            version: args.value.version,
            write_me: args.write_me,
            keep_me: args.keep_me,
            for_checkpoint: args.for_checkpoint,
            is_clone: args.is_clone,
        });
        if args.write_me {
            if args.is_clone {
                self.clone_gate.pass();
            } else {
                self.write_gate.pass();
            }
            self.disk.lock().unwrap().insert(args.key, args.value.version);
        }
        Ok(None)
    }

    fn pe_estimate(&self, _value: &Val, _attr: PairAttr) -> (i64, PartialEvictionCost) {
        self.pe
    }

    fn partial_evict(&self, value: &mut Val, attr: PairAttr) -> Result<PairAttr> {
        self.partial_evictions.fetch_add(1, Ordering::SeqCst);
        if self.pe.0 == 0 {
            return Ok(attr);
        }
        value.size = attr.size / 2;
        Ok(PairAttr { size: value.size, leaf_size: value.size, ..attr })
    }

    fn supports_clone(&self) -> bool {
        self.clone
    }

    fn clone_value(&self, value: &mut Val, _for_checkpoint: bool) -> Result<ClonedValue<Val>> {
        if !self.clone {
            bail!("clone not enabled");
        }
        Ok(ClonedValue { value: value.clone(), size: value.size, new_attr: None })
    }

    fn cleaner(&self, value: &mut Val, key: CacheKey, _fullhash: u32) -> Result<CleanerOutcome> {
        self.cleaned.lock().unwrap().push(key);
        value.pressure = 0;
        value.version += 1;
        Ok(CleanerOutcome { dirty: true, new_attr: Some(value.attr()) })
    }

    fn checkpoint_complete(&self, _value: &mut Val, key: CacheKey) {
        self.completed.lock().unwrap().push(key);
    }
}

impl PairLoader<Val> for Mock {
    fn fetch(&self, _file: &FileCtx, key: CacheKey, _fullhash: u32) -> Result<Fetched<Val>> {
        self.fetch_gate.pass();
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let version = self.on_disk(key).unwrap_or(0);
        let value = Val { key, version, size: self.fetch_size, pressure: 0, partial: false };
        let attr = value.attr();
        Ok(Fetched { value, disk_data: None, attr, dirty: false })
    }

    fn partial_fetch_required(&self, value: &Val) -> bool {
        value.partial
    }

    fn partial_fetch(
        &self,
        value: &mut Val,
        _disk_data: &mut Option<Vec<u8>>,
        _file: &FileCtx,
        attr: PairAttr,
    ) -> Result<PairAttr> {
        self.partial_fetches.fetch_add(1, Ordering::SeqCst);
        value.partial = false;
        Ok(attr)
    }
}

/// File hooks that record their calls in order.
#[derive(Default)]
pub struct RecordingHooks {
    pub events: Mutex<Vec<String>>,
}

impl RecordingHooks {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, s: String) {
        self.events.lock().unwrap().push(s);
    }
}

impl FileHooks for RecordingHooks {
    fn log_fassociate_during_checkpoint(&self, _file: &FileCtx) -> Result<()> {
        self.push("fassociate".into());
        Ok(())
    }
    fn log_suppress_rollback_during_checkpoint(&self, _file: &FileCtx) -> Result<()> {
        self.push("suppress_rollback".into());
        Ok(())
    }
    fn close(&self, _file: &FileCtx) -> Result<()> {
        self.push("close".into());
        Ok(())
    }
    fn begin_checkpoint(&self, lsn: Lsn, _file: &FileCtx) -> Result<()> {
        self.push(format!("begin:{lsn}"));
        Ok(())
    }
    fn checkpoint(&self, _file: &FileCtx) -> Result<()> {
        self.push("checkpoint".into());
        Ok(())
    }
    fn end_checkpoint(&self, _file: &FileCtx) -> Result<()> {
        self.push("end".into());
        Ok(())
    }
    fn note_pin_by_checkpoint(&self, _file: &FileCtx) -> Result<()> {
        self.push("pin".into());
        Ok(())
    }
    fn note_unpin_by_checkpoint(&self, _file: &FileCtx) -> Result<()> {
        self.push("unpin".into());
        Ok(())
    }
}

/// In-memory logger: LSNs from 100, records its calls.
pub struct RecordingLogger {
    next: AtomicU64,
    pub events: Mutex<Vec<String>>,
    pub noted: AtomicU64,
}

impl Default for RecordingLogger {
    fn default() -> Self {
        Self { next: AtomicU64::new(100), events: Mutex::new(Vec::new()), noted: AtomicU64::new(0) }
    }
}

impl RecordingLogger {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl CheckpointLogger for RecordingLogger {
    fn log_begin_checkpoint(&self) -> Result<Lsn> {
        let lsn = self.next.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(format!("begin:{lsn}"));
        Ok(lsn)
    }

    fn log_open_txns(&self, begin_lsn: Lsn) -> Result<u32> {
        self.events.lock().unwrap().push(format!("txns:{begin_lsn}"));
        Ok(2)
    }

    fn log_end_checkpoint(&self, begin_lsn: Lsn, n_files: u32, n_txns: u32) -> Result<()> {
        self.events.lock().unwrap().push(format!("end:{begin_lsn}:{n_files}:{n_txns}"));
        Ok(())
    }

    fn note_checkpoint(&self, lsn: Lsn) {
        self.noted.store(lsn, Ordering::SeqCst);
    }
}
