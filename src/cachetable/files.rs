//! Cache file registry.
//!
//! Один вход на файл по его идентичности на диске (dev/ino на Unix), а не по
//! пути: повторный open того же файла переиспользует вход и закрывает
//! дескриптор вызывающего. Номера файлов: линейный поиск свободного.
//!
//! close: дождаться фоновых задач файла (bjm.drain), записать и выгнать все
//! его пары, close-хук, убрать из реестра, fsync, опционально unlink.

use anyhow::{Context, Result};
use log::{debug, info};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::checkpoint::FileCheckpointState;
use super::pair::{CacheKey, FileNum, Lsn};
use super::{CacheTable, Shared};
use crate::hash::fullhash;
use crate::sync::JobBarrier;
use crate::util::relock;

/// What callbacks see of an open cache file.
#[derive(Debug)]
pub struct FileCtx {
    pub(crate) filenum: FileNum,
    pub(crate) path: PathBuf,
    pub(crate) file: File,
    /// Background jobs (evictions, prefetches, cleaner runs) touching this file.
    pub(crate) bjm: JobBarrier,
}

impl FileCtx {
    pub fn filenum(&self) -> FileNum {
        self.filenum
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    #[cfg(test)]
    pub(crate) fn scratch(filenum: FileNum) -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let path = std::env::temp_dir().join(format!(
            "ct-scratch-{}-{}-{}",
            std::process::id(),
            filenum.0,
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("open scratch {}", path.display()))?;
        let _ = std::fs::remove_file(&path);
        Ok(Self { filenum, path, file, bjm: JobBarrier::new() })
    }
}

/// Identity of a file on the storage device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileUniqueId {
    dev: u64,
    ino: u64,
}

impl FileUniqueId {
    pub fn of(file: &File, path: &Path) -> Result<Self> {
        let (dev, ino) = identity_of(file, path)?;
        Ok(Self { dev, ino })
    }
}

#[cfg(unix)]
fn identity_of(file: &File, path: &Path) -> Result<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    let md = file.metadata().with_context(|| format!("metadata {}", path.display()))?;
    Ok((md.dev(), md.ino()))
}

/// Без dev/ino: стабильный хэш канонического пути.
#[cfg(not(unix))]
fn identity_of(_file: &File, path: &Path) -> Result<(u64, u64)> {
    use std::hash::Hasher;
    let canon = path
        .canonicalize()
        .with_context(|| format!("canonicalize {}", path.display()))?;
    let mut h = twox_hash::XxHash64::with_seed(0xF11E_1D00_C0FF_EE01);
    h.write(canon.to_string_lossy().as_bytes());
    Ok((0, h.finish()))
}

/// Per-file notifications. Every method defaults to a no-op.
///
/// Errors from the checkpoint-time hooks (except `note_unpin_by_checkpoint`)
/// are fatal; `close` errors are returned from `close_file`.
pub trait FileHooks: Send + Sync {
    fn log_fassociate_during_checkpoint(&self, _file: &FileCtx) -> Result<()> {
        Ok(())
    }
    fn log_suppress_rollback_during_checkpoint(&self, _file: &FileCtx) -> Result<()> {
        Ok(())
    }
    fn close(&self, _file: &FileCtx) -> Result<()> {
        Ok(())
    }
    fn begin_checkpoint(&self, _lsn: Lsn, _file: &FileCtx) -> Result<()> {
        Ok(())
    }
    fn checkpoint(&self, _file: &FileCtx) -> Result<()> {
        Ok(())
    }
    fn end_checkpoint(&self, _file: &FileCtx) -> Result<()> {
        Ok(())
    }
    fn note_pin_by_checkpoint(&self, _file: &FileCtx) -> Result<()> {
        Ok(())
    }
    fn note_unpin_by_checkpoint(&self, _file: &FileCtx) -> Result<()> {
        Ok(())
    }
}

struct NoHooks;
impl FileHooks for NoHooks {}

/// Handle of an open cache file. Cheap to clone; using it after the file
/// was closed is a contract violation.
#[derive(Clone)]
pub struct CacheFile {
    ctx: Arc<FileCtx>,
    serial: u64,
}

impl CacheFile {
    pub fn filenum(&self) -> FileNum {
        self.ctx.filenum
    }

    pub fn path(&self) -> &Path {
        &self.ctx.path
    }

    pub fn ctx(&self) -> &Arc<FileCtx> {
        &self.ctx
    }

    /// Hash to pass to the pair operations for `key` in this file.
    pub fn fullhash(&self, key: CacheKey) -> u32 {
        fullhash(self.ctx.filenum, key)
    }
}

impl fmt::Debug for CacheFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheFile")
            .field("filenum", &self.ctx.filenum)
            .field("path", &self.ctx.path)
            .finish()
    }
}

pub(crate) struct FileEntry {
    pub(crate) ctx: Arc<FileCtx>,
    pub(crate) unique_id: FileUniqueId,
    pub(crate) serial: u64,
    pub(crate) hooks: Arc<dyn FileHooks>,
    pub(crate) hooks_set: bool,
    pub(crate) for_checkpoint: bool,
    pub(crate) checkpoint_state: FileCheckpointState,
    pub(crate) finished_early_lsn: Option<Lsn>,
    pub(crate) unlink_on_close: bool,
    pub(crate) closing: bool,
}

pub(crate) struct FileRegistry {
    entries: BTreeMap<FileNum, FileEntry>,
    next_filenum: u32,
    next_serial: u64,
}

impl FileRegistry {
    pub(crate) fn new() -> Self {
        Self { entries: BTreeMap::new(), next_filenum: 0, next_serial: 1 }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, f: FileNum) -> Option<&FileEntry> {
        self.entries.get(&f)
    }

    pub(crate) fn get_mut(&mut self, f: FileNum) -> Option<&mut FileEntry> {
        self.entries.get_mut(&f)
    }

    /// Entry behind a handle; a stale handle panics.
    pub(crate) fn entry_for(&mut self, cf: &CacheFile) -> &mut FileEntry {
        match self.entries.get_mut(&cf.ctx.filenum) {
            Some(e) if e.serial == cf.serial => e,
            _ => panic!("cachefile {} ({}) is not open", cf.ctx.filenum, cf.ctx.path.display()),
        }
    }

    fn find_by_id(&self, id: &FileUniqueId) -> Option<FileNum> {
        self.entries.values().find(|e| e.unique_id == *id).map(|e| e.ctx.filenum)
    }

    /// First unused number at or after the last one handed out.
    fn reserve_filenum(&mut self) -> FileNum {
        let mut n = self.next_filenum;
        while self.entries.contains_key(&FileNum(n)) || n == u32::MAX {
            n = n.wrapping_add(1);
        }
        self.next_filenum = n.wrapping_add(1);
        FileNum(n)
    }

    fn insert(&mut self, ctx: Arc<FileCtx>, unique_id: FileUniqueId) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        let entry = FileEntry {
            ctx: Arc::clone(&ctx),
            unique_id,
            serial,
            hooks: Arc::new(NoHooks),
            hooks_set: false,
            for_checkpoint: false,
            checkpoint_state: FileCheckpointState::NotInProgress,
            finished_early_lsn: None,
            unlink_on_close: false,
            closing: false,
        };
        self.entries.insert(ctx.filenum, entry);
        serial
    }

    /// Make every open file a checkpoint participant.
    pub(crate) fn mark_all_for_checkpoint(&mut self) -> Vec<FileNum> {
        let mut out = Vec::with_capacity(self.entries.len());
        for (f, e) in self.entries.iter_mut() {
            if e.closing {
                continue;
            }
            assert!(!e.for_checkpoint, "cachefile {} already in a checkpoint", f);
            e.for_checkpoint = true;
            out.push(*f);
        }
        out
    }

    pub(crate) fn handles(&self) -> Vec<CacheFile> {
        self.entries
            .values()
            .filter(|e| !e.closing)
            .map(|e| CacheFile { ctx: Arc::clone(&e.ctx), serial: e.serial })
            .collect()
    }
}

impl<V: Send + 'static> Shared<V> {
    /// Register an already open descriptor, or reuse the live entry for the
    /// same file (the new descriptor is then closed).
    pub(crate) fn open_or_reuse(&self, file: File, path: &Path) -> Result<CacheFile> {
        let id = FileUniqueId::of(&file, path)?;
        let mut g = self.lock();
        if let Some(fnum) = g.files.find_by_id(&id) {
            let handle = match g.files.get(fnum) {
                Some(e) => {
                    assert!(!e.closing, "open of {} while it is being closed", path.display());
                    CacheFile { ctx: Arc::clone(&e.ctx), serial: e.serial }
                }
                None => unreachable!(),
            };
            drop(g);
            drop(file);
            debug!("cachefile {} reused for {}", fnum, path.display());
            return Ok(handle);
        }
        let filenum = g.files.reserve_filenum();
        let ctx = Arc::new(FileCtx { filenum, path: path.to_path_buf(), file, bjm: JobBarrier::new() });
        let serial = g.files.insert(Arc::clone(&ctx), id);
        drop(g);
        info!("cachefile {} opened: {}", filenum, path.display());
        Ok(CacheFile { ctx, serial })
    }

    /// Open (creating if needed) a file named relative to env_dir.
    pub(crate) fn open_path(&self, name: &Path) -> Result<CacheFile> {
        let path = if name.is_absolute() {
            name.to_path_buf()
        } else {
            self.lock().env_dir.join(name)
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("open cachefile {}", path.display()))?;
        self.open_or_reuse(file, &path)
    }

    pub(crate) fn set_hooks(&self, cf: &CacheFile, hooks: Arc<dyn FileHooks>) {
        let mut g = self.lock();
        let e = g.files.entry_for(cf);
        assert!(!e.hooks_set, "hooks of cachefile {} registered twice", cf.filenum());
        e.hooks = hooks;
        e.hooks_set = true;
    }

    pub(crate) fn open_files(&self) -> Vec<CacheFile> {
        self.lock().files.handles()
    }

    /// Write back and evict every pair of the file. With `closing` the
    /// file's barrier stays drained; otherwise it accepts jobs again.
    pub(crate) fn flush_file_pairs(self: &Arc<Self>, ctx: &Arc<FileCtx>, closing: bool) {
        ctx.bjm.drain();
        let writes = Arc::new(JobBarrier::new());
        let ids = self.lock().list.file_ids(ctx.filenum);
        for id in ids {
            let mut g = self.lock();
            if !g.list.is_live(id) || g.list.pair(id).removing {
                continue;
            }
            g = self.lock_value(g, id);
            if g.list.pair(id).removing {
                g.list.pair_mut(id).value_lock.unlock();
                continue;
            }
            let (size, dirty) = {
                let p = g.list.pair(id);
                (p.attr.size, p.dirty.is_dirty())
            };
            g.ev.size_evicting += size;
            if dirty && writes.try_add() {
                let me = Arc::clone(self);
                let w = Arc::clone(&writes);
                let task = move || {
                    let g = me.lock();
                    drop(me.evict_locked_pair(g, id, size));
                    w.remove();
                };
                match self.workers.submit(task) {
                    Ok(()) => continue,
                    Err(task) => {
                        drop(task);
                        writes.remove();
                    }
                }
            }
            drop(self.evict_locked_pair(g, id, size));
        }
        writes.drain();
        if !closing {
            ctx.bjm.reset();
        }
    }

    pub(crate) fn flush_file(self: &Arc<Self>, cf: &CacheFile) {
        let ctx = {
            let mut g = self.lock();
            Arc::clone(&g.files.entry_for(cf).ctx)
        };
        self.flush_file_pairs(&ctx, false);
        debug!("cachefile {} flushed", ctx.filenum);
    }

    pub(crate) fn close_file(self: &Arc<Self>, cf: &CacheFile) -> Result<()> {
        let _serial = relock(self.checkpoint_serial.lock());
        let (ctx, hooks) = {
            let mut g = self.lock();
            let e = g.files.entry_for(cf);
            assert!(
                !e.for_checkpoint,
                "closing cachefile {} while it participates in a checkpoint",
                cf.filenum()
            );
            assert!(!e.closing, "cachefile {} closed twice", cf.filenum());
            e.closing = true;
            (Arc::clone(&e.ctx), Arc::clone(&e.hooks))
        };

        self.flush_file_pairs(&ctx, true);
        let hook_res = hooks
            .close(&ctx)
            .with_context(|| format!("close hook of {}", ctx.path.display()));

        let unlink = {
            let mut g = self.lock();
            assert!(
                !g.list.has_pairs_of(ctx.filenum),
                "cachefile {} closed while some of its pairs are in use",
                ctx.filenum
            );
            g.files.entries.remove(&ctx.filenum).map(|e| e.unlink_on_close).unwrap_or(false)
        };
        ctx.file
            .sync_all()
            .with_context(|| format!("fsync {}", ctx.path.display()))?;
        if unlink {
            std::fs::remove_file(&ctx.path).with_context(|| format!("unlink {}", ctx.path.display()))?;
        }
        info!("cachefile {} closed: {}{}", ctx.filenum, ctx.path.display(), if unlink { " (unlinked)" } else { "" });
        hook_res
    }
}

impl<V: Send + 'static> CacheTable<V> {
    /// Register an open descriptor. A second open of the same file returns
    /// the existing handle and closes `file`.
    pub fn open_or_reuse(&self, file: File, path: &Path) -> Result<CacheFile> {
        self.shared.open_or_reuse(file, path)
    }

    /// Open (creating it if needed) `name`, relative to the env dir.
    pub fn open_path<P: AsRef<Path>>(&self, name: P) -> Result<CacheFile> {
        self.shared.open_path(name.as_ref())
    }

    /// Flush and evict every pair of the file, run its close hook, fsync,
    /// and unlink it if requested.
    pub fn close_file(&self, file: &CacheFile) -> Result<()> {
        self.shared.close_file(file)
    }

    /// Write back and drop the file's pairs; the file stays open.
    pub fn flush_file(&self, file: &CacheFile) {
        self.shared.flush_file(file)
    }

    /// Register the file's hooks. Allowed once per open.
    pub fn set_file_hooks(&self, file: &CacheFile, hooks: Arc<dyn FileHooks>) {
        self.shared.set_hooks(file, hooks)
    }

    pub fn set_unlink_on_close(&self, file: &CacheFile, unlink: bool) {
        self.shared.lock().files.entry_for(file).unlink_on_close = unlink;
    }

    /// The file already completed the checkpoint `lsn` on its own; its
    /// checkpoint and end hooks are skipped for that LSN.
    pub fn set_checkpoint_finished_early(&self, file: &CacheFile, lsn: Lsn) {
        self.shared.lock().files.entry_for(file).finished_early_lsn = Some(lsn);
    }

    pub fn file_checkpoint_state(&self, file: &CacheFile) -> FileCheckpointState {
        self.shared.lock().files.entry_for(file).checkpoint_state
    }

    pub fn open_files(&self) -> Vec<CacheFile> {
        self.shared.open_files()
    }

    pub fn n_open_files(&self) -> usize {
        self.shared.lock().files.len()
    }
}
