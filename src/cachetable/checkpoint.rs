//! Checkpoint coordinator.
//!
//! begin:
//!   1. snapshot open files as participants (note_pin_by_checkpoint);
//!   2. logger: begin record → LSN, fassociate per file, live txns,
//!      suppress-rollback per file (в этом порядке);
//!   3. под pending write lock пометить pending каждую пару участника,
//!      которая dirty или value-locked, и положить её в pending list;
//!   4. begin_checkpoint хук каждого файла.
//! end:
//!   1. разобрать pending list: каждую пару записать (clone → фон, иначе
//!      синхронно под value lock);
//!   2. дождаться clone-записей (clones_bjm.drain);
//!   3. checkpoint хук файлов (кроме finished early для этого LSN);
//!   4. тестовый хук; 5. end record (fsync) + note_checkpoint;
//!   6. end_checkpoint хук; 7. снять членство, note_unpin_by_checkpoint.
//!
//! Любой фоновый писатель держит pending lock в READ на время записи, поэтому
//! "увидел dirty → записал → пометил clean" не может перемешаться со сканом
//! begin'а.

use anyhow::{Context, Result};
use log::info;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::evictor::set_attr;
use super::files::{FileCtx, FileHooks};
use super::pair::{ClonedValue, Dirty, FileNum, FlushArgs, Lsn, PairId};
use super::{Guard, Shared};
use crate::consts::ZERO_LSN;
use crate::util::{fatal, relock};

/// Per-file participation in the checkpoint in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileCheckpointState {
    NotInProgress,
    CalledBegin,
    CalledCheckpoint,
}

#[derive(Debug)]
pub(crate) struct CheckpointState {
    pub(crate) lsn_in_progress: Lsn,
    pub(crate) last_lsn: Lsn,
    pub(crate) files: Vec<FileNum>,
    pub(crate) n_files: u32,
    pub(crate) n_txns: u32,
    pub(crate) is_beginning: bool,
    pub(crate) in_progress: bool,
}

impl Default for CheckpointState {
    fn default() -> Self {
        Self {
            lsn_in_progress: ZERO_LSN,
            last_lsn: ZERO_LSN,
            files: Vec::new(),
            n_files: 0,
            n_txns: 0,
            is_beginning: false,
            in_progress: false,
        }
    }
}

type Participant = (Arc<FileCtx>, Arc<dyn FileHooks>);

impl<V: Send + 'static> Shared<V> {
    pub(crate) fn checkpoint(self: &Arc<Self>) -> Result<()> {
        let _serial = relock(self.checkpoint_serial.lock());
        self.claim_checkpoint();
        self.begin_checkpoint();
        let res = self.end_checkpoint(None);
        self.release_checkpoint();
        res
    }

    /// Wait until no checkpoint runs, then mark one as running.
    pub(crate) fn claim_checkpoint(&self) {
        let mut running = relock(self.checkpoint_running.lock());
        while *running {
            running = relock(self.checkpoint_done.wait(running));
        }
        *running = true;
    }

    pub(crate) fn release_checkpoint(&self) {
        *relock(self.checkpoint_running.lock()) = false;
        self.checkpoint_done.notify_all();
    }

    fn participants(&self, g: &Guard<'_, V>) -> Vec<Participant> {
        g.cp.files
            .iter()
            .filter_map(|f| g.files.get(*f))
            .map(|e| (Arc::clone(&e.ctx), Arc::clone(&e.hooks)))
            .collect()
    }

    pub(crate) fn begin_checkpoint(self: &Arc<Self>) {
        let mut g = self.lock();
        assert!(!g.cp.in_progress, "begin_checkpoint while another checkpoint is in progress");
        assert_eq!(
            self.checkpoint_prohibited.load(Ordering::SeqCst),
            0,
            "begin_checkpoint inside a checkpoint-prohibited section"
        );
        assert!(g.list.pending_head().is_none(), "pending list not empty at begin_checkpoint");
        g.cp.in_progress = true;
        g.cp.is_beginning = true;
        self.clones_bjm.reset();
        self.counters.record_checkpoint_begin();

        // 1. participants
        let members = g.files.mark_all_for_checkpoint();
        g.cp.n_files = members.len() as u32;
        g.cp.files = members;
        let parts = self.participants(&g);
        let fallback_lsn = g.cp.last_lsn + 1;
        drop(g);
        for (ctx, hooks) in &parts {
            if let Err(e) = hooks.note_pin_by_checkpoint(ctx) {
                fatal("note_pin_by_checkpoint", e);
            }
        }

        // 2. log records, strictly ordered
        let (lsn, n_txns) = match &self.logger {
            Some(logger) => {
                let lsn = logger.log_begin_checkpoint().unwrap_or_else(|e| fatal("log begin_checkpoint", e));
                for (ctx, hooks) in &parts {
                    if let Err(e) = hooks.log_fassociate_during_checkpoint(ctx) {
                        fatal("log fassociate", e);
                    }
                }
                let n_txns = logger.log_open_txns(lsn).unwrap_or_else(|e| fatal("log open txns", e));
                for (ctx, hooks) in &parts {
                    if let Err(e) = hooks.log_suppress_rollback_during_checkpoint(ctx) {
                        fatal("log suppress rollback", e);
                    }
                }
                (lsn, n_txns)
            }
            None => (fallback_lsn, 0),
        };

        // 3. pending scan
        let mut g = self.lock();
        g.cp.lsn_in_progress = lsn;
        g.cp.n_txns = n_txns;
        g = self.pending_write_lock(g);
        let members: HashSet<FileNum> = g.cp.files.iter().copied().collect();
        let mut n_pending = 0usize;
        for id in g.list.ids() {
            let mark = {
                let p = g.list.pair_mut(id);
                assert!(!p.checkpoint_pending, "pair {}:{} already pending at begin", p.filenum(), p.key);
                let mark = members.contains(&p.filenum())
                    && (p.dirty.is_dirty() || p.value_lock.active_writers() > 0);
                p.checkpoint_pending = mark;
                mark
            };
            if mark {
                g.list.pending_push_front(id);
                n_pending += 1;
            }
        }
        g.pending_lock.write_unlock();
        drop(g);

        // 4. per-file begin hooks (may create new dirty pairs)
        for (ctx, hooks) in &parts {
            if let Err(e) = hooks.begin_checkpoint(lsn, ctx) {
                fatal("file begin_checkpoint", e);
            }
        }
        let mut g = self.lock();
        for (ctx, _) in &parts {
            if let Some(e) = g.files.get_mut(ctx.filenum) {
                e.checkpoint_state = FileCheckpointState::CalledBegin;
            }
        }
        g.cp.is_beginning = false;
        info!(
            "checkpoint begin: lsn={}, files={}, txns={}, pending={}",
            lsn,
            parts.len(),
            n_txns,
            n_pending
        );
    }

    /// Second half of a checkpoint. `between` runs after the file
    /// checkpoint hooks and before the end record is logged.
    pub(crate) fn end_checkpoint(self: &Arc<Self>, between: Option<&mut dyn FnMut()>) -> Result<()> {
        let mut g = self.lock();
        assert!(g.cp.in_progress && !g.cp.is_beginning, "end_checkpoint without begin_checkpoint");

        // 1. drain the pending list
        let mut n_written = 0usize;
        while let Some(id) = g.list.pending_head() {
            g.list.pending_remove(id);
            g = self.lock_value(g, id);
            if g.list.pair(id).removing {
                g.list.pair_mut(id).value_lock.unlock();
                continue;
            }
            let (g2, was) = self.take_pending(g, &[id]);
            g = g2;
            if was[0] && g.list.pair(id).dirty.is_dirty() {
                n_written += 1;
            }
            g = self.checkpoint_locked_pair(g, id, was[0]);
            g.list.pair_mut(id).value_lock.unlock();
        }
        let lsn = g.cp.lsn_in_progress;
        let (n_files, n_txns) = (g.cp.n_files, g.cp.n_txns);
        drop(g);

        // 2. background clone writes
        self.clones_bjm.drain();

        // 3. file checkpoint hooks
        let g = self.lock();
        let parts: Vec<(Arc<FileCtx>, Arc<dyn FileHooks>, bool)> = g
            .cp
            .files
            .iter()
            .filter_map(|f| g.files.get(*f))
            .map(|e| (Arc::clone(&e.ctx), Arc::clone(&e.hooks), e.finished_early_lsn == Some(lsn)))
            .collect();
        drop(g);
        for (ctx, hooks, early) in &parts {
            if *early {
                continue;
            }
            if let Err(e) = hooks.checkpoint(ctx) {
                fatal("file checkpoint", e);
            }
            let mut g = self.lock();
            if let Some(e) = g.files.get_mut(ctx.filenum) {
                e.checkpoint_state = FileCheckpointState::CalledCheckpoint;
            }
        }

        // 4.
        if let Some(f) = between {
            f();
        }

        // 5. end record
        if let Some(logger) = &self.logger {
            if let Err(e) = logger.log_end_checkpoint(lsn, n_files, n_txns) {
                fatal("log end_checkpoint", e);
            }
            logger.note_checkpoint(lsn);
        }

        // 6. end hooks
        for (ctx, hooks, early) in &parts {
            if *early {
                continue;
            }
            if let Err(e) = hooks.end_checkpoint(ctx) {
                fatal("file end_checkpoint", e);
            }
        }

        // 7. membership
        let mut g = self.lock();
        let members = std::mem::take(&mut g.cp.files);
        for f in &members {
            if let Some(e) = g.files.get_mut(*f) {
                e.for_checkpoint = false;
                e.checkpoint_state = FileCheckpointState::NotInProgress;
            }
        }
        g.cp.last_lsn = lsn;
        g.cp.in_progress = false;
        drop(g);

        self.counters.record_checkpoint_end();
        info!("checkpoint end: lsn={}, files={}, pairs written={}", lsn, parts.len(), n_written);

        for (ctx, hooks, _) in &parts {
            hooks
                .note_unpin_by_checkpoint(ctx)
                .with_context(|| format!("note_unpin_by_checkpoint for {}", ctx.path.display()))?;
        }
        Ok(())
    }

    /// Snapshot-and-clear the pending bits of value-locked pairs under the
    /// pending read lock.
    pub(crate) fn take_pending<'a>(&'a self, g: Guard<'a, V>, ids: &[PairId]) -> (Guard<'a, V>, Vec<bool>) {
        let mut g = self.pending_read_lock(g);
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            out.push(std::mem::replace(&mut g.list.pair_mut(id).checkpoint_pending, false));
        }
        g.pending_lock.read_unlock();
        (g, out)
    }

    /// Value lock held. If the pair was pending and is dirty, write it for
    /// the checkpoint: clone + background write when supported, otherwise a
    /// synchronous write that keeps the value lock across the I/O.
    pub(crate) fn checkpoint_locked_pair<'a>(
        self: &'a Arc<Self>,
        mut g: Guard<'a, V>,
        id: PairId,
        was_pending: bool,
    ) -> Guard<'a, V> {
        if !was_pending || !g.list.pair(id).dirty.is_dirty() {
            return g;
        }
        let (cbs, cells, key) = {
            let p = g.list.pair(id);
            (Arc::clone(&p.write_cbs), Arc::clone(&p.cells), p.key)
        };
        if cbs.supports_clone() {
            g = self.lock_disk(g, id);
            g = self.clone_pair(g, id);
            if self.clones_bjm.try_add() {
                let me = Arc::clone(self);
                let task = move || {
                    let g = me.lock();
                    drop(me.write_cloned_pair(g, id));
                    me.clones_bjm.remove();
                };
                if let Err(task) = self.checkpoint_workers.submit(task) {
                    drop(task);
                    self.clones_bjm.remove();
                    g = self.write_cloned_pair(g, id);
                }
            } else {
                g = self.write_cloned_pair(g, id);
            }
        } else {
            g = self.write_locked_pair(g, id, true);
        }
        drop(g);
        if let Some(v) = cells.value().as_mut() {
            cbs.checkpoint_complete(v, key);
        }
        self.lock()
    }

    /// Value and disk locks held. Snapshot the value; the live pair is clean
    /// from here on.
    fn clone_pair<'a>(&'a self, g: Guard<'a, V>, id: PairId) -> Guard<'a, V> {
        let (cells, cbs, key, filenum) = {
            let p = g.list.pair(id);
            (Arc::clone(&p.cells), Arc::clone(&p.write_cbs), p.key, p.filenum())
        };
        drop(g);
        let ClonedValue { value, size, new_attr } = match cells.value().as_mut() {
            Some(v) => cbs.clone_value(v, true).unwrap_or_else(|e| fatal("clone", e)),
            None => panic!("clone of pair {}:{} without a value", filenum, key),
        };
        *cells.cloned() = Some(value);

        let mut g = self.lock();
        {
            let p = g.list.pair_mut(id);
            p.dirty = Dirty::Clean;
            p.cloned_size = size;
        }
        if let Some(a) = new_attr {
            set_attr(&mut g, id, a);
        }
        g.ev.size_cloned_data += size;
        g
    }

    /// Disk lock held (value lock not needed). Write the clone and release
    /// the disk lock.
    fn write_cloned_pair<'a>(&'a self, g: Guard<'a, V>, id: PairId) -> Guard<'a, V> {
        let (cells, cbs, file, key, attr) = {
            let p = g.list.pair(id);
            (Arc::clone(&p.cells), Arc::clone(&p.write_cbs), Arc::clone(&p.file), p.key, p.attr)
        };
        drop(g);
        {
            let mut c = cells.cloned();
            if let Some(mut clone) = c.take() {
                let mut d = cells.disk_data();
                let args = FlushArgs {
                    file: &file,
                    key,
                    value: &mut clone,
                    disk_data: &mut *d,
                    old_attr: attr,
                    write_me: true,
                    keep_me: false,
                    for_checkpoint: true,
                    is_clone: true,
                };
                if let Err(e) = cbs.flush(args) {
                    fatal("checkpoint clone write", e);
                }
            }
        }
        let mut g = self.lock();
        let size = std::mem::replace(&mut g.list.pair_mut(id).cloned_size, 0);
        g.ev.size_cloned_data -= size;
        g.list.pair_mut(id).disk_lock.unlock();
        self.counters.record_checkpoint_write(true);
        g
    }
}

impl<V: Send + 'static> super::CacheTable<V> {
    /// Full checkpoint, serialized against the periodic checkpointer and
    /// file close.
    pub fn checkpoint(&self) -> Result<()> {
        self.shared.checkpoint()
    }

    /// First half of a checkpoint. Waits for a running checkpoint (e.g. the
    /// periodic one) to end; the periodic checkpointer in turn waits for the
    /// matching `end_checkpoint`. Begin/end stay strictly paired.
    pub fn begin_checkpoint(&self) {
        self.shared.claim_checkpoint();
        self.shared.begin_checkpoint()
    }

    pub fn end_checkpoint(&self) -> Result<()> {
        let res = self.shared.end_checkpoint(None);
        self.shared.release_checkpoint();
        res
    }

    /// `end_checkpoint` with `between` run after the files' checkpoint hooks
    /// and before the end record.
    pub fn end_checkpoint_with(&self, between: &mut dyn FnMut()) -> Result<()> {
        let res = self.shared.end_checkpoint(Some(between));
        self.shared.release_checkpoint();
        res
    }

    /// LSN of the checkpoint in progress.
    pub fn checkpoint_lsn_in_progress(&self) -> Option<Lsn> {
        let g = self.shared.lock();
        if g.cp.in_progress {
            Some(g.cp.lsn_in_progress)
        } else {
            None
        }
    }

    pub fn last_checkpoint_lsn(&self) -> Lsn {
        self.shared.lock().cp.last_lsn
    }
}
