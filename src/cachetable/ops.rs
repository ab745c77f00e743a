//! Client surface: get_and_pin / put / unpin / unpin_and_remove / prefetch.
//!
//! Hit: touch the clock counter, wait for the value lock. Miss: wait for
//! write-back headroom, insert a CLEAN placeholder pinned under both locks,
//! fetch with the table lock released, account the size.
//!
//! Before a pinned pair is handed out its pending bit (and those of the
//! dependent pairs) is cleared under the pending read lock and the pair is
//! written for the checkpoint if it was pending and dirty.

use log::{debug, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use super::evictor::set_attr;
use super::files::CacheFile;
use super::pair::{
    CacheKey, DepPair, Dirty, Fetched, Pair, PairAttr, PairCallbacks, PairCells, PairId, PinnedPair,
    WriteCallbacks,
};
use super::{CacheTable, Guard, Inner, Shared};
use crate::consts::CLOCK_SATURATION;
use crate::sync::PairLock;
use crate::util::{fatal, micros_since};

/// Result of a put.
#[must_use]
pub enum PutOutcome<V> {
    Inserted(PinnedPair<V>),
    /// Another pair with the same (file, key) is live; the value comes back
    /// untouched.
    AlreadyPresent(V),
}

impl<V> PutOutcome<V> {
    pub fn is_inserted(&self) -> bool {
        matches!(self, PutOutcome::Inserted(_))
    }

    pub fn inserted(self) -> Option<PinnedPair<V>> {
        match self {
            PutOutcome::Inserted(p) => Some(p),
            PutOutcome::AlreadyPresent(_) => None,
        }
    }
}

/// Point-in-time view of one pair.
#[derive(Clone, Copy, Debug)]
pub struct PairInfo {
    pub attr: PairAttr,
    pub dirty: Dirty,
    pub checkpoint_pending: bool,
    pub clock_count: u8,
    pub pinned: bool,
    pub has_clone: bool,
    pub is_clock_head: bool,
    pub is_cleaner_head: bool,
}

impl<V: Send + 'static> Shared<V> {
    fn pinned(&self, g: &Inner<V>, id: PairId) -> PinnedPair<V> {
        let p = g.list.pair(id);
        PinnedPair { id, filenum: p.filenum(), key: p.key, fullhash: p.fullhash, cells: Arc::clone(&p.cells) }
    }

    fn insert_pair(&self, g: &mut Inner<V>, pair: Pair<V>) -> PairId {
        let attr = pair.attr;
        let id = g.list.insert(pair);
        g.ev.add_pair_attr(&attr);
        id
    }

    /// Store a fetched value into a placeholder (disk lock held by the
    /// fetching path) and release the disk lock.
    fn complete_fetch(&self, id: PairId, fetched: Fetched<V>, cells: &PairCells<V>) -> Guard<'_, V> {
        let Fetched { value, disk_data, attr, dirty } = fetched;
        *cells.value() = Some(value);
        *cells.disk_data() = disk_data;
        let mut g = self.lock();
        set_attr(&mut g, id, attr);
        let p = g.list.pair_mut(id);
        if dirty {
            p.dirty = Dirty::Dirty;
        }
        p.disk_lock.unlock();
        g
    }

    /// Apply dependent dirty bits, then write for checkpoint whatever of
    /// `id` and the dependents was pending. All value locks are held.
    fn settle_pinned<'a>(
        self: &'a Arc<Self>,
        mut g: Guard<'a, V>,
        id: Option<PairId>,
        deps: &[DepPair<'_, V>],
    ) -> Guard<'a, V> {
        let mut ids = Vec::with_capacity(deps.len() + 1);
        ids.extend(id);
        for d in deps {
            let did = d.pinned.id;
            assert!(g.list.is_live(did), "dependent pair {}:{} is gone", d.pinned.filenum, d.pinned.key);
            let p = g.list.pair_mut(did);
            assert!(p.value_lock.active_writers() > 0, "dependent pair {}:{} is not pinned", p.filenum(), p.key);
            if d.dirty.is_dirty() {
                p.dirty = Dirty::Dirty;
            }
            ids.push(did);
        }
        let (g2, was) = self.take_pending(g, &ids);
        g = g2;
        for (pid, was_pending) in ids.into_iter().zip(was) {
            g = self.checkpoint_locked_pair(g, pid, was_pending);
        }
        g
    }

    /// Run the loader's partial fetch if it asks for one. Value lock held.
    fn maybe_partial_fetch<'a>(&'a self, g: Guard<'a, V>, id: PairId, cbs: &PairCallbacks<V>) -> Guard<'a, V> {
        let (cells, file) = {
            let p = g.list.pair(id);
            (Arc::clone(&p.cells), Arc::clone(&p.file))
        };
        drop(g);
        let required = cells.value().as_ref().map(|v| cbs.load.partial_fetch_required(v)).unwrap_or(false);
        let g = self.lock();
        if !required {
            return g;
        }
        let g = self.lock_disk(g, id);
        let attr = g.list.pair(id).attr;
        drop(g);
        let new_attr = {
            let mut v = cells.value();
            let mut d = cells.disk_data();
            match v.as_mut() {
                Some(v) => cbs.load.partial_fetch(v, &mut d, &file, attr).unwrap_or_else(|e| fatal("partial fetch", e)),
                None => attr,
            }
        };
        let mut g = self.lock();
        set_attr(&mut g, id, new_attr);
        g.list.pair_mut(id).disk_lock.unlock();
        g
    }

    pub(crate) fn get_and_pin(
        self: &Arc<Self>,
        cf: &CacheFile,
        key: CacheKey,
        fullhash: u32,
        cbs: &PairCallbacks<V>,
        deps: &[DepPair<'_, V>],
    ) -> PinnedPair<V> {
        let filenum = cf.filenum();
        let mut g = self.lock();
        g.files.entry_for(cf);
        loop {
            if let Some(id) = g.list.find(filenum, key, fullhash) {
                {
                    let p = g.list.pair_mut(id);
                    if p.count < CLOCK_SATURATION {
                        p.count += 1;
                    }
                }
                g = self.lock_value(g, id);
                if g.list.pair(id).removing {
                    g.list.pair_mut(id).value_lock.unlock();
                    continue;
                }
                g = self.settle_pinned(g, Some(id), deps);
                g = self.maybe_partial_fetch(g, id, cbs);
                self.counters.record_hit();
                return self.pinned(&g, id);
            }

            g = self.wait_for_writable_headroom(g);
            if g.list.find(filenum, key, fullhash).is_some() {
                continue;
            }
            let ctx = Arc::clone(cf.ctx());
            let pair = Pair::new(Arc::clone(&ctx), key, fullhash, None, PairAttr::ZERO, Dirty::Clean, Arc::clone(&cbs.write));
            let cells = Arc::clone(&pair.cells);
            let id = self.insert_pair(&mut g, pair);
            g = self.lock_value(g, id);
            g = self.lock_disk(g, id);
            drop(g);

            let t0 = Instant::now();
            let fetched = cbs.load.fetch(&ctx, key, fullhash).unwrap_or_else(|e| fatal("fetch", e));
            g = self.complete_fetch(id, fetched, &cells);
            self.counters.record_miss(micros_since(t0));

            g = self.settle_pinned(g, Some(id), deps);
            g = self.maybe_flush_some(g, 0);
            return self.pinned(&g, id);
        }
    }

    /// Non-blocking pin of a present, unlocked, not-pending pair.
    pub(crate) fn maybe_get_and_pin(&self, cf: &CacheFile, key: CacheKey, fullhash: u32, need_dirty: bool) -> Option<PinnedPair<V>> {
        let mut g = self.lock();
        g.files.entry_for(cf);
        let id = g.list.find(cf.filenum(), key, fullhash)?;
        {
            let p = g.list.pair_mut(id);
            if p.removing || !p.value_lock.is_idle() || p.checkpoint_pending {
                return None;
            }
            if need_dirty && !p.dirty.is_dirty() {
                return None;
            }
            if p.count < CLOCK_SATURATION {
                p.count += 1;
            }
        }
        g = self.lock_value(g, id);
        Some(self.pinned(&g, id))
    }

    pub(crate) fn put_with_dep_pairs<K>(
        self: &Arc<Self>,
        cf: &CacheFile,
        get_key: K,
        value: V,
        attr: PairAttr,
        write: &Arc<dyn WriteCallbacks<V>>,
        deps: &[DepPair<'_, V>],
    ) -> PutOutcome<V>
    where
        K: FnOnce() -> (CacheKey, u32),
    {
        let mut g = self.lock();
        g.files.entry_for(cf);
        g = self.wait_for_writable_headroom(g);
        g = self.maybe_flush_some(g, attr.size);

        // key choice and insertion happen under one hold of the table lock
        self.checkpoint_prohibited.fetch_add(1, Ordering::SeqCst);
        let (key, fullhash) = get_key();
        if g.list.find(cf.filenum(), key, fullhash).is_some() {
            self.checkpoint_prohibited.fetch_sub(1, Ordering::SeqCst);
            debug!("put {}:{}: already present", cf.filenum(), key);
            return PutOutcome::AlreadyPresent(value);
        }
        let pair = Pair::new(Arc::clone(cf.ctx()), key, fullhash, Some(value), attr, Dirty::Dirty, Arc::clone(write));
        let id = self.insert_pair(&mut g, pair);
        g = self.lock_value(g, id);
        self.checkpoint_prohibited.fetch_sub(1, Ordering::SeqCst);
        self.counters.record_put();

        g = self.settle_pinned(g, None, deps);
        PutOutcome::Inserted(self.pinned(&g, id))
    }

    pub(crate) fn unpin(self: &Arc<Self>, pinned: PinnedPair<V>, dirty: Dirty, new_attr: Option<PairAttr>) {
        let id = pinned.id;
        let mut g = self.lock();
        assert!(g.list.is_live(id), "unpin of a freed pair {}:{}", pinned.filenum, pinned.key);
        if let Some(a) = new_attr {
            set_attr(&mut g, id, a);
        }
        {
            let p = g.list.pair_mut(id);
            assert!(p.value_lock.active_writers() > 0, "unpin of pair {}:{} that is not pinned", p.filenum(), p.key);
            if dirty.is_dirty() {
                p.dirty = Dirty::Dirty;
            }
            p.value_lock.unlock();
        }
        drop(self.maybe_flush_some(g, 0));
    }

    pub(crate) fn unpin_and_remove(self: &Arc<Self>, pinned: PinnedPair<V>, remove_key: Option<&mut dyn FnMut(CacheKey, bool)>) {
        let id = pinned.id;
        let mut g = self.lock();
        assert!(g.list.is_live(id), "remove of a freed pair {}:{}", pinned.filenum, pinned.key);
        g.list.pair_mut(id).dirty = Dirty::Clean;
        // a clone write in flight holds the disk lock
        g = self.lock_disk(g, id);

        g = self.pending_read_lock(g);
        let for_checkpoint = std::mem::replace(&mut g.list.pair_mut(id).checkpoint_pending, false);
        let attr = g.list.pair(id).attr;
        set_attr(&mut g, id, PairAttr { cache_pressure_size: 0, ..attr });
        if let Some(cb) = remove_key {
            drop(g);
            cb(pinned.key, for_checkpoint);
            g = self.lock();
        }
        g.pending_lock.read_unlock();

        g.list.pair_mut(id).removing = true;
        self.unlink_pair(&mut g, id);
        {
            let p = g.list.pair_mut(id);
            p.disk_lock.unlock();
            p.value_lock.unlock();
        }
        // waiters wake, see `removing` and back off
        g = PairLock::wait_for_users(g, move |i: &mut Inner<V>| &mut i.list.pair_mut(id).value_lock);
        g = PairLock::wait_for_users(g, move |i: &mut Inner<V>| &mut i.list.pair_mut(id).disk_lock);
        drop(self.free_pair(g, id));
    }

    /// Start a background fetch (or partial fetch) of `key`. Returns whether
    /// background work was started.
    pub(crate) fn prefetch(self: &Arc<Self>, cf: &CacheFile, key: CacheKey, fullhash: u32, cbs: &PairCallbacks<V>) -> bool {
        let mut g = self.lock();
        g.files.entry_for(cf);
        let ctx = Arc::clone(cf.ctx());

        if let Some(id) = g.list.find(cf.filenum(), key, fullhash) {
            if g.list.pair(id).is_busy() || g.list.pair(id).removing {
                return false;
            }
            g = self.lock_value(g, id);
            let cells = Arc::clone(&g.list.pair(id).cells);
            drop(g);
            let required = cells.value().as_ref().map(|v| cbs.load.partial_fetch_required(v)).unwrap_or(false);
            g = self.lock();
            if !required || !ctx.bjm.try_add() {
                g.list.pair_mut(id).value_lock.unlock();
                return false;
            }
            g = self.lock_disk(g, id);
            drop(g);
            let me = Arc::clone(self);
            let load = Arc::clone(&cbs.load);
            let task = move || {
                let g = me.lock();
                let attr = g.list.pair(id).attr;
                let file = Arc::clone(&g.list.pair(id).file);
                drop(g);
                let new_attr = {
                    let mut v = cells.value();
                    let mut d = cells.disk_data();
                    match v.as_mut() {
                        Some(v) => load.partial_fetch(v, &mut d, &file, attr).unwrap_or_else(|e| fatal("prefetch partial fetch", e)),
                        None => attr,
                    }
                };
                let mut g = me.lock();
                set_attr(&mut g, id, new_attr);
                let p = g.list.pair_mut(id);
                p.disk_lock.unlock();
                p.value_lock.unlock();
                drop(g);
                file.bjm.remove();
            };
            if let Err(task) = self.workers.submit(task) {
                task();
            }
            self.counters.record_prefetch();
            return true;
        }

        if !ctx.bjm.try_add() {
            warn!("prefetch of {}:{} abandoned: {} is being flushed", cf.filenum(), key, cf.path().display());
            return false;
        }
        let pair = Pair::new(Arc::clone(&ctx), key, fullhash, None, PairAttr::ZERO, Dirty::Clean, Arc::clone(&cbs.write));
        let cells = Arc::clone(&pair.cells);
        let id = self.insert_pair(&mut g, pair);
        g = self.lock_value(g, id);
        g = self.lock_disk(g, id);
        drop(g);

        let me = Arc::clone(self);
        let load = Arc::clone(&cbs.load);
        let task = move || {
            let fetched = load.fetch(&ctx, key, fullhash).unwrap_or_else(|e| fatal("prefetch", e));
            let g = me.complete_fetch(id, fetched, &cells);
            let mut g = me.settle_pinned(g, Some(id), &[]);
            g.list.pair_mut(id).value_lock.unlock();
            drop(me.maybe_flush_some(g, 0));
            ctx.bjm.remove();
        };
        if let Err(task) = self.workers.submit(task) {
            task();
        }
        self.counters.record_prefetch();
        true
    }

    fn pair_info(&self, cf: &CacheFile, key: CacheKey) -> Option<PairInfo> {
        let g = self.lock();
        let id = g.list.find(cf.filenum(), key, cf.fullhash(key))?;
        let p = g.list.pair(id);
        Some(PairInfo {
            attr: p.attr,
            dirty: p.dirty,
            checkpoint_pending: p.checkpoint_pending,
            clock_count: p.count,
            pinned: p.value_lock.active_writers() > 0,
            has_clone: p.cloned_size > 0 || p.cells.cloned().is_some(),
            is_clock_head: g.list.clock_head() == Some(id),
            is_cleaner_head: g.list.cleaner_head() == Some(id),
        })
    }
}

impl<V: Send + 'static> CacheTable<V> {
    /// Pin `key`, fetching it on a miss. Blocks while another caller holds
    /// the pair.
    pub fn get_and_pin(&self, file: &CacheFile, key: CacheKey, fullhash: u32, cbs: &PairCallbacks<V>) -> PinnedPair<V> {
        self.shared.get_and_pin(file, key, fullhash, cbs, &[])
    }

    /// As `get_and_pin`; each dependent pair (pinned by the caller) gets its
    /// dirty bit and is written for the checkpoint if it was pending.
    pub fn get_and_pin_with_dep_pairs(
        &self,
        file: &CacheFile,
        key: CacheKey,
        fullhash: u32,
        cbs: &PairCallbacks<V>,
        deps: &[DepPair<'_, V>],
    ) -> PinnedPair<V> {
        self.shared.get_and_pin(file, key, fullhash, cbs, deps)
    }

    /// Pin only if present, unlocked, dirty and not pending a checkpoint.
    pub fn maybe_get_and_pin(&self, file: &CacheFile, key: CacheKey, fullhash: u32) -> Option<PinnedPair<V>> {
        self.shared.maybe_get_and_pin(file, key, fullhash, true)
    }

    pub fn maybe_get_and_pin_clean(&self, file: &CacheFile, key: CacheKey, fullhash: u32) -> Option<PinnedPair<V>> {
        self.shared.maybe_get_and_pin(file, key, fullhash, false)
    }

    /// Insert a new dirty pair, returned pinned.
    pub fn put(
        &self,
        file: &CacheFile,
        key: CacheKey,
        fullhash: u32,
        value: V,
        attr: PairAttr,
        write: &Arc<dyn WriteCallbacks<V>>,
    ) -> PutOutcome<V> {
        self.shared.put_with_dep_pairs(file, || (key, fullhash), value, attr, write, &[])
    }

    /// Put whose key is chosen by `get_key` under the table lock.
    pub fn put_with_dep_pairs<K>(
        &self,
        file: &CacheFile,
        get_key: K,
        value: V,
        attr: PairAttr,
        write: &Arc<dyn WriteCallbacks<V>>,
        deps: &[DepPair<'_, V>],
    ) -> PutOutcome<V>
    where
        K: FnOnce() -> (CacheKey, u32),
    {
        self.shared.put_with_dep_pairs(file, get_key, value, attr, write, deps)
    }

    pub fn unpin(&self, pinned: PinnedPair<V>, dirty: Dirty, new_attr: Option<PairAttr>) {
        self.shared.unpin(pinned, dirty, new_attr)
    }

    /// Drop a pinned pair from the cache without writing it.
    /// `remove_key(key, for_checkpoint)` runs before the pair is unlinked.
    pub fn unpin_and_remove(&self, pinned: PinnedPair<V>, remove_key: Option<&mut dyn FnMut(CacheKey, bool)>) {
        self.shared.unpin_and_remove(pinned, remove_key)
    }

    pub fn prefetch(&self, file: &CacheFile, key: CacheKey, fullhash: u32, cbs: &PairCallbacks<V>) -> bool {
        self.shared.prefetch(file, key, fullhash, cbs)
    }

    /// Reserve `fraction` of the unreserved capacity; counted as resident
    /// until released.
    pub fn reserve_memory(&self, fraction: f64) -> u64 {
        self.shared.reserve_memory(fraction)
    }

    pub fn release_reserved_memory(&self, bytes: u64) {
        self.shared.release_reserved_memory(bytes)
    }

    pub fn pair_info(&self, file: &CacheFile, key: CacheKey) -> Option<PairInfo> {
        self.shared.pair_info(file, key)
    }

    /// Evict until `incoming` more bytes would fit.
    pub fn maybe_flush_some(&self, incoming: i64) {
        self.shared.maybe_flush_some_now(incoming)
    }
}
