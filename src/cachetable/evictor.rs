//! Evictor: учёт размеров, clock sweep, частичная эвикция и flow control.
//!
//! maybe_flush_some крутит clock от головы, пока
//! `current + incoming > limit + evicting`:
//! - занятая пара (кто-то держит или ждёт любой из двух локов) пропускается;
//! - пара с count > 0 получает декремент и шанс на частичную эвикцию
//!   (cheap inline, expensive с ненулевой оценкой в фоне);
//! - пара с count == 0 эвиктится: чистая и без disk-писателя на текущем
//!   потоке, иначе фоновой задачей под job barrier'ом файла.
//! Маркер "stuck": первая пара без прогресса с момента последнего действия;
//! если вернулись к ней, все пары заняты, кэш временно превышает лимит.
//!
//! Flow control: клиент ждёт, пока 2·evicting > current; будим, когда
//! 8·evicting ≤ current.

use log::debug;
use std::sync::Arc;

use super::pair::{Dirty, FlushArgs, PairAttr, PairId, PartialEvictionCost};
use super::{Guard, Inner, Shared};
use crate::metrics::StatusSnapshot;
use crate::util::{fatal, relock};

/// Running byte totals. Mutated only under the table lock.
#[derive(Debug, Clone, Default)]
pub(crate) struct SizeStats {
    pub(crate) size_current: i64,
    pub(crate) size_limit: i64,
    pub(crate) size_reserved: i64,
    pub(crate) size_evicting: i64,
    pub(crate) size_max: i64,
    pub(crate) size_nonleaf: i64,
    pub(crate) size_leaf: i64,
    pub(crate) size_rollback: i64,
    pub(crate) size_cachepressure: i64,
    pub(crate) size_cloned_data: i64,
    /// Part of size_current handed out by reserve_memory.
    pub(crate) granted: i64,
}

impl SizeStats {
    pub(crate) fn new(limit: i64) -> Self {
        Self { size_limit: limit, size_reserved: limit / 4, ..Self::default() }
    }

    pub(crate) fn set_limit(&mut self, limit: i64) {
        self.size_limit = limit;
        self.size_reserved = limit / 4 + self.granted;
    }

    pub(crate) fn add_pair_attr(&mut self, a: &PairAttr) {
        self.size_current += a.size;
        self.size_nonleaf += a.nonleaf_size;
        self.size_leaf += a.leaf_size;
        self.size_rollback += a.rollback_size;
        self.size_cachepressure += a.cache_pressure_size;
        self.size_max = self.size_max.max(self.size_current);
    }

    pub(crate) fn remove_pair_attr(&mut self, a: &PairAttr) {
        self.size_current -= a.size;
        self.size_nonleaf -= a.nonleaf_size;
        self.size_leaf -= a.leaf_size;
        self.size_rollback -= a.rollback_size;
        self.size_cachepressure -= a.cache_pressure_size;
        assert!(self.size_current >= 0, "size_current went negative: {}", self.size_current);
    }

    pub(crate) fn change_pair_attr(&mut self, old: &PairAttr, new: &PairAttr) {
        self.add_pair_attr(new);
        self.remove_pair_attr(old);
    }

    #[inline]
    pub(crate) fn needs_eviction(&self, incoming: i64) -> bool {
        self.size_current + incoming > self.size_limit + self.size_evicting
    }

    #[inline]
    pub(crate) fn should_client_wait(&self) -> bool {
        2 * self.size_evicting > self.size_current
    }

    #[inline]
    pub(crate) fn should_wake_clients(&self) -> bool {
        8 * self.size_evicting <= self.size_current
    }

    pub(crate) fn fill(&self, s: &mut StatusSnapshot) {
        s.size_current = self.size_current;
        s.size_limit = self.size_limit;
        s.size_max = self.size_max;
        s.size_evicting = self.size_evicting;
        s.size_reserved = self.size_reserved;
        s.size_nonleaf = self.size_nonleaf;
        s.size_leaf = self.size_leaf;
        s.size_rollback = self.size_rollback;
        s.size_cachepressure = self.size_cachepressure;
        s.size_cloned_data = self.size_cloned_data;
    }

    /// Running totals must equal the sum over live pairs (plus grants).
    pub(crate) fn verify_against(&self, sum: &PairAttr) {
        assert_eq!(self.size_current - self.granted, sum.size, "size_current drift");
        assert_eq!(self.size_nonleaf, sum.nonleaf_size, "size_nonleaf drift");
        assert_eq!(self.size_leaf, sum.leaf_size, "size_leaf drift");
        assert_eq!(self.size_rollback, sum.rollback_size, "size_rollback drift");
        assert_eq!(self.size_cachepressure, sum.cache_pressure_size, "size_cachepressure drift");
        assert!(self.size_evicting >= 0 && self.size_cloned_data >= 0);
    }
}

/// Replace a pair's attr and keep the totals in step.
pub(crate) fn set_attr<V>(inner: &mut Inner<V>, id: PairId, new: PairAttr) {
    let old = std::mem::replace(&mut inner.list.pair_mut(id).attr, new);
    inner.ev.change_pair_attr(&old, &new);
}

impl<V: Send + 'static> Shared<V> {
    /// Evict until `incoming` bytes fit, or every pair turns out busy.
    pub(crate) fn maybe_flush_some<'a>(self: &'a Arc<Self>, mut g: Guard<'a, V>, incoming: i64) -> Guard<'a, V> {
        let mut stuck = None;
        while g.ev.needs_eviction(incoming) {
            let head = match g.list.clock_head() {
                Some(h) => h,
                None => break,
            };
            let (marker, busy) = {
                let p = g.list.pair(head);
                ((p.filenum(), p.key), p.is_busy())
            };
            match stuck {
                None => stuck = Some(marker),
                Some(m) if m == marker => {
                    debug!(
                        "eviction sweep: no evictable pair (current={}, limit={}, evicting={}, pairs={})",
                        g.ev.size_current,
                        g.ev.size_limit,
                        g.ev.size_evicting,
                        g.list.n_in_table()
                    );
                    break;
                }
                Some(_) => {}
            }
            if busy {
                g.list.advance_clock_head();
                continue;
            }
            let (g2, acted) = self.try_evict_pair(g, head);
            g = g2;
            if acted {
                stuck = None;
            }
            if g.list.clock_head() == Some(head) {
                g.list.advance_clock_head();
            }
        }
        g.list.maybe_shrink();
        g
    }

    pub(crate) fn maybe_flush_some_now(self: &Arc<Self>, incoming: i64) {
        let g = self.lock();
        drop(self.maybe_flush_some(g, incoming));
    }

    /// Act on an idle pair: age it (maybe partial-evict) or evict it.
    /// Returns whether anything was initiated.
    fn try_evict_pair<'a>(self: &'a Arc<Self>, mut g: Guard<'a, V>, id: PairId) -> (Guard<'a, V>, bool) {
        if g.list.pair(id).is_busy() {
            return (g, false);
        }
        g = self.lock_value(g, id);

        if g.list.pair(id).count > 0 {
            g.list.pair_mut(id).count -= 1;
            return (self.run_partial_eviction(g, id), true);
        }

        let (size, inline, file) = {
            let p = g.list.pair(id);
            (p.attr.size, !p.dirty.is_dirty() && p.disk_lock.active_writers() == 0, Arc::clone(&p.file))
        };
        g.ev.size_evicting += size;

        if inline || !file.bjm.try_add() {
            g = self.evict_locked_pair(g, id, size);
            return (g, true);
        }
        let me = Arc::clone(self);
        let f2 = Arc::clone(&file);
        let task = move || {
            let g = me.lock();
            drop(me.evict_locked_pair(g, id, size));
            f2.bjm.remove();
        };
        if let Err(task) = self.workers.submit(task) {
            drop(task);
            file.bjm.remove();
            g = self.evict_locked_pair(g, id, size);
        }
        (g, true)
    }

    /// Clock count was > 0: ask the estimator whether trimming is worth it.
    fn run_partial_eviction<'a>(self: &'a Arc<Self>, g: Guard<'a, V>, id: PairId) -> Guard<'a, V> {
        let (cells, cbs, attr, file) = {
            let p = g.list.pair(id);
            (Arc::clone(&p.cells), Arc::clone(&p.write_cbs), p.attr, Arc::clone(&p.file))
        };
        drop(g);
        let (bytes, cost) = match cells.value().as_ref() {
            Some(v) => cbs.pe_estimate(v, attr),
            None => (0, PartialEvictionCost::Cheap),
        };
        let mut g = self.lock();
        match cost {
            PartialEvictionCost::Cheap => self.do_partial_eviction(g, id, 0),
            PartialEvictionCost::Expensive if bytes > 0 => {
                g.ev.size_evicting += bytes;
                if !file.bjm.try_add() {
                    return self.do_partial_eviction(g, id, bytes);
                }
                let me = Arc::clone(self);
                let f2 = Arc::clone(&file);
                let task = move || {
                    let g = me.lock();
                    drop(me.do_partial_eviction(g, id, bytes));
                    f2.bjm.remove();
                };
                if let Err(task) = self.workers.submit(task) {
                    drop(task);
                    file.bjm.remove();
                    g = self.do_partial_eviction(g, id, bytes);
                }
                g
            }
            PartialEvictionCost::Expensive => {
                g.list.pair_mut(id).value_lock.unlock();
                g
            }
        }
    }

    /// Value lock held. Runs the partial-eviction callback and releases the
    /// lock; `estimate` is what was added to size_evicting for it.
    fn do_partial_eviction<'a>(&'a self, g: Guard<'a, V>, id: PairId, estimate: i64) -> Guard<'a, V> {
        let (cells, cbs, old_attr) = {
            let p = g.list.pair(id);
            (Arc::clone(&p.cells), Arc::clone(&p.write_cbs), p.attr)
        };
        drop(g);
        let new_attr = match cells.value().as_mut() {
            Some(v) => match cbs.partial_evict(v, old_attr) {
                Ok(a) => a,
                Err(e) => fatal("partial eviction", e),
            },
            None => old_attr,
        };
        let mut g = self.lock();
        set_attr(&mut g, id, new_attr);
        if estimate > 0 {
            self.finish_evicting(&mut g, estimate);
        }
        g.list.pair_mut(id).value_lock.unlock();
        self.counters.record_partial_eviction(estimate > 0);
        g
    }

    /// Value lock held by the caller. Writes the pair if dirty (under the
    /// pending read lock), releases the value lock and frees the pair if
    /// nobody else showed up meanwhile.
    pub(crate) fn evict_locked_pair<'a>(&'a self, g: Guard<'a, V>, id: PairId, evicting: i64) -> Guard<'a, V> {
        let mut g = self.pending_read_lock(g);
        let for_checkpoint = std::mem::replace(&mut g.list.pair_mut(id).checkpoint_pending, false);
        g = self.write_locked_pair(g, id, for_checkpoint);
        g.pending_lock.read_unlock();

        g.list.pair_mut(id).value_lock.unlock();
        let idle = {
            let p = g.list.pair(id);
            p.value_lock.is_idle() && p.disk_lock.is_idle()
        };
        if idle {
            self.unlink_pair(&mut g, id);
            g = self.free_pair(g, id);
            self.counters.record_eviction();
        }
        self.finish_evicting(&mut g, evicting);
        g
    }

    /// Value lock held. Takes the disk lock (waits out a clone write), writes
    /// the pair if dirty and marks it clean.
    pub(crate) fn write_locked_pair<'a>(&'a self, g: Guard<'a, V>, id: PairId, for_checkpoint: bool) -> Guard<'a, V> {
        let mut g = self.lock_disk(g, id);
        let (dirty, cells, cbs, file, key, old_attr) = {
            let p = g.list.pair(id);
            debug_assert_eq!(p.cloned_size, 0);
            (
                p.dirty.is_dirty(),
                Arc::clone(&p.cells),
                Arc::clone(&p.write_cbs),
                Arc::clone(&p.file),
                p.key,
                p.attr,
            )
        };
        if dirty {
            drop(g);
            let new_attr = {
                let mut v = cells.value();
                let mut d = cells.disk_data();
                let value = match v.as_mut() {
                    Some(v) => v,
                    None => panic!("dirty pair {}:{} has no value", file.filenum, key),
                };
                let args = FlushArgs {
                    file: &file,
                    key,
                    value,
                    disk_data: &mut *d,
                    old_attr,
                    write_me: true,
                    keep_me: true,
                    for_checkpoint,
                    is_clone: false,
                };
                match cbs.flush(args) {
                    Ok(a) => a,
                    Err(e) => fatal("flush", e),
                }
            };
            g = self.lock();
            if let Some(a) = new_attr {
                set_attr(&mut g, id, a);
            }
            if for_checkpoint {
                self.counters.record_checkpoint_write(false);
            }
        }
        let p = g.list.pair_mut(id);
        p.dirty = Dirty::Clean;
        p.disk_lock.unlock();
        g
    }

    /// Take a pair out of every structure and the size totals.
    pub(crate) fn unlink_pair(&self, inner: &mut Inner<V>, id: PairId) {
        let attr = inner.list.pair(id).attr;
        inner.list.remove(id);
        inner.ev.remove_pair_attr(&attr);
    }

    /// Release an unlinked pair's slot and let the callbacks drop its memory
    /// (flush with write=false, keep=false) outside the table lock.
    pub(crate) fn free_pair<'a>(&'a self, mut g: Guard<'a, V>, id: PairId) -> Guard<'a, V> {
        let pair = g.list.free(id);
        drop(g);
        {
            let mut v = pair.cells.value();
            if let Some(value) = v.as_mut() {
                let mut d = pair.cells.disk_data();
                let args = FlushArgs {
                    file: &pair.file,
                    key: pair.key,
                    value,
                    disk_data: &mut *d,
                    old_attr: pair.attr,
                    write_me: false,
                    keep_me: false,
                    for_checkpoint: false,
                    is_clone: false,
                };
                if let Err(e) = pair.write_cbs.flush(args) {
                    fatal("free pair", e);
                }
            }
            *v = None;
        }
        drop(pair);
        self.lock()
    }

    pub(crate) fn finish_evicting(&self, inner: &mut Inner<V>, bytes: i64) {
        inner.ev.size_evicting -= bytes;
        assert!(inner.ev.size_evicting >= 0, "size_evicting went negative");
        if inner.ev.should_wake_clients() {
            self.flow_control.notify_all();
        }
    }

    /// Block while more than half of the resident bytes are queued for
    /// write-back.
    pub(crate) fn wait_for_writable_headroom<'a>(&'a self, mut g: Guard<'a, V>) -> Guard<'a, V> {
        while g.ev.should_client_wait() {
            self.counters.record_flow_control_wait();
            g = relock(self.flow_control.wait(g));
        }
        g
    }

    pub(crate) fn reserve_memory(self: &Arc<Self>, fraction: f64) -> u64 {
        let g = self.lock();
        let mut g = self.wait_for_writable_headroom(g);
        let reservable = (g.ev.size_limit - g.ev.size_reserved).max(0);
        let reserved = ((fraction.clamp(0.0, 1.0)) * reservable as f64) as i64;
        g.ev.size_reserved += reserved;
        g = self.maybe_flush_some(g, reserved);
        g.ev.size_current += reserved;
        g.ev.granted += reserved;
        g.ev.size_max = g.ev.size_max.max(g.ev.size_current);
        reserved as u64
    }

    pub(crate) fn release_reserved_memory(&self, bytes: u64) {
        let mut g = self.lock();
        let n = bytes as i64;
        assert!(n <= g.ev.granted, "releasing more memory than was reserved");
        g.ev.size_current -= n;
        g.ev.size_reserved -= n;
        g.ev.granted -= n;
    }
}
