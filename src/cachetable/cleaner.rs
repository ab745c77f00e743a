//! Cleaner: периодический проход по cache pressure.
//!
//! За итерацию смотрим до CLEANER_N_TO_CHECK пар от курсора cleaner'а и
//! берём свободную пару с наибольшим cache_pressure_size (> 0), чей файл
//! принимает фоновую задачу. Пара блокируется, pending-бит обрабатывается
//! как при обычном pin, затем вызывается cleaner callback.

use anyhow::Result;
use log::debug;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::evictor::set_attr;
use super::pair::{Dirty, PairId};
use super::{CacheTable, Inner, Shared};
use crate::consts::CLEANER_N_TO_CHECK;
use crate::util::fatal;

impl<V: Send + 'static> Shared<V> {
    /// Pick the best candidate near the cursor; a job is registered on its
    /// file's barrier.
    fn select_cleaner_pair(&self, g: &mut Inner<V>) -> Option<PairId> {
        let start = g.list.cleaner_head()?;
        let mut best: Option<(PairId, i64)> = None;
        let mut cur = start;
        for _ in 0..CLEANER_N_TO_CHECK {
            let (score, idle, file) = {
                let p = g.list.pair(cur);
                (p.attr.cache_pressure_size, !p.is_busy(), Arc::clone(&p.file))
            };
            if idle && score > best.map(|(_, s)| s).unwrap_or(0) && file.bjm.try_add() {
                if let Some((old, _)) = best {
                    g.list.pair(old).file.bjm.remove();
                }
                best = Some((cur, score));
            }
            g.list.advance_cleaner_head();
            match g.list.cleaner_head() {
                Some(next) if next != start => cur = next,
                _ => break,
            }
        }
        best.map(|(id, _)| id)
    }

    pub(crate) fn run_cleaner(self: &Arc<Self>) -> Result<()> {
        let iterations = self.cleaner_iterations.load(Ordering::Relaxed);
        for _ in 0..iterations {
            let mut g = self.lock();
            let id = match self.select_cleaner_pair(&mut g) {
                Some(id) => id,
                None => break,
            };
            g = self.lock_value(g, id);
            let (g2, was) = self.take_pending(g, &[id]);
            g = self.checkpoint_locked_pair(g2, id, was[0]);

            let (cells, cbs, file, key, fullhash, pressure) = {
                let p = g.list.pair(id);
                (
                    Arc::clone(&p.cells),
                    Arc::clone(&p.write_cbs),
                    Arc::clone(&p.file),
                    p.key,
                    p.fullhash,
                    p.attr.cache_pressure_size,
                )
            };
            if pressure > 0 {
                debug!("cleaner: {}:{} (pressure {})", file.filenum, key, pressure);
                drop(g);
                let outcome = match cells.value().as_mut() {
                    Some(v) => cbs.cleaner(v, key, fullhash).unwrap_or_else(|e| fatal("cleaner", e)),
                    None => panic!("cleaner picked pair {}:{} without a value", file.filenum, key),
                };
                g = self.lock();
                if let Some(a) = outcome.new_attr {
                    set_attr(&mut g, id, a);
                }
                if outcome.dirty {
                    g.list.pair_mut(id).dirty = Dirty::Dirty;
                }
                self.counters.record_cleaner_execution();
            }
            g.list.pair_mut(id).value_lock.unlock();
            drop(g);
            file.bjm.remove();
            self.counters.record_cleaner_iteration();
        }
        Ok(())
    }
}

impl<V: Send + 'static> CacheTable<V> {
    /// One cleaner pass, as the periodic cleaner thread runs it.
    pub fn run_cleaner(&self) -> Result<()> {
        self.shared.run_cleaner()
    }
}
