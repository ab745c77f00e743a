//! PairList: арена пар + хэш-индекс + clock ring + pending list + списки
//! пар по файлам.
//!
//! Все ссылки: PairId (индекс слота + поколение), никаких указателей:
//! освобождённый слот получает новое поколение, и обращение по старому id
//! ловится assert'ом.
//!
//! Инварианты:
//! - пара в хэш-таблице присутствует в кольце ровно один раз;
//! - пара в pending list также есть в хэш-таблице;
//! - размер таблицы: степень двойки ≥ INITIAL_TABLE_SIZE;
//! - rehash трогает только цепочки бакетов (кольцо и pending не меняются).

use log::debug;
use std::collections::HashMap;

use super::pair::{CacheKey, FileNum, Pair, PairId};
use crate::consts::INITIAL_TABLE_SIZE;
use crate::hash::bucket_of;

struct Slot<V> {
    generation: u32,
    pair: Option<Pair<V>>,
}

pub(crate) struct PairList<V> {
    slots: Vec<Slot<V>>,
    free_slots: Vec<u32>,
    table: Vec<Option<PairId>>,
    n_in_table: u32,
    clock_head: Option<PairId>,
    cleaner_head: Option<PairId>,
    pending_head: Option<PairId>,
    file_heads: HashMap<FileNum, PairId>,
}

impl<V> PairList<V> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            table: vec![None; INITIAL_TABLE_SIZE],
            n_in_table: 0,
            clock_head: None,
            cleaner_head: None,
            pending_head: None,
            file_heads: HashMap::new(),
        }
    }

    #[inline]
    pub(crate) fn n_in_table(&self) -> u32 {
        self.n_in_table
    }

    #[inline]
    pub(crate) fn table_size(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub(crate) fn clock_head(&self) -> Option<PairId> {
        self.clock_head
    }

    #[inline]
    pub(crate) fn cleaner_head(&self) -> Option<PairId> {
        self.cleaner_head
    }

    #[inline]
    pub(crate) fn pending_head(&self) -> Option<PairId> {
        self.pending_head
    }

    /// True while `id` names a live (not yet freed) pair.
    pub(crate) fn is_live(&self, id: PairId) -> bool {
        self.slots
            .get(id.index as usize)
            .map(|s| s.generation == id.generation && s.pair.is_some())
            .unwrap_or(false)
    }

    pub(crate) fn pair(&self, id: PairId) -> &Pair<V> {
        let slot = &self.slots[id.index as usize];
        assert_eq!(slot.generation, id.generation, "stale pair id {:?}", id);
        match slot.pair.as_ref() {
            Some(p) => p,
            None => panic!("pair id {:?} refers to a freed slot", id),
        }
    }

    pub(crate) fn pair_mut(&mut self, id: PairId) -> &mut Pair<V> {
        let slot = &mut self.slots[id.index as usize];
        assert_eq!(slot.generation, id.generation, "stale pair id {:?}", id);
        match slot.pair.as_mut() {
            Some(p) => p,
            None => panic!("pair id {:?} refers to a freed slot", id),
        }
    }

    /// Hash-chain lookup by exact (file, key).
    pub(crate) fn find(&self, filenum: FileNum, key: CacheKey, fullhash: u32) -> Option<PairId> {
        let mut cur = self.table[bucket_of(fullhash, self.table.len())];
        while let Some(id) = cur {
            let p = self.pair(id);
            if p.key == key && p.filenum() == filenum {
                return Some(id);
            }
            cur = p.hash_next;
        }
        None
    }

    /// Allocate a slot and link the pair everywhere: hash chain, clock ring
    /// (just before the head), its file's list. Grows the table at 1x load.
    pub(crate) fn insert(&mut self, pair: Pair<V>) -> PairId {
        debug_assert!(self.find(pair.filenum(), pair.key, pair.fullhash).is_none());
        let id = match self.free_slots.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.pair = Some(pair);
                PairId { index, generation: slot.generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot { generation: 0, pair: Some(pair) });
                PairId { index, generation: 0 }
            }
        };

        let b = bucket_of(self.pair(id).fullhash, self.table.len());
        let old_head = self.table[b];
        self.pair_mut(id).hash_next = old_head;
        self.table[b] = Some(id);
        self.n_in_table += 1;

        self.ring_insert_before_head(id);
        self.file_list_push(id);

        if self.n_in_table as usize > self.table.len() {
            let n = self.table.len() * 2;
            self.rehash(n);
        }
        id
    }

    /// Unlink from hash chain, ring, pending list and file list. The slot
    /// stays allocated until `free`.
    pub(crate) fn remove(&mut self, id: PairId) {
        let (fullhash, next) = {
            let p = self.pair(id);
            (p.fullhash, p.hash_next)
        };
        let b = bucket_of(fullhash, self.table.len());
        if self.table[b] == Some(id) {
            self.table[b] = next;
        } else {
            let mut cur = self.table[b];
            loop {
                let c = match cur {
                    Some(c) => c,
                    None => panic!("pair {:?} missing from its hash chain", id),
                };
                let cn = self.pair(c).hash_next;
                if cn == Some(id) {
                    self.pair_mut(c).hash_next = next;
                    break;
                }
                cur = cn;
            }
        }
        self.pair_mut(id).hash_next = None;
        assert!(self.n_in_table > 0, "n_in_table underflow");
        self.n_in_table -= 1;

        self.ring_remove(id);
        self.pending_remove(id);
        self.file_list_remove(id);
    }

    /// Release the slot of a removed pair, returning it.
    pub(crate) fn free(&mut self, id: PairId) -> Pair<V> {
        let slot = &mut self.slots[id.index as usize];
        assert_eq!(slot.generation, id.generation, "double free of pair {:?}", id);
        let pair = match slot.pair.take() {
            Some(p) => p,
            None => panic!("double free of pair {:?}", id),
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(id.index);
        pair
    }

    /// Rebuild the bucket array. Never releases any lock; ring and pending
    /// list are untouched.
    pub(crate) fn rehash(&mut self, new_size: usize) {
        assert!(new_size.is_power_of_two() && new_size >= INITIAL_TABLE_SIZE);
        let mut table: Vec<Option<PairId>> = vec![None; new_size];
        for b in 0..self.table.len() {
            let mut cur = self.table[b];
            while let Some(id) = cur {
                let (fullhash, next) = {
                    let p = self.pair(id);
                    (p.fullhash, p.hash_next)
                };
                let nb = bucket_of(fullhash, new_size);
                self.pair_mut(id).hash_next = table[nb];
                table[nb] = Some(id);
                cur = next;
            }
        }
        debug!("pair table rehash {} -> {} (pairs={})", self.table.len(), new_size, self.n_in_table);
        self.table = table;
    }

    /// Halve the table when occupancy drops under 25%.
    pub(crate) fn maybe_shrink(&mut self) -> bool {
        let size = self.table.len();
        if size > INITIAL_TABLE_SIZE && (self.n_in_table as usize) * 4 < size {
            self.rehash(size / 2);
            true
        } else {
            false
        }
    }

    // ---------------- clock ring ----------------

    fn ring_insert_before_head(&mut self, id: PairId) {
        match self.clock_head {
            None => {
                let p = self.pair_mut(id);
                p.clock_next = id;
                p.clock_prev = id;
                self.clock_head = Some(id);
                self.cleaner_head = Some(id);
            }
            Some(head) => {
                let tail = self.pair(head).clock_prev;
                {
                    let p = self.pair_mut(id);
                    p.clock_next = head;
                    p.clock_prev = tail;
                }
                self.pair_mut(tail).clock_next = id;
                self.pair_mut(head).clock_prev = id;
            }
        }
    }

    fn ring_remove(&mut self, id: PairId) {
        let (next, prev) = {
            let p = self.pair(id);
            (p.clock_next, p.clock_prev)
        };
        if next == id {
            // singleton
            self.clock_head = None;
            self.cleaner_head = None;
        } else {
            self.pair_mut(prev).clock_next = next;
            self.pair_mut(next).clock_prev = prev;
            if self.clock_head == Some(id) {
                self.clock_head = Some(next);
            }
            if self.cleaner_head == Some(id) {
                self.cleaner_head = Some(next);
            }
        }
        let p = self.pair_mut(id);
        p.clock_next = PairId::NIL;
        p.clock_prev = PairId::NIL;
    }

    pub(crate) fn advance_clock_head(&mut self) {
        if let Some(h) = self.clock_head {
            self.clock_head = Some(self.pair(h).clock_next);
        }
    }

    pub(crate) fn advance_cleaner_head(&mut self) {
        if let Some(h) = self.cleaner_head {
            self.cleaner_head = Some(self.pair(h).clock_next);
        }
    }

    // ---------------- pending list ----------------

    pub(crate) fn pending_push_front(&mut self, id: PairId) {
        debug_assert!(!self.on_pending_list(id));
        let old = self.pending_head;
        {
            let p = self.pair_mut(id);
            p.pending_next = old;
            p.pending_prev = None;
        }
        if let Some(o) = old {
            self.pair_mut(o).pending_prev = Some(id);
        }
        self.pending_head = Some(id);
    }

    fn on_pending_list(&self, id: PairId) -> bool {
        self.pending_head == Some(id) || self.pair(id).pending_prev.is_some()
    }

    /// O(1); a pair that is not on the list is left alone.
    pub(crate) fn pending_remove(&mut self, id: PairId) {
        if !self.on_pending_list(id) {
            return;
        }
        let (next, prev) = {
            let p = self.pair(id);
            (p.pending_next, p.pending_prev)
        };
        match prev {
            Some(pr) => self.pair_mut(pr).pending_next = next,
            None => self.pending_head = next,
        }
        if let Some(n) = next {
            self.pair_mut(n).pending_prev = prev;
        }
        let p = self.pair_mut(id);
        p.pending_next = None;
        p.pending_prev = None;
    }

    // ---------------- per-file lists ----------------

    fn file_list_push(&mut self, id: PairId) {
        let fnum = self.pair(id).filenum();
        let old = self.file_heads.get(&fnum).copied();
        {
            let p = self.pair_mut(id);
            p.cf_next = old;
            p.cf_prev = None;
        }
        if let Some(o) = old {
            self.pair_mut(o).cf_prev = Some(id);
        }
        self.file_heads.insert(fnum, id);
    }

    fn file_list_remove(&mut self, id: PairId) {
        let (fnum, next, prev) = {
            let p = self.pair(id);
            (p.filenum(), p.cf_next, p.cf_prev)
        };
        match prev {
            Some(pr) => self.pair_mut(pr).cf_next = next,
            None => match next {
                Some(n) => {
                    self.file_heads.insert(fnum, n);
                }
                None => {
                    self.file_heads.remove(&fnum);
                }
            },
        }
        if let Some(n) = next {
            self.pair_mut(n).cf_prev = prev;
        }
        let p = self.pair_mut(id);
        p.cf_next = None;
        p.cf_prev = None;
    }

    // ---------------- iteration ----------------

    /// Pairs in bucket order.
    pub(crate) fn ids(&self) -> Vec<PairId> {
        let mut out = Vec::with_capacity(self.n_in_table as usize);
        for head in &self.table {
            let mut cur = *head;
            while let Some(id) = cur {
                out.push(id);
                cur = self.pair(id).hash_next;
            }
        }
        out
    }

    /// Pairs in clock order starting at the head.
    pub(crate) fn ring_ids(&self) -> Vec<PairId> {
        let mut out = Vec::new();
        if let Some(head) = self.clock_head {
            let mut cur = head;
            loop {
                out.push(cur);
                cur = self.pair(cur).clock_next;
                if cur == head {
                    break;
                }
            }
        }
        out
    }

    pub(crate) fn pending_ids(&self) -> Vec<PairId> {
        let mut out = Vec::new();
        let mut cur = self.pending_head;
        while let Some(id) = cur {
            out.push(id);
            cur = self.pair(id).pending_next;
        }
        out
    }

    pub(crate) fn file_ids(&self, filenum: FileNum) -> Vec<PairId> {
        let mut out = Vec::new();
        let mut cur = self.file_heads.get(&filenum).copied();
        while let Some(id) = cur {
            out.push(id);
            cur = self.pair(id).cf_next;
        }
        out
    }

    pub(crate) fn has_pairs_of(&self, filenum: FileNum) -> bool {
        self.file_heads.contains_key(&filenum)
    }

    /// Structural self-check: hash ↔ ring ↔ file lists ↔ pending.
    pub(crate) fn verify(&self) {
        let mut in_table = self.ids();
        assert_eq!(in_table.len(), self.n_in_table as usize, "n_in_table mismatch");
        assert!(self.table.len().is_power_of_two() && self.table.len() >= INITIAL_TABLE_SIZE);
        for &id in &in_table {
            let p = self.pair(id);
            assert_eq!(
                self.find(p.filenum(), p.key, p.fullhash),
                Some(id),
                "pair not reachable by its own key"
            );
            assert_eq!(self.pair(p.clock_next).clock_prev, id, "broken clock links");
        }
        let mut ring = self.ring_ids();
        in_table.sort_by_key(|id| id.index);
        ring.sort_by_key(|id| id.index);
        assert_eq!(in_table, ring, "hash table and clock ring disagree");

        let mut files: Vec<PairId> = Vec::new();
        for &fnum in self.file_heads.keys() {
            for id in self.file_ids(fnum) {
                assert_eq!(self.pair(id).filenum(), fnum, "pair on the wrong file list");
                files.push(id);
            }
        }
        files.sort_by_key(|id| id.index);
        assert_eq!(in_table, files, "hash table and file lists disagree");

        for id in self.pending_ids() {
            assert!(in_table.binary_search_by_key(&id.index, |x| x.index).is_ok());
        }
        if let Some(c) = self.cleaner_head {
            assert!(in_table.binary_search_by_key(&c.index, |x| x.index).is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cachetable::files::FileCtx;
    use crate::cachetable::pair::{Dirty, FlushArgs, PairAttr, WriteCallbacks};
    use crate::hash::fullhash;
    use std::sync::Arc;

    struct Noop;
    impl WriteCallbacks<u64> for Noop {
        fn flush(&self, _a: FlushArgs<'_, u64>) -> anyhow::Result<Option<PairAttr>> {
            Ok(None)
        }
    }

    fn ctx(n: u32) -> Arc<FileCtx> {
        Arc::new(FileCtx::scratch(FileNum(n)).unwrap())
    }

    fn mk(f: &Arc<FileCtx>, key: u64) -> Pair<u64> {
        Pair::new(
            f.clone(),
            key,
            fullhash(f.filenum, key),
            Some(key),
            PairAttr::sized(1),
            Dirty::Clean,
            Arc::new(Noop),
        )
    }

    #[test]
    fn first_insert_is_clock_and_cleaner_head() {
        let f = ctx(1);
        let mut l = PairList::new();
        let id = l.insert(mk(&f, 7));
        assert_eq!(l.clock_head(), Some(id));
        assert_eq!(l.cleaner_head(), Some(id));
        assert_eq!(l.n_in_table(), 1);
        l.verify();
    }

    #[test]
    fn ring_appends_before_head() {
        let f = ctx(1);
        let mut l = PairList::new();
        let a = l.insert(mk(&f, 1));
        let b = l.insert(mk(&f, 2));
        let c = l.insert(mk(&f, 3));
        assert_eq!(l.ring_ids(), vec![a, b, c]);
        l.remove(a);
        assert_eq!(l.clock_head(), Some(b));
        assert_eq!(l.cleaner_head(), Some(b));
        l.free(a);
        l.verify();
        l.remove(b);
        l.free(b);
        l.remove(c);
        l.free(c);
        assert_eq!(l.clock_head(), None);
        assert_eq!(l.cleaner_head(), None);
    }

    #[test]
    fn pending_remove_tolerates_absent_pair() {
        let f = ctx(2);
        let mut l = PairList::new();
        let a = l.insert(mk(&f, 1));
        let b = l.insert(mk(&f, 2));
        l.pending_remove(a);
        l.pending_push_front(a);
        l.pending_push_front(b);
        assert_eq!(l.pending_ids(), vec![b, a]);
        l.pending_remove(a);
        l.pending_remove(a);
        assert_eq!(l.pending_ids(), vec![b]);
        l.pending_remove(b);
        assert_eq!(l.pending_head(), None);
    }

    #[test]
    fn grow_and_shrink_keep_everything_reachable() {
        let f = ctx(3);
        let mut l = PairList::new();
        let ids: Vec<_> = (0..100u64).map(|k| l.insert(mk(&f, k))).collect();
        assert!(l.table_size() >= 128);
        l.pending_push_front(ids[5]);
        let ring_before = l.ring_ids();
        for &id in &ids[10..] {
            l.remove(id);
            l.free(id);
        }
        while l.maybe_shrink() {}
        assert_eq!(l.table_size(), 32);
        for k in 0..10u64 {
            assert_eq!(l.find(FileNum(3), k, fullhash(FileNum(3), k)), Some(ids[k as usize]));
        }
        let ring_after: Vec<_> = ring_before.into_iter().filter(|id| l.is_live(*id)).collect();
        assert_eq!(l.ring_ids(), ring_after);
        assert_eq!(l.pending_ids(), vec![ids[5]]);
        l.verify();
    }

    #[test]
    fn freed_slot_gets_new_generation() {
        let f = ctx(4);
        let mut l = PairList::new();
        let a = l.insert(mk(&f, 1));
        l.remove(a);
        l.free(a);
        let b = l.insert(mk(&f, 2));
        assert_eq!(a.index, b.index);
        assert_ne!(a.generation, b.generation);
        assert!(!l.is_live(a));
        assert!(l.is_live(b));
    }

    #[test]
    fn file_lists_split_by_filenum() {
        let f1 = ctx(5);
        let f2 = ctx(6);
        let mut l = PairList::new();
        for k in 0..4 {
            l.insert(mk(&f1, k));
            l.insert(mk(&f2, k));
        }
        assert_eq!(l.file_ids(FileNum(5)).len(), 4);
        assert_eq!(l.file_ids(FileNum(6)).len(), 4);
        for id in l.file_ids(FileNum(5)) {
            l.remove(id);
            l.free(id);
        }
        assert!(!l.has_pairs_of(FileNum(5)));
        assert!(l.has_pairs_of(FileNum(6)));
        l.verify();
    }
}
