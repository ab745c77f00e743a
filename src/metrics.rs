//! Per-instance cache counters and the status snapshot.
//!
//! Потокобезопасные атомарные счётчики, принадлежащие конкретному кэшу
//! (никаких process-wide static'ов): два кэша в одном процессе не смешивают
//! статистику. Размерные показатели (current/limit/evicting/...) живут под
//! table lock и попадают в снапшот через CacheTable::status().

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    miss_time_us: AtomicU64,
    puts: AtomicU64,
    prefetches: AtomicU64,
    evictions: AtomicU64,
    partial_evictions_cheap: AtomicU64,
    partial_evictions_expensive: AtomicU64,
    cleaner_executions: AtomicU64,
    cleaner_iterations: AtomicU64,
    checkpoints_begun: AtomicU64,
    checkpoints_completed: AtomicU64,
    checkpoint_writes: AtomicU64,
    clone_writes: AtomicU64,
    flow_control_waits: AtomicU64,
}

impl CacheCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self, micros: u64) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.miss_time_us.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch(&self) {
        self.prefetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partial_eviction(&self, expensive: bool) {
        if expensive {
            self.partial_evictions_expensive.fetch_add(1, Ordering::Relaxed);
        } else {
            self.partial_evictions_cheap.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cleaner_execution(&self) {
        self.cleaner_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cleaner_iteration(&self) {
        self.cleaner_iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint_begin(&self) {
        self.checkpoints_begun.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint_end(&self) {
        self.checkpoints_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint_write(&self, cloned: bool) {
        self.checkpoint_writes.fetch_add(1, Ordering::Relaxed);
        if cloned {
            self.clone_writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_flow_control_wait(&self) {
        self.flow_control_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters into `out`, leaving the size fields untouched.
    pub(crate) fn fill(&self, out: &mut StatusSnapshot) {
        out.hits = self.hits.load(Ordering::Relaxed);
        out.misses = self.misses.load(Ordering::Relaxed);
        out.miss_time_us = self.miss_time_us.load(Ordering::Relaxed);
        out.puts = self.puts.load(Ordering::Relaxed);
        out.prefetches = self.prefetches.load(Ordering::Relaxed);
        out.evictions = self.evictions.load(Ordering::Relaxed);
        out.partial_evictions_cheap = self.partial_evictions_cheap.load(Ordering::Relaxed);
        out.partial_evictions_expensive = self.partial_evictions_expensive.load(Ordering::Relaxed);
        out.cleaner_executions = self.cleaner_executions.load(Ordering::Relaxed);
        out.cleaner_iterations = self.cleaner_iterations.load(Ordering::Relaxed);
        out.checkpoints_begun = self.checkpoints_begun.load(Ordering::Relaxed);
        out.checkpoints_completed = self.checkpoints_completed.load(Ordering::Relaxed);
        out.checkpoint_writes = self.checkpoint_writes.load(Ordering::Relaxed);
        out.clone_writes = self.clone_writes.load(Ordering::Relaxed);
        out.flow_control_waits = self.flow_control_waits.load(Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for c in [
            &self.hits,
            &self.misses,
            &self.miss_time_us,
            &self.puts,
            &self.prefetches,
            &self.evictions,
            &self.partial_evictions_cheap,
            &self.partial_evictions_expensive,
            &self.cleaner_executions,
            &self.cleaner_iterations,
            &self.checkpoints_begun,
            &self.checkpoints_completed,
            &self.checkpoint_writes,
            &self.clone_writes,
            &self.flow_control_waits,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    // counters
    pub hits: u64,
    pub misses: u64,
    pub miss_time_us: u64,
    pub puts: u64,
    pub prefetches: u64,
    pub evictions: u64,
    pub partial_evictions_cheap: u64,
    pub partial_evictions_expensive: u64,
    pub cleaner_executions: u64,
    pub cleaner_iterations: u64,
    pub checkpoints_begun: u64,
    pub checkpoints_completed: u64,
    pub checkpoint_writes: u64,
    pub clone_writes: u64,
    pub flow_control_waits: u64,

    // size accounting (bytes)
    pub size_current: i64,
    pub size_limit: i64,
    pub size_max: i64,
    pub size_evicting: i64,
    pub size_reserved: i64,
    pub size_nonleaf: i64,
    pub size_leaf: i64,
    pub size_rollback: i64,
    pub size_cachepressure: i64,
    pub size_cloned_data: i64,

    // table
    pub n_in_table: u32,
    pub table_size: usize,
    pub pending_pairs: usize,
}

impl StatusSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn avg_miss_us(&self) -> f64 {
        if self.misses == 0 {
            0.0
        } else {
            self.miss_time_us as f64 / self.misses as f64
        }
    }
}
