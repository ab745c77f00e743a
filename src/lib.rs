//! cachetable: кэш страниц для дискового B-дерева.
//!
//! Слои снизу вверх:
//! - sync: JobBarrier, ReaderWriterLock, PairLock;
//! - pool / cron: фоновые воркеры и периодические потоки;
//! - cachetable: пары, эвикция, чекпоинт, реестр файлов;
//! - wal: журнал чекпоинтов (CheckpointLogger + файловая реализация);
//! - blockstore: эталонные callbacks поверх блоков файла.

pub mod config;
pub mod consts;
pub mod metrics;
pub mod util;

pub mod hash;
pub mod sync;

pub mod cron;
pub mod pool;

pub mod cachetable;
pub mod wal;

pub mod blockstore;

pub use blockstore::{Block, FileBlockStore};
pub use cachetable::{
    CacheFile, CacheKey, CacheTable, CleanerOutcome, ClonedValue, DepPair, Dirty, Fetched, FileCheckpointState,
    FileCtx, FileHooks, FileNum, FileUniqueId, FlushArgs, Lsn, PairAttr, PairCallbacks, PairInfo, PairLoader,
    PartialEvictionCost, PinnedPair, PutOutcome, WriteCallbacks,
};
pub use config::{CacheTableBuilder, CacheTableConfig};
pub use metrics::{CacheCounters, StatusSnapshot};
pub use wal::{CheckpointLogger, FileCheckpointLog};
