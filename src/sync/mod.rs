//! sync: примитивы координации, на которых стоит кэш.
//!
//! - rwlock: reader/writer лок, чьё состояние живёт *внутри* данных под внешним
//!   mutex'ом (ожидание отпускает этот mutex). Приоритет писателей.
//! - pair_lock: single-writer лок пары поверх rwlock (value/disk локи).
//! - bjm: барьер фоновых задач (try_add/remove/drain/reset).

pub mod bjm;
pub mod pair_lock;
pub mod rwlock;

pub use bjm::JobBarrier;
pub use pair_lock::PairLock;
pub use rwlock::ReaderWriterLock;
