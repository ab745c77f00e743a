//! util: общие хелперы кэша.
//!
//! Содержит:
//! - fatal(): единая точка аварийного завершения (ошибка flush/fetch callback,
//!   нарушение контракта вызывающим кодом). Логирует и делает abort().
//! - relock(): разворачивает LockResult; отравленный mutex считается фатальным:
//!   поток умер посреди критической секции, состояние таблицы не определено.
//! - micros_since(): монотонные микросекунды для учёта времени промахов.

use log::error;
use std::sync::LockResult;
use std::time::Instant;

/// Log the failing operation with its error chain and abort the process.
///
/// There is no recovery path below a failed write or read: the storage layer
/// above assumes the cache either succeeded or the process is gone.
#[cold]
pub fn fatal(op: &str, err: anyhow::Error) -> ! {
    error!("cachetable: fatal error in {}: {:?}", op, err);
    std::process::abort()
}

/// Unwrap a lock/wait result; a poisoned lock is fatal.
#[inline]
pub(crate) fn relock<T>(r: LockResult<T>) -> T {
    match r {
        Ok(v) => v,
        Err(_) => {
            error!("cachetable: poisoned lock (a thread panicked inside a critical section)");
            std::process::abort()
        }
    }
}

/// Microseconds elapsed since `start`, saturating.
#[inline]
pub(crate) fn micros_since(start: Instant) -> u64 {
    start.elapsed().as_micros().min(u64::MAX as u128) as u64
}
