//! Общие константы кэша (clock, cleaner, хэш‑таблица, ENV).

// -------- Clock --------
/// Upper bound of a pair's clock-use counter.
pub const CLOCK_SATURATION: u8 = 15;
/// Counter value given to a freshly inserted pair.
pub const CLOCK_INITIAL_COUNT: u8 = 3;

// -------- Cleaner --------
/// How many pairs one cleaner iteration rates before picking a victim.
pub const CLEANER_N_TO_CHECK: usize = 8;

// -------- Hash table --------
/// Bucket array size at creation; also the floor for shrinking.
pub const INITIAL_TABLE_SIZE: usize = 4;

// -------- LSN --------
pub const ZERO_LSN: u64 = 0;

// -------- Defaults --------
pub const DEFAULT_CACHE_SIZE: i64 = 128 * 1024 * 1024;
pub const DEFAULT_CHECKPOINT_PERIOD_SECS: u64 = 60;
pub const DEFAULT_CLEANER_PERIOD_SECS: u64 = 1;
pub const DEFAULT_CLEANER_ITERATIONS: u32 = 1;

// -------- ENV --------
pub const ENV_CACHE_SIZE: &str = "CT_CACHE_SIZE";
pub const ENV_CHECKPOINT_PERIOD: &str = "CT_CHECKPOINT_PERIOD";
pub const ENV_CLEANER_PERIOD: &str = "CT_CLEANER_PERIOD";
pub const ENV_CLEANER_ITERATIONS: &str = "CT_CLEANER_ITERATIONS";
pub const ENV_DIR: &str = "CT_ENV_DIR";
pub const ENV_WORKER_THREADS: &str = "CT_WORKER_THREADS";
pub const ENV_CHECKPOINT_THREADS: &str = "CT_CHECKPOINT_THREADS";
