//! Centralized configuration and builder for the cachetable.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - CacheTableConfig::from_env() reads CT_* env vars; unparsable values keep
//!   the default.
//! - CacheTableBuilder mirrors the fluent setters and returns a config that
//!   CacheTable::create consumes.
//!
//! Runtime tunables (periods, iterations, size limit, env dir) can also be
//! changed on a live cache; see CacheTable::set_*.

use std::fmt;
use std::path::PathBuf;

use crate::consts::{
    DEFAULT_CACHE_SIZE, DEFAULT_CHECKPOINT_PERIOD_SECS, DEFAULT_CLEANER_ITERATIONS,
    DEFAULT_CLEANER_PERIOD_SECS, ENV_CACHE_SIZE, ENV_CHECKPOINT_PERIOD, ENV_CHECKPOINT_THREADS,
    ENV_CLEANER_ITERATIONS, ENV_CLEANER_PERIOD, ENV_DIR, ENV_WORKER_THREADS,
};

#[derive(Clone, Debug)]
pub struct CacheTableConfig {
    /// Capacity in bytes (sum of pair sizes).
    /// Env: CT_CACHE_SIZE (default 128 MiB)
    pub size_limit: i64,

    /// Seconds between background checkpoints; 0 disables the timer.
    /// Env: CT_CHECKPOINT_PERIOD (default 60)
    pub checkpoint_period_secs: u64,

    /// Seconds between cleaner passes; 0 disables the timer.
    /// Env: CT_CLEANER_PERIOD (default 1)
    pub cleaner_period_secs: u64,

    /// Cleaner iterations per pass.
    /// Env: CT_CLEANER_ITERATIONS (default 1)
    pub cleaner_iterations: u32,

    /// Base directory for relative file names (open_path).
    /// Env: CT_ENV_DIR (default ".")
    pub env_dir: PathBuf,

    /// Threads of the general write/evict/prefetch pool.
    /// Env: CT_WORKER_THREADS (default 2 × available parallelism)
    pub worker_threads: usize,

    /// Threads of the checkpoint clone-write pool.
    /// Env: CT_CHECKPOINT_THREADS (default available parallelism)
    pub checkpoint_threads: usize,
}

fn parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for CacheTableConfig {
    fn default() -> Self {
        let cpus = parallelism();
        Self {
            size_limit: DEFAULT_CACHE_SIZE,
            checkpoint_period_secs: DEFAULT_CHECKPOINT_PERIOD_SECS,
            cleaner_period_secs: DEFAULT_CLEANER_PERIOD_SECS,
            cleaner_iterations: DEFAULT_CLEANER_ITERATIONS,
            env_dir: PathBuf::from("."),
            worker_threads: cpus * 2,
            checkpoint_threads: cpus,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl CacheTableConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(n) = env_parse::<i64>(ENV_CACHE_SIZE) {
            if n > 0 {
                cfg.size_limit = n;
            }
        }
        if let Some(n) = env_parse::<u64>(ENV_CHECKPOINT_PERIOD) {
            cfg.checkpoint_period_secs = n;
        }
        if let Some(n) = env_parse::<u64>(ENV_CLEANER_PERIOD) {
            cfg.cleaner_period_secs = n;
        }
        if let Some(n) = env_parse::<u32>(ENV_CLEANER_ITERATIONS) {
            cfg.cleaner_iterations = n;
        }
        if let Ok(v) = std::env::var(ENV_DIR) {
            let s = v.trim();
            if !s.is_empty() {
                cfg.env_dir = PathBuf::from(s);
            }
        }
        if let Some(n) = env_parse::<usize>(ENV_WORKER_THREADS) {
            if n > 0 {
                cfg.worker_threads = n;
            }
        }
        if let Some(n) = env_parse::<usize>(ENV_CHECKPOINT_THREADS) {
            if n > 0 {
                cfg.checkpoint_threads = n;
            }
        }

        cfg
    }

    pub fn with_size_limit(mut self, bytes: i64) -> Self {
        self.size_limit = bytes;
        self
    }

    pub fn with_checkpoint_period_secs(mut self, secs: u64) -> Self {
        self.checkpoint_period_secs = secs;
        self
    }

    pub fn with_cleaner_period_secs(mut self, secs: u64) -> Self {
        self.cleaner_period_secs = secs;
        self
    }

    pub fn with_cleaner_iterations(mut self, n: u32) -> Self {
        self.cleaner_iterations = n;
        self
    }

    pub fn with_env_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.env_dir = dir.into();
        self
    }

    pub fn with_worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n.max(1);
        self
    }

    pub fn with_checkpoint_threads(mut self, n: usize) -> Self {
        self.checkpoint_threads = n.max(1);
        self
    }
}

impl fmt::Display for CacheTableConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CacheTableConfig {{")?;
        writeln!(f, "  size_limit: {} bytes", self.size_limit)?;
        writeln!(f, "  checkpoint_period_secs: {}", self.checkpoint_period_secs)?;
        writeln!(f, "  cleaner_period_secs: {}", self.cleaner_period_secs)?;
        writeln!(f, "  cleaner_iterations: {}", self.cleaner_iterations)?;
        writeln!(f, "  env_dir: {}", self.env_dir.display())?;
        writeln!(f, "  worker_threads: {}", self.worker_threads)?;
        writeln!(f, "  checkpoint_threads: {}", self.checkpoint_threads)?;
        write!(f, "}}")
    }
}

/// Builder over CacheTableConfig. `new()` starts from the environment,
/// `from_default()` from clean defaults.
#[derive(Clone, Debug)]
pub struct CacheTableBuilder {
    cfg: CacheTableConfig,
}

impl Default for CacheTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheTableBuilder {
    pub fn new() -> Self {
        Self { cfg: CacheTableConfig::from_env() }
    }

    pub fn from_default() -> Self {
        Self { cfg: CacheTableConfig::default() }
    }

    pub fn size_limit(mut self, bytes: i64) -> Self {
        self.cfg = self.cfg.with_size_limit(bytes);
        self
    }

    pub fn checkpoint_period_secs(mut self, secs: u64) -> Self {
        self.cfg = self.cfg.with_checkpoint_period_secs(secs);
        self
    }

    pub fn cleaner_period_secs(mut self, secs: u64) -> Self {
        self.cfg = self.cfg.with_cleaner_period_secs(secs);
        self
    }

    pub fn cleaner_iterations(mut self, n: u32) -> Self {
        self.cfg = self.cfg.with_cleaner_iterations(n);
        self
    }

    pub fn env_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.cfg = self.cfg.with_env_dir(dir);
        self
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.cfg = self.cfg.with_worker_threads(n);
        self
    }

    pub fn checkpoint_threads(mut self, n: usize) -> Self {
        self.cfg = self.cfg.with_checkpoint_threads(n);
        self
    }

    pub fn build(self) -> CacheTableConfig {
        self.cfg
    }
}
