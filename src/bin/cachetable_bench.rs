use anyhow::{anyhow, Context, Result};
use clap::Parser;
use env_logger::{Builder, Env};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cachetable::{
    Block, CacheFile, CacheTable, CacheTableBuilder, CheckpointLogger, Dirty, FileBlockStore, FileCheckpointLog,
    PairCallbacks, StatusSnapshot,
};

/// cachetable micro-benchmark CLI
///
/// Примеры:
///   cachetable_bench --path ./benchct --clean --json
///   cachetable_bench --path ./benchct --clean --limit 1048576 --threads 8 --write-pct 50
#[derive(Parser, Debug)]
#[command(name = "cachetable_bench", version, about = "cachetable micro-bench CLI")]
struct Opt {
    /// Directory for the cache files and the checkpoint log
    #[arg(long)]
    path: PathBuf,

    /// Remove the directory first
    #[arg(long, default_value_t = false)]
    clean: bool,

    /// Number of cache files
    #[arg(long, default_value_t = 4)]
    files: usize,

    /// Keys per file
    #[arg(long, default_value_t = 10_000)]
    keys: u64,

    /// Total get/unpin operations
    #[arg(long, default_value_t = 200_000)]
    ops: u64,

    /// Block size (bytes, header included)
    #[arg(long, default_value_t = 4096)]
    block_size: usize,

    /// Cache size limit (bytes)
    #[arg(long, default_value_t = 8 * 1024 * 1024)]
    limit: i64,

    /// Client threads
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Share of operations that dirty the block (percent)
    #[arg(long, default_value_t = 30)]
    write_pct: u32,

    /// Checkpoint period (seconds, 0 = off)
    #[arg(long, default_value_t = 2)]
    checkpoint_period: u64,

    /// Random seed
    #[arg(long, default_value_t = 0xA1B2_C3D4_E5F6_7788)]
    seed: u64,

    /// JSON output
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
struct PhaseStats {
    name: String,
    ops: u64,
    elapsed_sec: f64,
    tput_ops: f64,
    p50_ms: f64,
    p90_ms: f64,
    p99_ms: f64,
}

#[derive(Debug, Serialize)]
struct BenchReport {
    files: usize,
    keys_per_file: u64,
    block_size: usize,
    threads: usize,
    write_pct: u32,
    block_reads: u64,
    block_writes: u64,
    last_checkpoint_lsn: u64,
    phases: Vec<PhaseStats>,
    status: StatusSnapshot,
}

fn init_logger() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();
    if let Err(e) = run() {
        eprintln!("bench error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let opt = Opt::parse();
    if opt.files == 0 || opt.threads == 0 {
        return Err(anyhow!("--files and --threads must be positive"));
    }
    if opt.clean && opt.path.exists() {
        fs::remove_dir_all(&opt.path).with_context(|| format!("remove {}", opt.path.display()))?;
    }
    fs::create_dir_all(&opt.path).with_context(|| format!("create {}", opt.path.display()))?;

    let log = Arc::new(FileCheckpointLog::open(&opt.path.join("checkpoint.log"))?);
    let cfg = CacheTableBuilder::new()
        .size_limit(opt.limit)
        .checkpoint_period_secs(opt.checkpoint_period)
        .env_dir(&opt.path)
        .build();
    println!("[bench] {}", cfg);
    let logger: Arc<dyn CheckpointLogger> = log.clone();
    let mut ct: CacheTable<Block> = CacheTable::create(&cfg, Some(logger))?;

    let store = Arc::new(FileBlockStore::new(opt.block_size));
    let cbs = PairCallbacks::new(Arc::clone(&store));
    let files = (0..opt.files)
        .map(|i| ct.open_path(format!("blocks-{:03}.ct", i)))
        .collect::<Result<Vec<CacheFile>>>()?;

    println!("==> Phase: random get/unpin ({} ops, {} threads)", opt.ops, opt.threads);
    let phase = phase_random(&opt, &ct, &files, &cbs)?;
    print_phase_summary(&phase);

    println!("==> Phase: final checkpoint");
    let t0 = Instant::now();
    ct.checkpoint()?;
    let cp = PhaseStats {
        name: "checkpoint".to_string(),
        ops: 1,
        elapsed_sec: t0.elapsed().as_secs_f64(),
        tput_ops: 0.0,
        p50_ms: 0.0,
        p90_ms: 0.0,
        p99_ms: 0.0,
    };
    print_phase_summary(&cp);

    ct.verify();
    let status = ct.status();
    ct.close()?;

    let report = BenchReport {
        files: opt.files,
        keys_per_file: opt.keys,
        block_size: opt.block_size,
        threads: opt.threads,
        write_pct: opt.write_pct,
        block_reads: store.reads(),
        block_writes: store.writes(),
        last_checkpoint_lsn: log.last_checkpoint_lsn(),
        phases: vec![phase, cp],
        status,
    };
    if opt.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report_human(&report);
    }
    Ok(())
}

fn phase_random(opt: &Opt, ct: &CacheTable<Block>, files: &[CacheFile], cbs: &PairCallbacks<Block>) -> Result<PhaseStats> {
    let per_thread = opt.ops / opt.threads as u64;
    let payload = opt.block_size - cachetable::blockstore::BLOCK_HDR_SIZE;
    let start = Instant::now();
    let mut lat: Vec<Duration> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..opt.threads)
            .map(|t| {
                s.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(opt.seed ^ (t as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
                    let mut lat = Vec::with_capacity(per_thread as usize);
                    for _ in 0..per_thread {
                        let f = &files[rng.gen_range(0..files.len())];
                        let key = rng.gen_range(0..opt.keys);
                        let write = rng.gen_range(0..100) < opt.write_pct;
                        let t0 = Instant::now();
                        let pinned = ct.get_and_pin(f, key, f.fullhash(key), cbs);
                        if write {
                            let fill = rng.gen::<u8>();
                            let len = rng.gen_range(1..=payload);
                            let attr = pinned.with_value(|b| {
                                b.data.clear();
                                b.data.resize(len, fill);
                                FileBlockStore::attr_of(b)
                            });
                            ct.unpin(pinned, Dirty::Dirty, Some(attr));
                        } else {
                            ct.unpin(pinned, Dirty::Clean, None);
                        }
                        lat.push(t0.elapsed());
                    }
                    lat
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e))).collect()
    });
    let elapsed = start.elapsed();
    Ok(stats("random", per_thread * opt.threads as u64, elapsed, &mut lat))
}

fn print_phase_summary(p: &PhaseStats) {
    println!(
        "    {:>10} done: ops={} elapsed={:.3}s, tput={:.0} ops/s, p50={:.3}ms p90={:.3}ms p99={:.3}ms",
        p.name, p.ops, p.elapsed_sec, p.tput_ops, p.p50_ms, p.p90_ms, p.p99_ms
    );
}

fn stats(name: &str, ops: u64, elapsed: Duration, lat: &mut [Duration]) -> PhaseStats {
    lat.sort_unstable();
    let to_ms = |d: Duration| d.as_secs_f64() * 1000.0;
    let p = |q: f64| -> f64 {
        if lat.is_empty() {
            return 0.0;
        }
        let idx = ((lat.len() as f64 - 1.0) * q).round() as usize;
        to_ms(lat[idx])
    };
    let tput = if elapsed.as_secs_f64() > 0.0 {
        ops as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    PhaseStats {
        name: name.to_string(),
        ops,
        elapsed_sec: elapsed.as_secs_f64(),
        tput_ops: tput,
        p50_ms: p(0.50),
        p90_ms: p(0.90),
        p99_ms: p(0.99),
    }
}

fn print_report_human(r: &BenchReport) {
    let s = &r.status;
    println!("==> Summary");
    println!(
        "    files={} keys/file={} block={}B threads={} write_pct={}",
        r.files, r.keys_per_file, r.block_size, r.threads, r.write_pct
    );
    println!(
        "    hits={} misses={} hit_ratio={:.3} avg_miss={:.1}us",
        s.hits,
        s.misses,
        s.hit_ratio(),
        s.avg_miss_us()
    );
    println!(
        "    evictions={} partial(cheap/expensive)={}/{} flow_control_waits={}",
        s.evictions, s.partial_evictions_cheap, s.partial_evictions_expensive, s.flow_control_waits
    );
    println!(
        "    checkpoints={} checkpoint_writes={} clone_writes={} last_lsn={}",
        s.checkpoints_completed, s.checkpoint_writes, s.clone_writes, r.last_checkpoint_lsn
    );
    println!(
        "    size current={} max={} limit={} pairs={} table={}",
        s.size_current, s.size_max, s.size_limit, s.n_in_table, s.table_size
    );
    println!("    block reads={} writes={}", r.block_reads, r.block_writes);
}
