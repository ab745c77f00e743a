//! FileCheckpointLog: эталонный CheckpointLogger поверх одного файла.
//!
//! LSN монотонны и переживают переоткрытие: при open файл сканируется,
//! следующий LSN = max + 1, недописанный хвост обрезается. Файл держит
//! эксклюзивный advisory lock (fs2) до Drop.

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use fs2::FileExt;
use log::{info, warn};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use super::encode::write_record;
use super::reader::read_next_record;
use super::{
    generate_log_id, read_log_file_header, write_log_file_header, CheckpointLogger, LOG_HDR_SIZE,
    REC_BEGIN_CHECKPOINT, REC_END_CHECKPOINT, REC_FASSOCIATE, REC_OPEN_TXNS,
};
use crate::cachetable::{FileNum, Lsn};
use crate::consts::ZERO_LSN;
use crate::util::relock;

struct LogFile {
    file: File,
    next_lsn: Lsn,
    len: u64,
}

pub struct FileCheckpointLog {
    path: PathBuf,
    log_id: u64,
    inner: Mutex<LogFile>,
    last_checkpoint: AtomicU64,
    open_txns: AtomicU32,
}

impl FileCheckpointLog {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .with_context(|| format!("open checkpoint log {}", path.display()))?;
        file.try_lock_exclusive()
            .with_context(|| format!("checkpoint log {} is locked by another process", path.display()))?;

        let mut len = file.metadata().with_context(|| format!("metadata {}", path.display()))?.len();
        let log_id = if len == 0 {
            let id = generate_log_id();
            write_log_file_header(&mut file, id)?;
            file.sync_all().with_context(|| format!("fsync {}", path.display()))?;
            len = LOG_HDR_SIZE as u64;
            id
        } else {
            read_log_file_header(&mut file).with_context(|| format!("read header of {}", path.display()))?
        };

        // scan for the last LSN and the end of the valid prefix
        let mut pos = LOG_HDR_SIZE as u64;
        let mut max_lsn = ZERO_LSN;
        let mut last_checkpoint = ZERO_LSN;
        loop {
            match read_next_record(&mut file, pos, len) {
                Ok(Some((rec, next))) => {
                    max_lsn = max_lsn.max(rec.lsn);
                    if rec.rec_type == REC_END_CHECKPOINT && rec.payload.len() >= 8 {
                        last_checkpoint = LittleEndian::read_u64(&rec.payload[..8]);
                    }
                    pos = next;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("checkpoint log {}: {:#}; truncating at {}", path.display(), e, pos);
                    break;
                }
            }
        }
        if pos < len {
            warn!("checkpoint log {}: dropping {} byte tail", path.display(), len - pos);
            file.set_len(pos).with_context(|| format!("truncate {}", path.display()))?;
            len = pos;
        }
        info!(
            "checkpoint log opened: {} (id={:016x}, next_lsn={}, last_checkpoint={})",
            path.display(),
            log_id,
            max_lsn + 1,
            last_checkpoint
        );
        Ok(Self {
            path: path.to_path_buf(),
            log_id,
            inner: Mutex::new(LogFile { file, next_lsn: max_lsn + 1, len }),
            last_checkpoint: AtomicU64::new(last_checkpoint),
            open_txns: AtomicU32::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_id(&self) -> u64 {
        self.log_id
    }

    /// LSN of the last completed checkpoint (0 if none).
    pub fn last_checkpoint_lsn(&self) -> Lsn {
        self.last_checkpoint.load(Ordering::Acquire)
    }

    pub fn next_lsn(&self) -> Lsn {
        relock(self.inner.lock()).next_lsn
    }

    /// Number of live transactions reported by `log_open_txns`.
    pub fn set_open_txns(&self, n: u32) {
        self.open_txns.store(n, Ordering::Relaxed);
    }

    fn append(&self, rec_type: u8, payload: &[u8]) -> Result<Lsn> {
        let mut g = relock(self.inner.lock());
        let lsn = g.next_lsn;
        let pos = g.len;
        g.file.seek(SeekFrom::Start(pos))?;
        let n = write_record(&mut g.file, rec_type, lsn, payload)
            .with_context(|| format!("append to {}", self.path.display()))?;
        g.len += n as u64;
        g.next_lsn += 1;
        Ok(lsn)
    }

    /// Record that `filenum` names `path` in this checkpoint.
    pub fn log_fassociate(&self, filenum: FileNum, path: &Path) -> Result<Lsn> {
        let p = path.to_string_lossy();
        let mut payload = vec![0u8; 4];
        LittleEndian::write_u32(&mut payload, filenum.0);
        payload.extend_from_slice(p.as_bytes());
        self.append(REC_FASSOCIATE, &payload)
    }
}

impl CheckpointLogger for FileCheckpointLog {
    fn log_begin_checkpoint(&self) -> Result<Lsn> {
        self.append(REC_BEGIN_CHECKPOINT, &[])
    }

    fn log_open_txns(&self, _begin_lsn: Lsn) -> Result<u32> {
        let n = self.open_txns.load(Ordering::Relaxed);
        let mut payload = [0u8; 4];
        LittleEndian::write_u32(&mut payload, n);
        self.append(REC_OPEN_TXNS, &payload)?;
        Ok(n)
    }

    fn log_end_checkpoint(&self, begin_lsn: Lsn, n_files: u32, n_txns: u32) -> Result<()> {
        let mut payload = [0u8; 16];
        LittleEndian::write_u64(&mut payload[0..8], begin_lsn);
        LittleEndian::write_u32(&mut payload[8..12], n_files);
        LittleEndian::write_u32(&mut payload[12..16], n_txns);
        self.append(REC_END_CHECKPOINT, &payload)?;
        let g = relock(self.inner.lock());
        g.file.sync_data().with_context(|| format!("fsync {}", self.path.display()))
    }

    fn note_checkpoint(&self, lsn: Lsn) {
        self.last_checkpoint.store(lsn, Ordering::Release);
    }
}

impl Drop for FileCheckpointLog {
    fn drop(&mut self) {
        let g = relock(self.inner.lock());
        let _ = g.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::reader::LogReader;

    fn temp_log(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ct-log-{}-{}-{}", name, std::process::id(), generate_log_id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("checkpoint.log")
    }

    #[test]
    fn lsns_continue_after_reopen() {
        let path = temp_log("reopen");
        {
            let log = FileCheckpointLog::open(&path).unwrap();
            let lsn = log.log_begin_checkpoint().unwrap();
            assert_eq!(lsn, 1);
            log.log_open_txns(lsn).unwrap();
            log.log_end_checkpoint(lsn, 0, 0).unwrap();
        }
        let log = FileCheckpointLog::open(&path).unwrap();
        assert_eq!(log.next_lsn(), 4);
        assert_eq!(log.last_checkpoint_lsn(), 1);
    }

    #[test]
    fn torn_tail_is_dropped_on_open() {
        let path = temp_log("torn");
        {
            let log = FileCheckpointLog::open(&path).unwrap();
            log.log_begin_checkpoint().unwrap();
        }
        let good_len = std::fs::metadata(&path).unwrap().len();
        {
            use std::io::Write;
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[REC_END_CHECKPOINT, 0, 0, 0, 9, 9]).unwrap();
        }
        let mut rd = LogReader::open(&path).unwrap();
        assert_eq!(rd.by_ref().count(), 1);
        assert!(rd.has_torn_tail());

        let log = FileCheckpointLog::open(&path).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);
        assert_eq!(log.next_lsn(), 2);
    }
}
