//! Последовательное чтение кадров checkpoint log с проверкой CRC32.
//!
//! Частичный хвост (заголовок или payload не умещаются в файл): это
//! мягкий EOF: Ok(None). Несовпадение CRC: ошибка целостности.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use super::{
    crc32_of_parts, read_log_file_header, LOG_HDR_SIZE, REC_HDR_SIZE, REC_OFF_CRC32, REC_OFF_LEN, REC_OFF_LSN,
    REC_OFF_TYPE,
};
use crate::cachetable::Lsn;

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub rec_type: u8,
    pub lsn: Lsn,
    pub payload: Vec<u8>,
    /// Offset of the record header.
    pub pos: u64,
    pub len_total: u64,
}

/// Read the record at `pos`. Returns the record and the next position.
pub fn read_next_record(f: &mut File, pos: u64, file_len: u64) -> Result<Option<(LogRecord, u64)>> {
    if pos + REC_HDR_SIZE as u64 > file_len {
        return Ok(None);
    }
    f.seek(SeekFrom::Start(pos))?;
    let mut hdr = [0u8; REC_HDR_SIZE];
    if let Err(e) = f.read_exact(&mut hdr) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(anyhow!("checkpoint log read header: {}", e));
    }

    let payload_len = LittleEndian::read_u32(&hdr[REC_OFF_LEN..REC_OFF_LEN + 4]) as u64;
    let total = REC_HDR_SIZE as u64 + payload_len;
    let next = pos + total;
    if next > file_len {
        return Ok(None);
    }
    let mut payload = vec![0u8; payload_len as usize];
    if let Err(e) = f.read_exact(&mut payload) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(anyhow!("checkpoint log read payload: {}", e));
    }

    let stored = LittleEndian::read_u32(&hdr[REC_OFF_CRC32..REC_OFF_CRC32 + 4]);
    let calc = crc32_of_parts(&hdr[..REC_OFF_CRC32], &payload);
    if stored != calc {
        return Err(anyhow!("checkpoint log CRC mismatch at pos {} (stored={}, calc={})", pos, stored, calc));
    }

    let rec = LogRecord {
        rec_type: hdr[REC_OFF_TYPE],
        lsn: LittleEndian::read_u64(&hdr[REC_OFF_LSN..REC_OFF_LSN + 8]),
        payload,
        pos,
        len_total: total,
    };
    Ok(Some((rec, next)))
}

/// Iterator over the records of a checkpoint log file.
pub struct LogReader {
    file: File,
    pos: u64,
    len: u64,
    log_id: u64,
    done: bool,
}

impl LogReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .open(path)
            .with_context(|| format!("open checkpoint log {}", path.display()))?;
        let log_id = read_log_file_header(&mut file).with_context(|| format!("read header of {}", path.display()))?;
        let len = file.metadata().with_context(|| format!("metadata {}", path.display()))?.len();
        Ok(Self { file, pos: LOG_HDR_SIZE as u64, len, log_id, done: false })
    }

    pub fn log_id(&self) -> u64 {
        self.log_id
    }

    /// End of the records read so far.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// True once the reader stopped on a partial record.
    pub fn has_torn_tail(&self) -> bool {
        self.done && self.pos < self.len
    }
}

impl Iterator for LogReader {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match read_next_record(&mut self.file, self.pos, self.len) {
            Ok(Some((rec, next))) => {
                self.pos = next;
                Some(Ok(rec))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
