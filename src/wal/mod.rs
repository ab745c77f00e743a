//! Checkpoint log: что кэш пишет в журнал во время чекпоинта.
//!
//! - CheckpointLogger: трейт коллаборатора (LSN begin-записи, живые
//!   транзакции, end-запись с fsync, уведомление о завершённом чекпоинте).
//! - writer.rs: FileCheckpointLog: эталонная реализация поверх файла.
//! - reader.rs: последовательное чтение кадров с проверкой CRC.
//! - encode.rs: построение/запись кадра.
//!
//! Формат файла: заголовок 16 байт (MAGIC + log_id LE u64), далее кадры
//! `[type u8][pad u8;3][lsn u64][len u32][crc32 u32][payload]`, CRC32 по
//! header[0..crc) + payload.

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::cachetable::Lsn;

pub const LOG_MAGIC: &[u8; 8] = b"CTCKPT01";
pub const LOG_HDR_SIZE: usize = 16;
pub const LOG_HDR_OFF_ID: usize = 8;

pub const REC_HDR_SIZE: usize = 20;
pub const REC_OFF_TYPE: usize = 0;
pub const REC_OFF_LSN: usize = 4;
pub const REC_OFF_LEN: usize = 12;
pub const REC_OFF_CRC32: usize = 16;

pub const REC_BEGIN_CHECKPOINT: u8 = 1;
/// payload: n_txns u32
pub const REC_OPEN_TXNS: u8 = 2;
/// payload: begin_lsn u64, n_files u32, n_txns u32
pub const REC_END_CHECKPOINT: u8 = 3;
/// payload: filenum u32, path bytes
pub const REC_FASSOCIATE: u8 = 4;

/// Log collaborator consulted by begin/end checkpoint. Errors from the
/// logging calls are fatal to the process.
pub trait CheckpointLogger: Send + Sync {
    /// Append the begin record; its LSN names the checkpoint.
    fn log_begin_checkpoint(&self) -> Result<Lsn>;
    /// Enumerate live transactions into the log, returning how many.
    fn log_open_txns(&self, begin_lsn: Lsn) -> Result<u32>;
    /// Append the end record and force it to disk.
    fn log_end_checkpoint(&self, begin_lsn: Lsn, n_files: u32, n_txns: u32) -> Result<()>;
    /// The checkpoint `lsn` is complete.
    fn note_checkpoint(&self, lsn: Lsn);
}

#[inline]
pub fn crc32_of_parts(head_without_crc: &[u8], payload: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(head_without_crc);
    h.update(payload);
    h.finalize()
}

pub fn generate_log_id() -> u64 {
    use rand::RngCore;
    let mut buf = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    LittleEndian::read_u64(&buf)
}

pub fn write_log_file_header(f: &mut File, log_id: u64) -> Result<()> {
    f.seek(SeekFrom::Start(0))?;
    f.write_all(LOG_MAGIC)?;
    let mut id = [0u8; 8];
    LittleEndian::write_u64(&mut id, log_id);
    f.write_all(&id)?;
    Ok(())
}

/// Validate the magic and return the log id.
pub fn read_log_file_header(f: &mut File) -> Result<u64> {
    if f.metadata().context("checkpoint log metadata")?.len() < LOG_HDR_SIZE as u64 {
        anyhow::bail!("checkpoint log too small (< header)");
    }
    let mut hdr = [0u8; LOG_HDR_SIZE];
    f.seek(SeekFrom::Start(0))?;
    f.read_exact(&mut hdr)?;
    if &hdr[..8] != LOG_MAGIC {
        anyhow::bail!("bad checkpoint log magic");
    }
    Ok(LittleEndian::read_u64(&hdr[LOG_HDR_OFF_ID..LOG_HDR_OFF_ID + 8]))
}

pub mod encode;
pub mod reader;
pub mod writer;

pub use reader::{LogReader, LogRecord};
pub use writer::FileCheckpointLog;
