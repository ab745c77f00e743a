//! Построение и запись одного кадра checkpoint log.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::io::Write;

use super::{crc32_of_parts, REC_HDR_SIZE, REC_OFF_CRC32, REC_OFF_LEN, REC_OFF_LSN, REC_OFF_TYPE};
use crate::cachetable::Lsn;

/// Header with the CRC over header[0..crc) + payload filled in.
pub fn build_hdr_with_crc(rec_type: u8, lsn: Lsn, payload: &[u8]) -> [u8; REC_HDR_SIZE] {
    let mut hdr = [0u8; REC_HDR_SIZE];
    hdr[REC_OFF_TYPE] = rec_type;
    LittleEndian::write_u64(&mut hdr[REC_OFF_LSN..REC_OFF_LSN + 8], lsn);
    LittleEndian::write_u32(&mut hdr[REC_OFF_LEN..REC_OFF_LEN + 4], payload.len() as u32);
    let crc = crc32_of_parts(&hdr[..REC_OFF_CRC32], payload);
    LittleEndian::write_u32(&mut hdr[REC_OFF_CRC32..REC_OFF_CRC32 + 4], crc);
    hdr
}

/// Write [header][payload] at the writer's current position.
pub fn write_record<W: Write>(writer: &mut W, rec_type: u8, lsn: Lsn, payload: &[u8]) -> Result<usize> {
    if payload.len() > u32::MAX as usize {
        return Err(anyhow!("payload too large for a log record: {} bytes", payload.len()));
    }
    let hdr = build_hdr_with_crc(rec_type, lsn, payload);
    writer.write_all(&hdr)?;
    if !payload.is_empty() {
        writer.write_all(payload)?;
    }
    Ok(REC_HDR_SIZE + payload.len())
}
