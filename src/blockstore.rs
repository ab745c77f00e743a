//! FileBlockStore: эталонные callbacks поверх cache file.
//!
//! Блок ключа `k` лежит по смещению `k * block_size`:
//! `[len u32][crc32 u32][data][нули до block_size]` (LE). Слот за концом
//! файла или с нулевым заголовком: ещё не записанный блок (пустой).
//! Несовпадение CRC при чтении: ошибка.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cachetable::{
    CacheKey, CleanerOutcome, ClonedValue, FileCtx, Fetched, FlushArgs, PairAttr, PairLoader, WriteCallbacks,
};

pub const BLOCK_HDR_SIZE: usize = 8;

/// In-memory value of a block pair.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Block {
    pub data: Vec<u8>,
    /// Bytes the cleaner should work off; reported as cache pressure.
    pub pressure: i64,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pressure: 0 }
    }
}

pub struct FileBlockStore {
    block_size: usize,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl FileBlockStore {
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > BLOCK_HDR_SIZE, "block size {} too small", block_size);
        Self { block_size, writes: AtomicU64::new(0), reads: AtomicU64::new(0) }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Largest payload a block can hold.
    pub fn capacity(&self) -> usize {
        self.block_size - BLOCK_HDR_SIZE
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn attr_of(block: &Block) -> PairAttr {
        let size = (block.data.len() + BLOCK_HDR_SIZE) as i64;
        PairAttr { size, leaf_size: size, cache_pressure_size: block.pressure, ..PairAttr::ZERO }
    }

    /// Byte offset of the block; the whole block must fit in a u64 offset.
    fn offset(&self, key: CacheKey) -> Result<u64> {
        let bs = self.block_size as u64;
        key.checked_mul(bs)
            .filter(|off| off.checked_add(bs).is_some())
            .ok_or_else(|| anyhow!("block key {} out of range for block size {}", key, self.block_size))
    }

    pub fn write_block(&self, file: &File, key: CacheKey, block: &Block) -> Result<()> {
        if block.data.len() > self.capacity() {
            return Err(anyhow!("block {} holds {} bytes, capacity {}", key, block.data.len(), self.capacity()));
        }
        let mut buf = vec![0u8; self.block_size];
        LittleEndian::write_u32(&mut buf[0..4], block.data.len() as u32);
        LittleEndian::write_u32(&mut buf[4..8], crc32fast::hash(&block.data));
        buf[BLOCK_HDR_SIZE..BLOCK_HDR_SIZE + block.data.len()].copy_from_slice(&block.data);
        write_at(file, &buf, self.offset(key)?).with_context(|| format!("write block {}", key))?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn read_block(&self, file: &File, key: CacheKey) -> Result<Block> {
        let off = self.offset(key)?;
        let len = file.metadata().context("block file metadata")?.len();
        self.reads.fetch_add(1, Ordering::Relaxed);
        if off + BLOCK_HDR_SIZE as u64 > len {
            return Ok(Block::default());
        }
        let mut hdr = [0u8; BLOCK_HDR_SIZE];
        read_at(file, &mut hdr, off).with_context(|| format!("read block {} header", key))?;
        let n = LittleEndian::read_u32(&hdr[0..4]) as usize;
        let crc = LittleEndian::read_u32(&hdr[4..8]);
        if n == 0 && crc == 0 {
            return Ok(Block::default());
        }
        if n > self.capacity() {
            return Err(anyhow!("block {}: length {} exceeds capacity {}", key, n, self.capacity()));
        }
        let mut data = vec![0u8; n];
        read_at(file, &mut data, off + BLOCK_HDR_SIZE as u64).with_context(|| format!("read block {}", key))?;
        let calc = crc32fast::hash(&data);
        if calc != crc {
            return Err(anyhow!("block {} checksum mismatch (stored={:08x}, calc={:08x})", key, crc, calc));
        }
        Ok(Block::new(data))
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], off: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, off)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], off: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, off)
}

#[cfg(windows)]
fn read_at(file: &File, mut buf: &mut [u8], mut off: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, off)? {
            0 => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut buf[n..];
                off += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_at(file: &File, mut buf: &[u8], mut off: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, off)?;
        buf = &buf[n..];
        off += n as u64;
    }
    Ok(())
}

impl WriteCallbacks<Block> for FileBlockStore {
    fn flush(&self, args: FlushArgs<'_, Block>) -> Result<Option<PairAttr>> {
        if args.write_me {
            self.write_block(args.file.file(), args.key, args.value)?;
        }
        if !args.keep_me {
            args.value.data = Vec::new();
            *args.disk_data = None;
            return Ok(None);
        }
        let attr = Self::attr_of(args.value);
        Ok(if attr != args.old_attr { Some(attr) } else { None })
    }

    fn supports_clone(&self) -> bool {
        true
    }

    fn clone_value(&self, value: &mut Block, _for_checkpoint: bool) -> Result<ClonedValue<Block>> {
        let clone = value.clone();
        let size = (clone.data.len() + BLOCK_HDR_SIZE) as i64;
        Ok(ClonedValue { value: clone, size, new_attr: None })
    }

    fn cleaner(&self, value: &mut Block, _key: CacheKey, _fullhash: u32) -> Result<CleanerOutcome> {
        value.pressure = 0;
        Ok(CleanerOutcome { dirty: true, new_attr: Some(Self::attr_of(value)) })
    }
}

impl PairLoader<Block> for FileBlockStore {
    fn fetch(&self, file: &FileCtx, key: CacheKey, _fullhash: u32) -> Result<Fetched<Block>> {
        let block = self
            .read_block(file.file(), key)
            .with_context(|| format!("fetch from {}", file.path().display()))?;
        let attr = Self::attr_of(&block);
        Ok(Fetched { value: block, disk_data: None, attr, dirty: false })
    }
}
