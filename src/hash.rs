//! Stable hashing of (file, key) for the pair table.
//!
//! Goals:
//! - Use an explicit hash (not std::DefaultHasher) so bucket placement does not
//!   drift across toolchains/platforms.
//! - Callers compute the fullhash once and pass it to every lookup; the table
//!   only masks it down to its current size.

use std::hash::Hasher;
use twox_hash::XxHash64;

use crate::cachetable::{CacheKey, FileNum};

const FULLHASH_SEED: u64 = 0x5A17_C0DE_9E37_79B9;

/// 32-bit hash of (filenum, key). Bytes are fed little-endian explicitly.
#[inline]
pub fn fullhash(filenum: FileNum, key: CacheKey) -> u32 {
    let mut h = XxHash64::with_seed(FULLHASH_SEED);
    h.write(&filenum.0.to_le_bytes());
    h.write(&key.to_le_bytes());
    let x = h.finish();
    (x ^ (x >> 32)) as u32
}

/// Bucket index for a fullhash in a power-of-two table.
#[inline]
pub(crate) fn bucket_of(fullhash: u32, table_size: usize) -> usize {
    debug_assert!(table_size.is_power_of_two());
    (fullhash as usize) & (table_size - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fullhash_is_deterministic() {
        let a = fullhash(FileNum(1), 42);
        let b = fullhash(FileNum(1), 42);
        assert_eq!(a, b);
    }

    #[test]
    fn fullhash_depends_on_file_and_key() {
        let base = fullhash(FileNum(1), 42);
        assert_ne!(base, fullhash(FileNum(2), 42));
        assert_ne!(base, fullhash(FileNum(1), 43));
    }

    #[test]
    fn bucket_masks_to_table_size() {
        for size in [4usize, 8, 1024] {
            for key in 0..256u64 {
                let b = bucket_of(fullhash(FileNum(3), key), size);
                assert!(b < size);
            }
        }
    }
}
