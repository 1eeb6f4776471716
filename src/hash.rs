//! Key hashing for bucket selection.
//!
//! Build and probe must land every key in the same bucket, across calls and
//! across process runs, so the hash is a fixed-seed MurmurHash2 over the raw
//! little-endian bytes of the join column.

/// Seed used for every join-key hash.
pub const SEED: u32 = 0;

/// 32-bit MurmurHash2 (Austin Appleby).
///
/// Blocks are read little-endian so the result does not depend on the host.
#[inline]
pub fn murmurhash2(key: &[u8], seed: u32) -> u32 {
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = seed ^ key.len() as u32;

    let mut blocks = key.chunks_exact(4);
    for block in &mut blocks {
        let mut k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);

        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = blocks.remainder();
    if tail.len() == 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Bucket for a join key's raw bytes in a table of `nbuckets` buckets.
#[inline(always)]
pub fn bucket_of(key: &[u8], nbuckets: usize) -> usize {
    debug_assert!(nbuckets > 0);
    murmurhash2(key, SEED) as usize % nbuckets
}
