//! Bloom filter block.
//!
//! Keys added here are user keys; the filter answers "definitely absent"
//! or "possibly present" for point lookups before any data block is read.

use bytes::{BufMut, Bytes, BytesMut};

/// Immutable bloom filter decoded from a filter block.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    /// Number of hash probes.
    k: u32,
}

impl BloomFilter {
    /// Decode a filter block. The final byte stores the probe count.
    pub fn from_bytes(data: Bytes) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }

        let k = data[data.len() - 1] as u32;
        if k == 0 || k > 30 {
            return None;
        }

        Some(Self {
            bits: data[..data.len() - 1].to_vec(),
            k,
        })
    }

    /// False means the key is definitely not in the table.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        if self.bits.is_empty() {
            return false;
        }

        let bits_len = self.bits.len() * 8;
        let mut h = bloom_hash(key);
        let delta = h.rotate_right(17);

        for _ in 0..self.k {
            let bit_pos = h as usize % bits_len;
            if self.bits[bit_pos / 8] & (1 << (bit_pos % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}

/// Accumulates user keys for one table's filter block.
pub struct BloomFilterBuilder {
    bits_per_key: usize,
    k: u32,
    keys: Vec<Bytes>,
}

impl BloomFilterBuilder {
    pub fn new(bits_per_key: usize) -> Self {
        // k = bits_per_key * ln(2), clamped to a sane probe count.
        let k = ((bits_per_key as f64 * 0.69) as u32).clamp(1, 30);
        Self {
            bits_per_key,
            k,
            keys: Vec::new(),
        }
    }

    /// Add one user key. The bytes are copied; the caller's buffer is
    /// never touched.
    pub fn add(&mut self, user_key: &[u8]) {
        self.keys.push(Bytes::copy_from_slice(user_key));
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Encode the filter block.
    pub fn finish(&self) -> Bytes {
        if self.keys.is_empty() {
            return Bytes::new();
        }

        let mut bits_count = self.keys.len() * self.bits_per_key;
        if bits_count < 64 {
            bits_count = 64;
        }
        let bytes_count = (bits_count + 7) / 8;
        let bits_count = bytes_count * 8;

        let mut bits = vec![0u8; bytes_count];
        for key in &self.keys {
            let mut h = bloom_hash(key);
            let delta = h.rotate_right(17);
            for _ in 0..self.k {
                let bit_pos = h as usize % bits_count;
                bits[bit_pos / 8] |= 1 << (bit_pos % 8);
                h = h.wrapping_add(delta);
            }
        }

        let mut out = BytesMut::with_capacity(bytes_count + 1);
        out.put_slice(&bits);
        out.put_u8(self.k as u8);
        out.freeze()
    }
}

/// Murmur-style hash used by the filter.
fn bloom_hash(data: &[u8]) -> u32 {
    const SEED: u32 = 0xbc9f1d34;
    const M: u32 = 0xc6a4a793;

    let mut h = SEED ^ (data.len() as u32).wrapping_mul(M);
    let mut chunks = data.chunks_exact(4);

    for chunk in &mut chunks {
        let w = u32::from_le_bytes(chunk.try_into().unwrap());
        h = h.wrapping_add(w).wrapping_mul(M);
        h ^= h >> 16;
    }

    let rest = chunks.remainder();
    if !rest.is_empty() {
        for (i, &b) in rest.iter().enumerate() {
            h = h.wrapping_add((b as u32) << (8 * i));
        }
        h = h.wrapping_mul(M);
        h ^= h >> 24;
    }
    h
}
