//! BIP37 bloom filters, the value carried by `filterload`.
//!
//! https://github.com/bitcoin/bips/blob/master/bip-0037.mediawiki

use crate::error::{MessageError, MessageResult};
use crate::wire::decode::{read_u32, read_u8, read_var_bytes};
use crate::wire::payload::write_var_bytes;

/// Largest filter a peer accepts, in bytes.
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;

/// Largest number of hash functions a peer accepts.
pub const MAX_HASH_FUNCS: u32 = 50;

/// Largest element accepted by `filteradd`.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

const SEED_MULTIPLIER: u32 = 0xFBA4_C795;
const LN2: f64 = std::f64::consts::LN_2;
const LN2_SQUARED: f64 = LN2 * LN2;

/// How matched outputs update the filter on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomFlags {
    None,
    All,
    PubkeyOnly,
    Other(u8),
}

impl BloomFlags {
    pub fn as_u8(self) -> u8 {
        match self {
            BloomFlags::None => 0,
            BloomFlags::All => 1,
            BloomFlags::PubkeyOnly => 2,
            BloomFlags::Other(v) => v,
        }
    }
}

impl From<u8> for BloomFlags {
    fn from(value: u8) -> Self {
        match value {
            0 => BloomFlags::None,
            1 => BloomFlags::All,
            2 => BloomFlags::PubkeyOnly,
            v => BloomFlags::Other(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    pub data: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: BloomFlags,
}

impl BloomFilter {
    /// Sizes a filter for `elements` entries at the given false positive
    /// rate, clamped to the protocol limits.
    pub fn new(elements: usize, fp_rate: f64, tweak: u32, flags: BloomFlags) -> Self {
        let elements = elements.max(1) as f64;
        let max_bits = (MAX_BLOOM_FILTER_SIZE * 8) as f64;
        let bits = (-1.0 / LN2_SQUARED * elements * fp_rate.ln()).min(max_bits) as usize;
        let size = (bits / 8).max(1);
        let hash_funcs = ((size * 8) as f64 / elements * LN2).min(MAX_HASH_FUNCS as f64) as u32;

        Self {
            data: vec![0u8; size],
            hash_funcs,
            tweak,
            flags,
        }
    }

    /// Wraps raw filter parts, rejecting anything peers would refuse.
    pub fn from_parts(
        data: Vec<u8>,
        hash_funcs: u32,
        tweak: u32,
        flags: BloomFlags,
    ) -> MessageResult<Self> {
        let filter = Self {
            data,
            hash_funcs,
            tweak,
            flags,
        };
        filter.validate()?;
        Ok(filter)
    }

    pub fn validate(&self) -> MessageResult<()> {
        if self.data.len() > MAX_BLOOM_FILTER_SIZE {
            return Err(MessageError::InvalidArgument(format!(
                "Bloom filter is {} bytes, max {MAX_BLOOM_FILTER_SIZE}",
                self.data.len()
            )));
        }
        if self.hash_funcs > MAX_HASH_FUNCS {
            return Err(MessageError::InvalidArgument(format!(
                "Bloom filter uses {} hash functions, max {MAX_HASH_FUNCS}",
                self.hash_funcs
            )));
        }
        Ok(())
    }

    fn bit_index(&self, n: u32, element: &[u8]) -> usize {
        let seed = n.wrapping_mul(SEED_MULTIPLIER).wrapping_add(self.tweak);
        murmur3(seed, element) as usize % (self.data.len() * 8)
    }

    pub fn insert(&mut self, element: &[u8]) {
        if self.data.is_empty() {
            return;
        }
        for n in 0..self.hash_funcs {
            let idx = self.bit_index(n, element);
            self.data[idx >> 3] |= 1 << (idx & 7);
        }
    }

    pub fn contains(&self, element: &[u8]) -> bool {
        if self.data.is_empty() {
            return false;
        }
        (0..self.hash_funcs).all(|n| {
            let idx = self.bit_index(n, element);
            self.data[idx >> 3] & (1 << (idx & 7)) != 0
        })
    }

    pub fn clear(&mut self) {
        self.data.iter_mut().for_each(|b| *b = 0);
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        write_var_bytes(&self.data, out);
        out.extend_from_slice(&self.hash_funcs.to_le_bytes());
        out.extend_from_slice(&self.tweak.to_le_bytes());
        out.push(self.flags.as_u8());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 12);
        self.write_to(&mut out);
        out
    }

    pub(crate) fn read_from(p: &[u8], c: &mut usize) -> MessageResult<Self> {
        let data = read_var_bytes(p, c, "filterload: data")?;
        let hash_funcs = read_u32(p, c)?;
        let tweak = read_u32(p, c)?;
        let flags = BloomFlags::from(read_u8(p, c, "filterload: flags")?);
        Self::from_parts(data, hash_funcs, tweak, flags)
    }
}

/// 32-bit MurmurHash3 (x86 variant).
pub fn murmur3(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut blocks = data.chunks_exact(4);
    for block in &mut blocks {
        let mut k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = blocks.remainder();
    let mut k = 0u32;
    if tail.len() >= 3 {
        k ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        k ^= u32::from(tail[1]) << 8;
    }
    if let Some(&first) = tail.first() {
        k ^= u32::from(first);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
