//! Bloom filters for column values
//!
//! Every non-dict column carries a filter over the tokens of its values, so a
//! search for a word can skip blocks that definitely do not contain it.

use std::collections::HashSet;

use crate::encoding::decode_err;
use crate::error::Result;

/// Filter bits reserved per distinct token
const BITS_PER_ITEM: usize = 16;

/// Probe positions per token: `h_i(x) = xxhash64(x, seed=i) % size_bits`
const HASHES_COUNT: u64 = 6;

/// Split `s` into maximal runs of alphanumeric or `_` characters
pub fn tokenize(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
}

/// Unique token hashes of all `values`, in first-seen order
pub fn tokenize_hashes<S: AsRef<str>>(values: &[S]) -> Vec<u64> {
    let mut seen = HashSet::new();
    let mut hashes = Vec::new();
    for v in values {
        for token in tokenize(v.as_ref()) {
            if seen.insert(token) {
                hashes.push(xxhash_rust::xxh64::xxh64(token.as_bytes(), 0));
            }
        }
    }
    hashes
}

/// Bloom filter over token hashes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u64>,
}

impl BloomFilter {
    /// Build a filter sized for `hashes`
    pub fn from_hashes(hashes: &[u64]) -> Self {
        let words = (hashes.len() * BITS_PER_ITEM).div_ceil(64);
        let mut bf = Self {
            bits: vec![0u64; words],
        };
        for &h in hashes {
            bf.insert_hash(h);
        }
        bf
    }

    /// Build a filter over the tokens of `values`
    pub fn from_values<S: AsRef<str>>(values: &[S]) -> Self {
        Self::from_hashes(&tokenize_hashes(values))
    }

    fn insert_hash(&mut self, h: u64) {
        let num_bits = (self.bits.len() * 64) as u64;
        let key = h.to_be_bytes();
        for seed in 0..HASHES_COUNT {
            let bit_idx = xxhash_rust::xxh64::xxh64(&key, seed) % num_bits;
            self.bits[(bit_idx / 64) as usize] |= 1u64 << (bit_idx % 64);
        }
    }

    fn contains_hash(&self, h: u64) -> bool {
        if self.bits.is_empty() {
            return false;
        }
        let num_bits = (self.bits.len() * 64) as u64;
        let key = h.to_be_bytes();
        (0..HASHES_COUNT).all(|seed| {
            let bit_idx = xxhash_rust::xxh64::xxh64(&key, seed) % num_bits;
            self.bits[(bit_idx / 64) as usize] & (1u64 << (bit_idx % 64)) != 0
        })
    }

    /// `false` means at least one token is definitely absent
    pub fn contains_all<S: AsRef<str>>(&self, tokens: &[S]) -> bool {
        tokens.iter().all(|t| {
            let h = xxhash_rust::xxh64::xxh64(t.as_ref().as_bytes(), 0);
            self.contains_hash(h)
        })
    }

    pub fn marshal(&self, dst: &mut Vec<u8>) {
        for w in &self.bits {
            dst.extend_from_slice(&w.to_be_bytes());
        }
    }

    pub fn unmarshal(src: &[u8]) -> Result<Self> {
        if src.len() % 8 != 0 {
            return Err(decode_err(format!(
                "bloom filter size must be a multiple of 8; got {} bytes",
                src.len()
            )));
        }
        let bits = src
            .chunks_exact(8)
            .map(|c| c.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
            .collect();
        Ok(Self { bits })
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}
