//! Bloom filter over rule domains.
//!
//! Sized from the expected element count `n` and target false positive rate
//! `ε`:
//!
//! ```text
//! m = ceil(-n * ln(ε) / ln(2)^2)
//! k = round(m / n * ln(2))
//! ```
//!
//! Positions come from double hashing of two independent 64-bit hashes
//! (`h1 + i * h2 mod m`), each a SipHash-1-3 with its own fixed keys. The
//! filter is append-only.

use std::hash::Hasher;

use siphasher::sip::SipHasher13;

const MIN_BITS: usize = 64;
const MAX_HASHES: u32 = 16;

const H1_KEYS: (u64, u64) = (0x736f6d6570736575, 0x646f72616e646f6d);
const H2_KEYS: (u64, u64) = (0x6c7967656e657261, 0x7465646279746573);

pub struct BloomFilter {
    bits: Vec<u64>,
    m: u64,
    k: u32,
    n: usize,
    target_fpr: f64,
}

impl BloomFilter {
    /// Create a filter sized for `expected` elements at false positive rate `fpr`.
    pub fn with_rate(expected: usize, fpr: f64) -> Self {
        let fpr = fpr.clamp(f64::MIN_POSITIVE, 0.5);
        let n = expected.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;

        let m = (-n * fpr.ln() / (ln2 * ln2)).ceil() as usize;
        let m = m.max(MIN_BITS).next_multiple_of(64);
        let k = ((m as f64 / n) * ln2).round() as u32;

        Self {
            bits: vec![0; m / 64],
            m: m as u64,
            k: k.clamp(1, MAX_HASHES),
            n: 0,
            target_fpr: fpr,
        }
    }

    pub fn insert(&mut self, item: &str) {
        let (h1, h2) = hash_pair(item);
        for i in 0..self.k as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.m;
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
        self.n += 1;
    }

    /// `false` means definitely absent; `true` means possibly present.
    #[inline]
    pub fn contains(&self, item: &str) -> bool {
        let (h1, h2) = hash_pair(item);
        (0..self.k as u64).all(|i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.m;
            self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0
        })
    }

    pub fn size_bits(&self) -> u64 {
        self.m
    }

    pub fn hash_count(&self) -> u32 {
        self.k
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn target_fpr(&self) -> f64 {
        self.target_fpr
    }

    /// Expected false positive rate at the current fill: `(1 - e^(-kn/m))^k`.
    pub fn estimated_fpr(&self) -> f64 {
        let k = self.k as f64;
        let exponent = -k * self.n as f64 / self.m as f64;
        (1.0 - exponent.exp()).powf(k)
    }
}

#[inline]
fn sip(keys: (u64, u64), item: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(keys.0, keys.1);
    hasher.write(item.as_bytes());
    hasher.finish()
}

#[inline]
fn hash_pair(item: &str) -> (u64, u64) {
    // An even step would cycle through only part of the bit array.
    (sip(H1_KEYS, item), sip(H2_KEYS, item) | 1)
}
