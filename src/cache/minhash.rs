//! MinHash signatures and the LSH band index behind fuzzy lookup.
//!
//! Each stored prompt gets a K-element signature (element-wise minimum of K
//! universal hash functions over its word shingles). The signature is split
//! into B bands of R rows; any shared band hash makes two prompts LSH
//! candidates. False positives are rejected later by the exact Dice check;
//! false negatives occur below the capture probability implied by (K, B).

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

/// K: total hash permutations.
pub const NUM_PERMUTATIONS: usize = 128;
/// B: bands per signature. R = K / B rows each.
pub const NUM_BANDS: usize = 32;
/// R: rows per band.
pub const ROWS_PER_BAND: usize = NUM_PERMUTATIONS / NUM_BANDS;
/// Character shingle length. Character shingles keep short prompts
/// comparable; word shingles would leave one-line prompts with a single
/// degenerate shingle.
const SHINGLE_CHARS: usize = 3;

/// Mersenne prime 2^61 - 1 for universal hashing.
const UNIVERSAL_PRIME: u128 = (1 << 61) - 1;
/// Fixed seed so signatures are stable across processes and restarts.
const PERMUTATION_SEED: u64 = 0x5141_9f6c_2b7a_8d03;

/// splitmix64; deterministic parameter stream for the hash family.
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// The fixed (a, b) parameter family shared by every cache instance.
static PERMUTATIONS: LazyLock<Vec<(u64, u64)>> = LazyLock::new(|| {
    let mut state = PERMUTATION_SEED;
    (0..NUM_PERMUTATIONS)
        .map(|_| {
            // a must be non-zero for the family to be universal
            let a = splitmix64(&mut state) | 1;
            let b = splitmix64(&mut state);
            (a, b)
        })
        .collect()
});

/// FNV-1a 64 base hash of one shingle.
fn fnv1a(text: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn universal(x: u64, a: u64, b: u64) -> u32 {
    let value = (u128::from(a) * u128::from(x) + u128::from(b)) % UNIVERSAL_PRIME;
    (value & 0xffff_ffff) as u32
}

/// Character shingles of the normalized text. Texts shorter than the
/// shingle length contribute themselves as a single shingle; empty text
/// yields none.
fn shingles(normalized: &str) -> Vec<u64> {
    let chars: Vec<char> = normalized.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    if chars.len() < SHINGLE_CHARS {
        return vec![fnv1a(normalized)];
    }
    chars
        .windows(SHINGLE_CHARS)
        .map(|w| fnv1a(&w.iter().collect::<String>()))
        .collect()
}

/// K-element MinHash signature, or `None` for empty text.
pub fn signature(normalized: &str) -> Option<Vec<u32>> {
    let shingle_hashes = shingles(normalized);
    if shingle_hashes.is_empty() {
        return None;
    }
    let mut sig = vec![u32::MAX; NUM_PERMUTATIONS];
    for &shingle in &shingle_hashes {
        for (slot, &(a, b)) in sig.iter_mut().zip(PERMUTATIONS.iter()) {
            let h = universal(shingle, a, b);
            if h < *slot {
                *slot = h;
            }
        }
    }
    Some(sig)
}

/// Collapse a signature into B band hashes.
pub fn bands(signature: &[u32]) -> Vec<u32> {
    signature
        .chunks(ROWS_PER_BAND)
        .map(|rows| {
            let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
            for &row in rows {
                for byte in row.to_le_bytes() {
                    hash ^= u64::from(byte);
                    hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
                }
            }
            (hash & 0xffff_ffff) as u32
        })
        .collect()
}

/// Convenience: bands of a normalized prompt, `None` when empty.
pub fn prompt_bands(normalized: &str) -> Option<Vec<u32>> {
    signature(normalized).map(|sig| bands(&sig))
}

/// Maps each (band index, band hash) bucket to the entry keys containing it.
#[derive(Default)]
pub struct LshIndex {
    buckets: HashMap<(u32, u32), HashSet<String>>,
    entry_bands: HashMap<String, Vec<u32>>,
}

impl LshIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, band_hashes: Vec<u32>) {
        self.remove(key);
        for (idx, &hash) in band_hashes.iter().enumerate() {
            self.buckets
                .entry((idx as u32, hash))
                .or_default()
                .insert(key.to_string());
        }
        self.entry_bands.insert(key.to_string(), band_hashes);
    }

    pub fn remove(&mut self, key: &str) {
        if let Some(band_hashes) = self.entry_bands.remove(key) {
            for (idx, hash) in band_hashes.into_iter().enumerate() {
                if let Some(bucket) = self.buckets.get_mut(&(idx as u32, hash)) {
                    bucket.remove(key);
                    if bucket.is_empty() {
                        self.buckets.remove(&(idx as u32, hash));
                    }
                }
            }
        }
    }

    /// Union of entry keys sharing at least one band with the probe.
    pub fn candidates(&self, band_hashes: &[u32]) -> HashSet<String> {
        let mut found = HashSet::new();
        for (idx, &hash) in band_hashes.iter().enumerate() {
            if let Some(bucket) = self.buckets.get(&(idx as u32, hash)) {
                found.extend(bucket.iter().cloned());
            }
        }
        found
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.entry_bands.clear();
    }

    pub fn len(&self) -> usize {
        self.entry_bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_bands.is_empty()
    }
}
