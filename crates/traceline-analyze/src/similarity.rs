//! MinHash signatures and locality-sensitive hashing for near-duplicate
//! detection over event text.
//!
//! Signatures are deterministic: each permutation hashes a shingle with a
//! fixed per-permutation seed, so two runs over the same data always agree.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

/// Split text into its shingle set on the given delimiters.
#[must_use]
pub fn shingles(text: &str, delimiters: &[char]) -> HashSet<String> {
    text.split(|c: char| delimiters.contains(&c))
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
        .collect()
}

fn seeded_hash(seed: u64, shingle: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    shingle.hash(&mut hasher);
    hasher.finish()
}

/// MinHash signature generator with a fixed permutation count.
pub struct MinHasher {
    seeds: Vec<u64>,
}

impl MinHasher {
    /// Generator with `num_perm` permutations.
    #[must_use]
    pub fn new(num_perm: usize) -> Self {
        // SplitMix-style seed expansion; fixed constants keep signatures
        // stable across runs and hosts.
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        let seeds = (0..num_perm)
            .map(|_| {
                state = state
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                state
            })
            .collect();
        Self { seeds }
    }

    /// Signature of a shingle set. An empty set signs as all-max, which
    /// never collides with a non-empty signature band.
    #[must_use]
    pub fn signature(&self, shingles: &HashSet<String>) -> Vec<u64> {
        self.seeds
            .iter()
            .map(|&seed| {
                shingles
                    .iter()
                    .map(|shingle| seeded_hash(seed, shingle))
                    .min()
                    .unwrap_or(u64::MAX)
            })
            .collect()
    }
}

/// Estimated Jaccard similarity of two signatures.
#[must_use]
pub fn jaccard_estimate(a: &[u64], b: &[u64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let matching = a.iter().zip(b).filter(|(x, y)| x == y).count();
    matching as f64 / a.len() as f64
}

/// Band count and rows-per-band whose S-curve threshold sits closest to
/// the requested similarity threshold.
fn optimal_bands(num_perm: usize, threshold: f64) -> (usize, usize) {
    let mut best = (1, num_perm);
    let mut best_error = f64::MAX;
    for bands in 1..=num_perm {
        if num_perm % bands != 0 {
            continue;
        }
        let rows = num_perm / bands;
        let curve_threshold = (1.0 / bands as f64).powf(1.0 / rows as f64);
        let error = (curve_threshold - threshold).abs();
        if error < best_error {
            best_error = error;
            best = (bands, rows);
        }
    }
    best
}

/// LSH index over MinHash signatures.
pub struct LshIndex {
    bands: usize,
    rows: usize,
    buckets: HashMap<(usize, u64), Vec<usize>>,
}

impl LshIndex {
    /// Index tuned for the given permutation count and similarity
    /// threshold.
    #[must_use]
    pub fn new(num_perm: usize, threshold: f64) -> Self {
        let (bands, rows) = optimal_bands(num_perm, threshold);
        Self {
            bands,
            rows,
            buckets: HashMap::new(),
        }
    }

    fn band_key(&self, band: usize, signature: &[u64]) -> (usize, u64) {
        let mut hasher = DefaultHasher::new();
        signature[band * self.rows..(band + 1) * self.rows].hash(&mut hasher);
        (band, hasher.finish())
    }

    /// Index one signature under a caller-chosen id.
    pub fn insert(&mut self, id: usize, signature: &[u64]) {
        for band in 0..self.bands {
            let key = self.band_key(band, signature);
            self.buckets.entry(key).or_default().push(id);
        }
    }

    /// Ids whose signature collides with this one in at least one band.
    /// Includes the queried id itself when it was inserted.
    #[must_use]
    pub fn query(&self, signature: &[u64]) -> HashSet<usize> {
        let mut candidates = HashSet::new();
        for band in 0..self.bands {
            if let Some(bucket) = self.buckets.get(&self.band_key(band, signature)) {
                candidates.extend(bucket.iter().copied());
            }
        }
        candidates
    }
}
