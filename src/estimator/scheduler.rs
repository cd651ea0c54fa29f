//! Randomized shard visitation
//!
//! A batch insert visits shards one at a time, holding only that shard's
//! lock. If every batch walked the shards in the same order, one slow batch
//! would stall every batch queued behind it on the same shard. Each batch
//! instead draws a permutation from a precomputed pool, which decorrelates
//! the visitation orders of concurrent batches.
//!
//! The pool is built once per estimator so the per-batch cost is a single
//! random index.

use rand::seq::SliceRandom;
use rand::Rng;

/// Maximum number of shards an estimator can have
pub const MAX_SHARDS: usize = 64;

/// Number of permutations kept in the pool
pub const SEQUENCE_POOL_SIZE: usize = 10_000;

/// Pool of precomputed shard permutations
#[derive(Debug)]
pub struct InsertSequences {
    shards: usize,
    sequences: Vec<Vec<u8>>,
}

impl InsertSequences {
    /// Build a pool of [`SEQUENCE_POOL_SIZE`] permutations of `[0, shards)`
    pub fn new(shards: usize) -> Self {
        Self::with_pool_size(shards, SEQUENCE_POOL_SIZE)
    }

    /// Build a pool with an explicit number of permutations
    ///
    /// # Panics
    /// Panics if `shards` is zero or larger than [`MAX_SHARDS`], or if
    /// `pool_size` is zero.
    pub fn with_pool_size(shards: usize, pool_size: usize) -> Self {
        assert!(
            shards > 0 && shards <= MAX_SHARDS,
            "BUG: shard count must be in 1..={}, got {}",
            MAX_SHARDS,
            shards
        );
        assert!(pool_size > 0, "BUG: sequence pool must not be empty");

        let mut rng = rand::rng();
        let identity: Vec<u8> = (0..shards as u8).collect();
        let sequences = (0..pool_size)
            .map(|_| {
                let mut seq = identity.clone();
                seq.shuffle(&mut rng);
                seq
            })
            .collect();

        Self { shards, sequences }
    }

    /// Number of shards each permutation covers
    pub fn shards(&self) -> usize {
        self.shards
    }

    /// Iterator over a randomly chosen permutation
    pub fn random_iter(&self) -> RandomShardIterator<'_> {
        let idx = rand::rng().random_range(0..self.sequences.len());
        RandomShardIterator {
            sequence: &self.sequences[idx],
            pos: 0,
        }
    }
}

/// Yields every shard index exactly once, in a random order
#[derive(Debug, Clone)]
pub struct RandomShardIterator<'a> {
    sequence: &'a [u8],
    pos: usize,
}

impl Iterator for RandomShardIterator<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let shard = *self.sequence.get(self.pos)?;
        self.pos += 1;
        Some(shard as usize)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.sequence.len() - self.pos;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for RandomShardIterator<'_> {}

/// Fixed-size set of shards touched by a batch
#[derive(Debug, Clone, Copy)]
pub struct ShardMask([bool; MAX_SHARDS]);

impl ShardMask {
    /// Empty mask
    pub fn new() -> Self {
        Self([false; MAX_SHARDS])
    }

    /// Flag a shard
    #[inline]
    pub fn set(&mut self, shard: usize) {
        self.0[shard] = true;
    }

    /// Whether a shard is flagged
    #[inline]
    pub fn contains(&self, shard: usize) -> bool {
        self.0[shard]
    }

    /// Whether no shard is flagged
    pub fn is_empty(&self) -> bool {
        !self.0.iter().any(|&b| b)
    }
}

impl Default for ShardMask {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iterator_visits_every_shard_once() {
        for shards in 1..=MAX_SHARDS {
            let sequences = InsertSequences::with_pool_size(shards, 64);
            for _ in 0..100 {
                let mut visited: Vec<usize> = sequences.random_iter().collect();
                assert_eq!(visited.len(), shards);
                visited.sort_unstable();
                assert_eq!(visited, (0..shards).collect::<Vec<_>>());
            }
        }
    }

    #[test]
    fn test_orders_vary() {
        let sequences = InsertSequences::new(MAX_SHARDS);
        let first: Vec<usize> = sequences.random_iter().collect();
        let differs = (0..50).any(|_| sequences.random_iter().collect::<Vec<_>>() != first);
        assert!(differs);
    }

    #[test]
    fn test_exact_size() {
        let sequences = InsertSequences::with_pool_size(8, 4);
        let mut iter = sequences.random_iter();
        assert_eq!(iter.len(), 8);
        iter.next();
        assert_eq!(iter.len(), 7);
    }

    #[test]
    fn test_shard_mask() {
        let mut mask = ShardMask::new();
        assert!(mask.is_empty());
        mask.set(63);
        assert!(mask.contains(63));
        assert!(!mask.contains(0));
        assert!(!mask.is_empty());
    }

    #[test]
    #[should_panic(expected = "shard count")]
    fn test_too_many_shards() {
        InsertSequences::with_pool_size(MAX_SHARDS + 1, 1);
    }
}
