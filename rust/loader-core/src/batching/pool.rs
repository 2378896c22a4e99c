// rust/loader-core/src/batching/pool.rs

use std::collections::VecDeque;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use super::assembler::{AssemblerConfig, DynamicBatchAssembler};
use super::batch::Batch;
use super::cost::{CostFunction, SortKey};
use crate::dataset::Example;
use crate::error::{LoaderError, Result};

/// Super-batches hold this many times the per-rank target cost.
pub const POOL_FACTOR: usize = 100;

/// Reorders the batches cut from one super-batch.
pub trait Shuffler: Send {
    fn shuffle(&mut self, batches: &mut [Batch]);
}

/// Shuffles with a seeded `StdRng`, so every rank sees the same order.
pub struct SeededShuffler {
    rng: StdRng,
}

impl SeededShuffler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Shuffler for one epoch. Replaying an epoch reproduces its order.
    pub fn for_epoch(seed: u64, epoch: u64) -> Self {
        Self::new(seed.wrapping_add(epoch))
    }
}

impl Shuffler for SeededShuffler {
    fn shuffle(&mut self, batches: &mut [Batch]) {
        batches.shuffle(&mut self.rng);
    }
}

/// Keeps batches in sort order.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoShuffle;

impl Shuffler for NoShuffle {
    fn shuffle(&mut self, _batches: &mut [Batch]) {}
}

/// Two-level bucketing over a stream of examples.
///
/// The input is first cut into super-batches worth `target_cost * 100` on a
/// single rank. Each super-batch is stable-sorted by the sort key and cut
/// again at the real target, with reserve mode on, so that examples of
/// similar length share a batch. The batches from one super-batch are then
/// shuffled and yielded.
pub struct BucketedShufflePool<I> {
    outer: DynamicBatchAssembler<I>,
    cost: Arc<dyn CostFunction>,
    sort_key: Arc<dyn SortKey>,
    inner: AssemblerConfig,
    shuffler: Box<dyn Shuffler>,
    pending: VecDeque<Batch>,
    pools: u64,
}

impl<I> BucketedShufflePool<I>
where
    I: Iterator<Item = Result<Example>>,
{
    /// Create a new pool over `input`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `target_cost` or `world_size` is zero,
    /// or the super-batch bound overflows.
    pub fn new(
        input: I,
        cost: Arc<dyn CostFunction>,
        sort_key: Arc<dyn SortKey>,
        target_cost: usize,
        world_size: usize,
        shuffler: Box<dyn Shuffler>,
    ) -> Result<Self> {
        let pool_cost = target_cost
            .checked_mul(POOL_FACTOR)
            .ok_or_else(|| LoaderError::config("pool target cost overflows"))?;

        let outer = DynamicBatchAssembler::new(
            input,
            Arc::clone(&cost),
            AssemblerConfig {
                target_cost: pool_cost,
                world_size: 1,
                reserve: false,
            },
        )?;
        let inner = AssemblerConfig {
            target_cost,
            world_size,
            reserve: true,
        };
        inner.bound()?;

        Ok(Self {
            outer,
            cost,
            sort_key,
            inner,
            shuffler,
            pending: VecDeque::new(),
            pools: 0,
        })
    }

    /// Returns the next batch, refilling from the next super-batch as needed.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        loop {
            if let Some(batch) = self.pending.pop_front() {
                return Ok(Some(batch));
            }

            let Some(pool) = self.outer.next_batch()? else {
                return Ok(None);
            };
            self.refill(pool)?;
        }
    }

    fn refill(&mut self, pool: Batch) -> Result<()> {
        let pool_len = pool.len();
        let mut examples = pool.examples;
        let sort_key = &self.sort_key;
        examples.sort_by_cached_key(|e| sort_key.key(e));

        let assembler = DynamicBatchAssembler::new(
            examples.into_iter().map(Ok),
            Arc::clone(&self.cost),
            self.inner,
        )?;
        let mut batches = assembler.collect::<Result<Vec<_>>>()?;
        self.shuffler.shuffle(&mut batches);

        self.pools += 1;
        debug!(
            "Super-batch {} of {} examples cut into {} batches",
            self.pools,
            pool_len,
            batches.len()
        );

        self.pending.extend(batches);
        Ok(())
    }
}

impl<I> Iterator for BucketedShufflePool<I>
where
    I: Iterator<Item = Result<Example>>,
{
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batching::cost::{CountCost, InterleavedLengths, TokenSumCost};
    use crate::dataset::TokenSeq;

    fn example(line: u64, len: usize) -> Example {
        Example::new(line, vec![TokenSeq::Flat(vec!["w".to_string(); len])])
    }

    fn corpus(n: u64) -> Vec<Example> {
        (0..n).map(|i| example(i, (i * 7 % 5) as usize + 1)).collect()
    }

    fn pool(
        examples: Vec<Example>,
        target_cost: usize,
        world_size: usize,
        shuffler: Box<dyn Shuffler>,
    ) -> Vec<Batch> {
        BucketedShufflePool::new(
            examples.into_iter().map(Ok),
            Arc::new(TokenSumCost),
            Arc::new(InterleavedLengths),
            target_cost,
            world_size,
            shuffler,
        )
        .unwrap()
        .map(|b| b.unwrap())
        .collect()
    }

    fn lines(batches: &[Batch]) -> Vec<u64> {
        batches.iter().flat_map(|b| b.iter().map(|e| e.line)).collect()
    }

    #[test]
    fn test_unshuffled_pool_is_sorted() {
        let examples = corpus(40);
        let batches = pool(examples.clone(), 6, 1, Box::new(NoShuffle));

        // Stable sort by length; the first (reserved) example closes the
        // last batch.
        let mut sorted = examples;
        sorted.sort_by_key(Example::max_len);
        let mut expected: Vec<u64> = sorted.iter().map(|e| e.line).collect();
        let reserved = expected.remove(0);
        expected.push(reserved);

        assert_eq!(lines(&batches), expected);
    }

    #[test]
    fn test_every_example_once() {
        let batches = pool(corpus(53), 4, 2, Box::new(SeededShuffler::new(7)));

        let mut got = lines(&batches);
        got.sort_unstable();
        assert_eq!(got, (0..53).collect::<Vec<_>>());
        assert!(batches.iter().all(|b| b.len() >= 2));
    }

    #[test]
    fn test_seeded_shuffle_is_reproducible() {
        let a = pool(corpus(60), 5, 2, Box::new(SeededShuffler::new(42)));
        let b = pool(corpus(60), 5, 2, Box::new(SeededShuffler::new(42)));
        assert_eq!(a, b);

        let mut shuffled = a.clone();
        let mut plain = pool(corpus(60), 5, 2, Box::new(NoShuffle));
        shuffled.sort_by_key(|b| b.examples[0].line);
        plain.sort_by_key(|b| b.examples[0].line);
        assert_eq!(shuffled, plain);
    }

    #[test]
    fn test_epoch_shufflers_differ() {
        let mut batches: Vec<Batch> = (0..20).map(|i| Batch::new(vec![example(i, 1)])).collect();
        let mut other = batches.clone();

        SeededShuffler::for_epoch(3, 0).shuffle(&mut batches);
        SeededShuffler::for_epoch(3, 1).shuffle(&mut other);
        assert_ne!(batches, other);

        let mut again: Vec<Batch> = (0..20).map(|i| Batch::new(vec![example(i, 1)])).collect();
        SeededShuffler::for_epoch(3, 0).shuffle(&mut again);
        assert_eq!(batches, again);
    }

    #[test]
    fn test_pools_are_independent() {
        // Count cost with target 1: each super-batch holds 100 examples.
        let examples = (0..250).map(|i| Ok(example(i, (250 - i) as usize)));
        let pool = BucketedShufflePool::new(
            examples,
            Arc::new(CountCost),
            Arc::new(InterleavedLengths),
            1,
            1,
            Box::new(NoShuffle),
        )
        .unwrap();

        // The first super-batch yields 49 pairs plus the final batch
        let first_pool: Vec<Batch> = pool.take(50).map(|b| b.unwrap()).collect();
        assert!(first_pool.iter().all(|b| b.len() == 2));
        // Sorting never mixes examples across super-batches
        assert!(lines(&first_pool).iter().all(|&line| line < 100));
    }

    #[test]
    fn test_invalid_target() {
        let result = BucketedShufflePool::new(
            std::iter::empty(),
            Arc::new(CountCost),
            Arc::new(InterleavedLengths),
            0,
            1,
            Box::new(NoShuffle),
        );
        assert!(matches!(result, Err(LoaderError::Config { .. })));
    }
}
