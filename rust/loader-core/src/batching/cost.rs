// rust/loader-core/src/batching/cost.rs

use std::sync::Arc;

use crate::dataset::Example;
use crate::error::{LoaderError, Result};

/// Measures how much a growing batch would cost.
///
/// `accumulate` is called once per appended example with the number of
/// examples now in the batch (including `example`) and the cost before it was
/// appended. The returned value must never be lower than `so_far`: the
/// assembler defers exactly one example when a batch overshoots, which only
/// bounds the batch if cost grows monotonically.
pub trait CostFunction: Send + Sync {
    fn accumulate(&self, example: &Example, count: usize, so_far: usize) -> usize;

    /// Name of this cost policy
    fn name(&self) -> &'static str {
        "custom"
    }
}

impl<F> CostFunction for F
where
    F: Fn(&Example, usize, usize) -> usize + Send + Sync,
{
    fn accumulate(&self, example: &Example, count: usize, so_far: usize) -> usize {
        self(example, count, so_far)
    }
}

/// Each example costs one.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountCost;

impl CostFunction for CountCost {
    fn accumulate(&self, _example: &Example, count: usize, _so_far: usize) -> usize {
        count
    }

    fn name(&self) -> &'static str {
        "count"
    }
}

/// Running sum of each example's longest field, ignoring padding.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenSumCost;

impl CostFunction for TokenSumCost {
    fn accumulate(&self, example: &Example, _count: usize, so_far: usize) -> usize {
        so_far + example.max_len()
    }

    fn name(&self) -> &'static str {
        "tokens"
    }
}

/// Longest field seen so far times the number of examples.
///
/// Approximates the size of the padded tensor. The previous maximum is
/// recovered from `so_far`, so no state is kept between calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct PaddedTokenCost;

impl CostFunction for PaddedTokenCost {
    fn accumulate(&self, example: &Example, count: usize, so_far: usize) -> usize {
        let prev_max = if count > 1 { so_far / (count - 1) } else { 0 };
        example.max_len().max(prev_max) * count
    }

    fn name(&self) -> &'static str {
        "padded-tokens"
    }
}

/// Running sum of each example's largest character count, for grid fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct GridTokenSumCost;

impl CostFunction for GridTokenSumCost {
    fn accumulate(&self, example: &Example, _count: usize, so_far: usize) -> usize {
        so_far + example.max_total_len()
    }

    fn name(&self) -> &'static str {
        "grid-tokens"
    }
}

/// Parse a cost policy name into a cost function.
///
/// `auto` must be resolved by the caller, see
/// [`BatchingConfig::resolved_cost`](crate::config::BatchingConfig::resolved_cost).
pub fn parse_cost(name: &str) -> Result<Arc<dyn CostFunction>> {
    match name {
        "count" => Ok(Arc::new(CountCost)),
        "tokens" => Ok(Arc::new(TokenSumCost)),
        "padded-tokens" => Ok(Arc::new(PaddedTokenCost)),
        "grid-tokens" => Ok(Arc::new(GridTokenSumCost)),
        _ => Err(LoaderError::config(format!(
            "unknown cost policy: '{}'. Expected 'count', 'tokens', 'padded-tokens', or 'grid-tokens'",
            name
        ))),
    }
}

/// Orders examples for bucketing and within-batch sorting.
pub trait SortKey: Send + Sync {
    fn key(&self, example: &Example) -> u128;
}

impl<F> SortKey for F
where
    F: Fn(&Example) -> u128 + Send + Sync,
{
    fn key(&self, example: &Example) -> u128 {
        self(example)
    }
}

/// Interleaves the bits of every field's token count.
///
/// Each count is clamped to 16 bits and the first field supplies the most
/// significant bit of each pair, so examples of similar shape in all fields
/// sort next to each other. At most eight fields take part.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterleavedLengths;

impl InterleavedLengths {
    const BITS: u32 = 16;
    const MAX_FIELDS: usize = (u128::BITS / Self::BITS) as usize;

    pub fn interleave(lengths: &[usize]) -> u128 {
        let lengths: Vec<u128> = lengths
            .iter()
            .take(Self::MAX_FIELDS)
            .map(|&l| l.min(u16::MAX as usize) as u128)
            .collect();

        let mut key = 0u128;
        for bit in (0..Self::BITS).rev() {
            for len in &lengths {
                key = (key << 1) | ((len >> bit) & 1);
            }
        }
        key
    }
}

impl SortKey for InterleavedLengths {
    fn key(&self, example: &Example) -> u128 {
        let lengths: Vec<usize> = example.fields.iter().map(|f| f.total_len()).collect();
        Self::interleave(&lengths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::TokenSeq;

    fn example(lens: &[usize]) -> Example {
        let fields = lens
            .iter()
            .map(|&n| TokenSeq::Flat((0..n).map(|i| i.to_string()).collect()))
            .collect();
        Example::new(0, fields)
    }

    fn run(cost: &dyn CostFunction, examples: &[Example]) -> Vec<usize> {
        let mut so_far = 0;
        examples
            .iter()
            .enumerate()
            .map(|(i, ex)| {
                so_far = cost.accumulate(ex, i + 1, so_far);
                so_far
            })
            .collect()
    }

    #[test]
    fn test_count_cost() {
        let exs = vec![example(&[5, 1]), example(&[2, 9]), example(&[3, 3])];
        assert_eq!(run(&CountCost, &exs), vec![1, 2, 3]);
    }

    #[test]
    fn test_token_sum_cost() {
        let exs = vec![example(&[5, 1]), example(&[2, 9]), example(&[3, 3])];
        assert_eq!(run(&TokenSumCost, &exs), vec![5, 14, 17]);
    }

    #[test]
    fn test_padded_cost_tracks_running_max() {
        let exs = vec![example(&[4, 2]), example(&[1, 7]), example(&[3, 3])];
        // max 4 -> 4, max 7 -> 14, max 7 -> 21
        assert_eq!(run(&PaddedTokenCost, &exs), vec![4, 14, 21]);
    }

    #[test]
    fn test_grid_cost_counts_characters() {
        let ex = Example::new(
            0,
            vec![
                TokenSeq::Grid(vec![vec!["a".into(), "b".into()], vec!["c".into()]]),
                TokenSeq::Grid(vec![vec!["x".into()]]),
            ],
        );
        assert_eq!(GridTokenSumCost.accumulate(&ex, 1, 10), 13);
        assert_eq!(TokenSumCost.accumulate(&ex, 1, 10), 12);
    }

    #[test]
    fn test_closure_cost() {
        let double = |_: &Example, count: usize, _: usize| count * 2;
        let exs = vec![example(&[1]), example(&[1])];
        assert_eq!(run(&double, &exs), vec![2, 4]);
        assert_eq!(double.name(), "custom");
    }

    #[test]
    fn test_parse_cost() {
        for name in ["count", "tokens", "padded-tokens", "grid-tokens"] {
            assert_eq!(parse_cost(name).unwrap().name(), name);
        }
        assert!(matches!(parse_cost("bogus"), Err(LoaderError::Config { .. })));
        assert!(parse_cost("auto").is_err());
    }

    #[test]
    fn test_interleave_two_fields() {
        assert_eq!(InterleavedLengths::interleave(&[0, 0]), 0);
        assert_eq!(InterleavedLengths::interleave(&[0, 1]), 0b01);
        assert_eq!(InterleavedLengths::interleave(&[1, 0]), 0b10);
        assert_eq!(InterleavedLengths::interleave(&[3, 1]), 0b1011);
    }

    #[test]
    fn test_interleave_orders_by_shape() {
        let key = |lens: &[usize]| InterleavedLengths.key(&example(lens));
        assert!(key(&[2, 2]) < key(&[3, 3]));
        assert!(key(&[3, 3]) < key(&[10, 1]));
        // Lengths beyond 16 bits are clamped
        assert_eq!(
            InterleavedLengths::interleave(&[70_000]),
            InterleavedLengths::interleave(&[65_535])
        );
    }

    #[test]
    fn test_closure_sort_key() {
        let by_first = |ex: &Example| ex.fields[0].len() as u128;
        assert_eq!(by_first.key(&example(&[7, 1])), 7);
    }
}
