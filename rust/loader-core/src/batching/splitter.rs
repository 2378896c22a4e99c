// rust/loader-core/src/batching/splitter.rs

use std::ops::Range;
use std::sync::Arc;

use super::batch::Batch;
use crate::dataset::{Example, TokenSeq};
use crate::error::{LoaderError, Result};

/// Computes the contiguous slice of a `batch_len` batch owned by `rank`.
///
/// The batch is divided evenly; ranks below the remainder get one extra
/// example. Ranges are gapless and in rank order, so their union is the
/// whole batch.
pub fn shard_range(batch_len: usize, world_size: usize, rank: usize) -> Result<Range<usize>> {
    if world_size == 0 || rank >= world_size {
        return Err(LoaderError::invalid_shard(rank, world_size));
    }

    let base = batch_len / world_size;
    let remainder = batch_len - base * world_size;
    let start = rank * base + rank.min(remainder);
    let extra = if rank < remainder { 1 } else { 0 };

    Ok(start..start + base + extra)
}

/// Computes every rank's range, in rank order.
pub fn shard_ranges(batch_len: usize, world_size: usize) -> Result<Vec<Range<usize>>> {
    (0..world_size.max(1))
        .map(|rank| shard_range(batch_len, world_size, rank))
        .collect()
}

/// One rank's share of a global batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedBatch {
    pub rank: usize,
    pub world_size: usize,
    /// Size of the batch before splitting.
    pub global_size: usize,
    /// Offset of this shard within the global batch.
    pub start: usize,
    pub examples: Vec<Example>,
    field_names: Arc<[String]>,
}

impl DistributedBatch {
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// End offset (exclusive) of this shard within the global batch.
    pub fn end(&self) -> usize {
        self.start + self.examples.len()
    }

    pub fn field_names(&self) -> &[String] {
        &self.field_names
    }

    /// Column view of one field across the shard, for tensorization.
    pub fn field(&self, name: &str) -> Option<Vec<&TokenSeq>> {
        let index = self.field_names.iter().position(|n| n == name)?;
        self.examples.iter().map(|e| e.field(index)).collect()
    }
}

/// Carves one rank's shard out of each global batch.
#[derive(Debug, Clone)]
pub struct DistributedBatchSplitter {
    rank: usize,
    world_size: usize,
    field_names: Arc<[String]>,
}

impl DistributedBatchSplitter {
    /// # Errors
    ///
    /// Returns `InvalidShard` unless `rank < world_size`.
    pub fn new(rank: usize, world_size: usize, field_names: Arc<[String]>) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(LoaderError::invalid_shard(rank, world_size));
        }
        Ok(Self {
            rank,
            world_size,
            field_names,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Keeps this rank's shard of `batch`.
    ///
    /// # Panics
    ///
    /// Panics if the shard is empty, which happens only when the batch holds
    /// fewer examples than there are ranks. The assemblers never emit such a
    /// batch for a corpus with at least `world_size` examples.
    pub fn split(&self, batch: Batch) -> DistributedBatch {
        let global_size = batch.len();
        let base = global_size / self.world_size;
        let remainder = global_size - base * self.world_size;
        let start = self.rank * base + self.rank.min(remainder);
        let end = start + base + usize::from(self.rank < remainder);

        assert!(
            end > start,
            "rank {} of {} got an empty shard of a {}-example batch",
            self.rank,
            self.world_size,
            global_size
        );

        let mut examples = batch.examples;
        examples.truncate(end);
        examples.drain(..start);

        DistributedBatch {
            rank: self.rank,
            world_size: self.world_size,
            global_size,
            start,
            examples,
            field_names: Arc::clone(&self.field_names),
        }
    }
}
