// rust/loader-core/src/batching/mod.rs

//! Cost-bounded batching and per-rank splitting.
//!
//! Examples are packed greedily into batches whose cost stays within
//! `target_cost * world_size`, optionally through a two-level
//! sort-and-shuffle pool, and each batch is then cut into one contiguous
//! shard per rank.
//!
//! # Example
//!
//! ```
//! use loader_core::batching::{
//!     AssemblerConfig, CountCost, DistributedBatchSplitter, DynamicBatchAssembler,
//! };
//! use loader_core::dataset::{Example, TokenSeq};
//! use std::sync::Arc;
//!
//! # fn main() -> loader_core::Result<()> {
//! let examples = (0..7).map(|i| Ok(Example::new(i, vec![TokenSeq::Flat(vec!["x".into()])])));
//! let config = AssemblerConfig { target_cost: 3, world_size: 2, reserve: false };
//! let splitter = DistributedBatchSplitter::new(1, 2, Arc::from(vec!["src".to_string()]))?;
//!
//! let mut assembler = DynamicBatchAssembler::new(examples, Arc::new(CountCost), config)?;
//! let batch = assembler.next_batch()?.expect("first batch");
//! let shard = splitter.split(batch);
//! assert_eq!((shard.start, shard.end()), (3, 6));
//! # Ok(())
//! # }
//! ```

mod assembler;
mod batch;
mod cost;
mod pool;
mod splitter;

pub use assembler::{AssemblerConfig, DynamicBatchAssembler};
pub use batch::Batch;
pub use cost::{
    parse_cost, CostFunction, CountCost, GridTokenSumCost, InterleavedLengths, PaddedTokenCost,
    SortKey, TokenSumCost,
};
pub use pool::{BucketedShufflePool, NoShuffle, SeededShuffler, Shuffler, POOL_FACTOR};
pub use splitter::{shard_range, shard_ranges, DistributedBatch, DistributedBatchSplitter};
