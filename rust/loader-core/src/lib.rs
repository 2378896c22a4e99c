// rust/loader-core/src/lib.rs

//! Distributed Text Loader - Core Library
//!
//! This crate streams line-aligned parallel text corpora into cost-bounded
//! batches and splits every batch evenly across a fixed number of ranks.
//! Iteration can be resumed mid-epoch from saved counters.

pub mod batching;
pub mod config;
pub mod dataset;
pub mod epoch;
pub mod error;
pub mod loader;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::LoaderConfig;
pub use error::{LoaderError, Result};
pub use storage::{LocalStorage, ObjectMeta, StorageBackend, StorageReader};

pub use batching::{
    AssemblerConfig, Batch, BucketedShufflePool, CostFunction, DistributedBatch,
    DistributedBatchSplitter, DynamicBatchAssembler, SeededShuffler, Shuffler, SortKey,
};
pub use dataset::{Example, StreamingRecordReader, TokenField, TokenSeq};
pub use epoch::{BatchSource, EpochConfig, IterationState, ResumableEpochIterator};
pub use loader::{Loader, Split};
