// rust/loader-core/src/epoch.rs

//! Epoch-driven iteration with resumable progress counters.
//!
//! `ResumableEpochIterator` asks a `BatchSource` for a fresh batch stream at
//! the start of every epoch, counts the batches it yields, and hands each one
//! to the splitter for the caller's rank. Its `IterationState` can be saved
//! by the caller and passed back through `resume`, after which the already
//! consumed batches of the interrupted epoch are skipped.

use std::cmp::Reverse;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::batching::{Batch, DistributedBatch, DistributedBatchSplitter, SortKey};
use crate::error::{LoaderError, Result};

/// A boxed stream of global batches for one epoch.
pub type BatchStream = Box<dyn Iterator<Item = Result<Batch>> + Send>;

/// Produces the batch stream of an epoch.
///
/// Every rank must get the same sequence for the same epoch index.
pub trait BatchSource: Send {
    fn open_epoch(&mut self, epoch: u64) -> Result<BatchStream>;
}

impl<F> BatchSource for F
where
    F: FnMut(u64) -> Result<BatchStream> + Send,
{
    fn open_epoch(&mut self, epoch: u64) -> Result<BatchStream> {
        self(epoch)
    }
}

/// Progress counters, advanced once per yielded batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationState {
    /// Zero-based epoch index.
    pub epoch: u64,
    /// Batches yielded in the current epoch, including any skipped on resume.
    pub iterations_this_epoch: u64,
    /// Batches yielded overall.
    pub iterations: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EpochConfig {
    /// Start a new epoch when the stream runs out instead of stopping.
    pub repeat: bool,
    /// Sort each batch by decreasing sort key before splitting.
    pub sort_within_batch: bool,
}

enum Phase {
    EpochStart,
    Running(BatchStream),
    EpochDone,
    Finished,
}

/// Iterates per-rank batches across epochs.
///
/// Without `repeat` the iterator stops after one epoch and the global
/// counter restarts from zero each time an epoch starts.
pub struct ResumableEpochIterator {
    source: Box<dyn BatchSource>,
    splitter: DistributedBatchSplitter,
    sort_key: Arc<dyn SortKey>,
    config: EpochConfig,
    state: IterationState,
    restored: bool,
    phase: Phase,
    position: u64,
}

impl ResumableEpochIterator {
    pub fn new(
        source: Box<dyn BatchSource>,
        splitter: DistributedBatchSplitter,
        sort_key: Arc<dyn SortKey>,
        config: EpochConfig,
    ) -> Self {
        Self {
            source,
            splitter,
            sort_key,
            config,
            state: IterationState::default(),
            restored: false,
            phase: Phase::EpochStart,
            position: 0,
        }
    }

    /// Restarts from `state`.
    ///
    /// The next epoch opened is `state.epoch`, and its first
    /// `state.iterations_this_epoch` batches are skipped. The skip applies
    /// to that one epoch only.
    pub fn resume(&mut self, state: IterationState) {
        self.state = state;
        self.restored = true;
        self.phase = Phase::EpochStart;
    }

    /// Builder form of [`resume`](Self::resume).
    pub fn with_state(mut self, state: IterationState) -> Self {
        self.resume(state);
        self
    }

    /// Current counters; save these to resume later.
    pub fn state(&self) -> IterationState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.state.epoch
    }

    pub fn rank(&self) -> usize {
        self.splitter.rank()
    }

    pub fn world_size(&self) -> usize {
        self.splitter.world_size()
    }

    /// Returns the next per-rank batch.
    ///
    /// Returns `Ok(None)` once a non-repeating iterator has finished its
    /// epoch. After an error the iterator is finished.
    pub fn next_batch(&mut self) -> Result<Option<DistributedBatch>> {
        let result = self.advance();
        if result.is_err() {
            self.phase = Phase::Finished;
        }
        result
    }

    fn advance(&mut self) -> Result<Option<DistributedBatch>> {
        loop {
            match &mut self.phase {
                Phase::EpochStart => self.start_epoch()?,
                Phase::Running(stream) => match stream.next() {
                    Some(batch) => {
                        let batch = batch?;
                        let idx = self.position;
                        self.position += 1;

                        // Fast-forward past batches consumed before a restart.
                        if idx < self.state.iterations_this_epoch {
                            continue;
                        }
                        return Ok(Some(self.emit(batch)));
                    }
                    None => self.phase = Phase::EpochDone,
                },
                Phase::EpochDone => {
                    debug!(
                        "Epoch {} finished after {} batches",
                        self.state.epoch, self.state.iterations_this_epoch
                    );
                    if !self.config.repeat {
                        self.phase = Phase::Finished;
                        return Ok(None);
                    }
                    if self.position == 0 {
                        return Err(LoaderError::dataset(
                            format!("epoch {}", self.state.epoch),
                            "epoch produced no batches",
                        ));
                    }
                    self.state.epoch += 1;
                    self.phase = Phase::EpochStart;
                }
                Phase::Finished => return Ok(None),
            }
        }
    }

    fn start_epoch(&mut self) -> Result<()> {
        if self.restored {
            self.restored = false;
        } else {
            self.state.iterations_this_epoch = 0;
        }
        if !self.config.repeat {
            self.state.iterations = 0;
        }

        info!(
            "Starting epoch {} on rank {}/{} (skipping {} batches)",
            self.state.epoch,
            self.splitter.rank(),
            self.splitter.world_size(),
            self.state.iterations_this_epoch
        );

        let stream = self.source.open_epoch(self.state.epoch)?;
        self.position = 0;
        self.phase = Phase::Running(stream);
        Ok(())
    }

    fn emit(&mut self, mut batch: Batch) -> DistributedBatch {
        self.state.iterations += 1;
        self.state.iterations_this_epoch += 1;

        if self.config.sort_within_batch {
            let sort_key = &self.sort_key;
            batch
                .examples
                .sort_by_cached_key(|e| Reverse(sort_key.key(e)));
        }
        self.splitter.split(batch)
    }
}

impl Iterator for ResumableEpochIterator {
    type Item = Result<DistributedBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
