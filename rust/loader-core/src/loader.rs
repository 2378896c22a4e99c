// rust/loader-core/src/loader.rs

//! Top-level loader.
//!
//! `Loader` ties together storage, fields, cost policy and the batching
//! pipeline for the train/dev/test splits of one parallel corpus.
//!
//! # Example
//!
//! ```no_run
//! use loader_core::{Loader, LoaderConfig};
//!
//! let mut config = LoaderConfig::default();
//! config.dataset.name = "wmt16".into();
//! config.dataset.source = "en".into();
//! config.dataset.target = "de".into();
//!
//! let loader = Loader::from_config(config).unwrap();
//! for batch in loader.train().unwrap().take(100) {
//!     let batch = batch.unwrap();
//!     println!("{} of {} examples", batch.len(), batch.global_size);
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use tracing::info;

use crate::batching::{
    parse_cost, AssemblerConfig, BucketedShufflePool, CostFunction, DistributedBatchSplitter,
    DynamicBatchAssembler, InterleavedLengths, SeededShuffler, SortKey,
};
use crate::config::LoaderConfig;
use crate::dataset::{read_full, Example, ReaderOptions, StreamingRecordReader, TokenField};
use crate::epoch::{BatchSource, BatchStream, EpochConfig, ResumableEpochIterator};
use crate::error::{LoaderError, Result};
use crate::storage::{LocalStorage, StorageBackend};

/// One of the three corpus splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Dev,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Dev => "dev",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Split {
    type Err = LoaderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "train" => Ok(Split::Train),
            "dev" | "valid" | "validation" => Ok(Split::Dev),
            "test" => Ok(Split::Test),
            _ => Err(LoaderError::config(format!(
                "unknown split: '{s}'. Expected 'train', 'dev', or 'test'"
            ))),
        }
    }
}

/// The loader for one parallel corpus.
pub struct Loader {
    config: LoaderConfig,
    storage: Arc<dyn StorageBackend>,
    fields: Arc<[TokenField]>,
    field_names: Arc<[String]>,
    cost: Arc<dyn CostFunction>,
    sort_key: Arc<dyn SortKey>,
    corpus_dir: PathBuf,
    extensions: Vec<String>,
    reversed: bool,
}

impl Loader {
    /// Creates a loader from a configuration file.
    ///
    /// Environment variable overrides are applied after loading the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or is invalid, or
    /// if the corpus directory cannot be found.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = LoaderConfig::from_file(path)?.with_env_overrides();
        Self::from_config(config)
    }

    /// Creates a loader from a configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the storage backend
    /// cannot be initialized, or the corpus directory cannot be found.
    pub fn from_config(config: LoaderConfig) -> Result<Self> {
        config.validate()?;

        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config.storage)?);

        let fields: Arc<[TokenField]> = config
            .dataset
            .field_names
            .iter()
            .map(|name| TokenField::from_config(name.clone(), &config.fields))
            .collect::<Result<Vec<_>>>()?
            .into();
        let field_names: Arc<[String]> = config.dataset.field_names.clone().into();
        let cost = parse_cost(config.batching.resolved_cost())?;

        let (corpus_dir, reversed) = resolve_corpus(storage.as_ref(), &config)?;
        let mut extensions = config.dataset.extensions.clone();
        if reversed {
            extensions.reverse();
        }

        info!(
            "Resolved corpus {} (reversed: {}, cost: {})",
            corpus_dir.display(),
            reversed,
            cost.name()
        );

        Ok(Self {
            config,
            storage,
            fields,
            field_names,
            cost,
            sort_key: Arc::new(InterleavedLengths),
            corpus_dir,
            extensions,
            reversed,
        })
    }

    /// Replaces the cost policy chosen by configuration.
    pub fn with_cost(mut self, cost: Arc<dyn CostFunction>) -> Self {
        self.cost = cost;
        self
    }

    /// Replaces the default interleaved-length sort key.
    pub fn with_sort_key(mut self, sort_key: Arc<dyn SortKey>) -> Self {
        self.sort_key = sort_key;
        self
    }

    /// Returns the configured file prefix of `split`, if any.
    pub fn split_prefix(&self, split: Split) -> Option<&str> {
        let dataset = &self.config.dataset;
        match split {
            Split::Train => dataset.train.as_deref(),
            Split::Dev => dataset.dev.as_deref(),
            Split::Test => dataset.test.as_deref(),
        }
    }

    /// Returns the aligned file paths of `split`, in field order.
    ///
    /// # Errors
    ///
    /// Returns a dataset error if the split is not configured.
    pub fn split_paths(&self, split: Split) -> Result<Vec<PathBuf>> {
        let prefix = self.split_prefix(split).ok_or_else(|| {
            LoaderError::dataset(
                self.config.dataset.name.clone(),
                format!("split '{split}' is not configured"),
            )
        })?;

        Ok(self
            .extensions
            .iter()
            .map(|ext| self.corpus_dir.join(format!("{prefix}{ext}")))
            .collect())
    }

    /// Builds the per-rank iterator for `split`.
    ///
    /// The training split streams lazily and repeats forever; dev and test
    /// are read once and iterated for a single pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the split is not configured or a file cannot be
    /// opened or read.
    pub fn iter_split(&self, split: Split) -> Result<ResumableEpochIterator> {
        let paths = self.split_paths(split)?;
        let distributed = &self.config.distributed;
        let batching = &self.config.batching;

        let splitter = DistributedBatchSplitter::new(
            distributed.rank,
            distributed.world_size,
            Arc::clone(&self.field_names),
        )?;

        let (source, repeat) = match split {
            Split::Train => (self.streaming_source(paths)?, true),
            Split::Dev | Split::Test => (self.materialized_source(split, paths)?, false),
        };

        info!(
            "Built {} split on rank {}/{} (target cost {} per rank)",
            split, distributed.rank, distributed.world_size, batching.target_cost
        );

        Ok(ResumableEpochIterator::new(
            source,
            splitter,
            Arc::clone(&self.sort_key),
            EpochConfig {
                repeat,
                sort_within_batch: batching.sort_within_batch,
            },
        ))
    }

    pub fn train(&self) -> Result<ResumableEpochIterator> {
        self.iter_split(Split::Train)
    }

    pub fn dev(&self) -> Result<ResumableEpochIterator> {
        self.iter_split(Split::Dev)
    }

    pub fn test(&self) -> Result<ResumableEpochIterator> {
        self.iter_split(Split::Test)
    }

    fn streaming_source(&self, paths: Vec<PathBuf>) -> Result<Box<dyn BatchSource>> {
        let dataset = &self.config.dataset;
        let world_size = self.config.distributed.world_size;
        let options = ReaderOptions {
            max_len: dataset.max_len,
            buffer_size: dataset.reader_buffer(world_size),
            strict_alignment: dataset.strict_alignment,
        };

        // Fail on a missing file now rather than at the first batch.
        StreamingRecordReader::new(
            Arc::clone(&self.storage),
            paths.clone(),
            Arc::clone(&self.fields),
            options.clone(),
        )?
        .open()?;

        let bytes = paths
            .iter()
            .map(|p| self.storage.metadata(p).map(|m| m.size))
            .sum::<Result<u64>>()?;
        info!(
            "Streaming {} aligned files ({} bytes, buffer {})",
            paths.len(),
            bytes,
            options.buffer_size
        );

        Ok(Box::new(StreamingSource {
            storage: Arc::clone(&self.storage),
            paths,
            fields: Arc::clone(&self.fields),
            options,
            cost: Arc::clone(&self.cost),
            sort_key: Arc::clone(&self.sort_key),
            target_cost: self.config.batching.target_cost,
            world_size,
            bucket: self.config.batching.bucket,
            seed: self.config.batching.seed,
        }))
    }

    fn materialized_source(
        &self,
        split: Split,
        paths: Vec<PathBuf>,
    ) -> Result<Box<dyn BatchSource>> {
        let mut examples = read_full(
            self.storage.as_ref(),
            &paths,
            &self.fields,
            self.config.dataset.strict_alignment,
        )?;
        // Held-out splits are batched in sort order.
        let sort_key = &self.sort_key;
        examples.sort_by_cached_key(|e| sort_key.key(e));

        info!("Loaded {} {} examples", examples.len(), split);

        Ok(Box::new(MaterializedSource {
            examples: examples.into(),
            cost: Arc::clone(&self.cost),
            config: AssemblerConfig {
                target_cost: self.config.batching.target_cost,
                world_size: self.config.distributed.world_size,
                reserve: true,
            },
        }))
    }

    /// Returns the resolved corpus directory.
    pub fn corpus_dir(&self) -> &Path {
        &self.corpus_dir
    }

    /// Whether the corpus was found under the reversed language pair.
    pub fn is_reversed(&self) -> bool {
        self.reversed
    }

    pub fn fields(&self) -> &[TokenField] {
        &self.fields
    }

    pub fn cost(&self) -> &Arc<dyn CostFunction> {
        &self.cost
    }

    /// Returns the current configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Returns a reference to the storage backend.
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("corpus_dir", &self.corpus_dir)
            .field("reversed", &self.reversed)
            .field("fields", &self.field_names)
            .field("cost", &self.cost.name())
            .finish()
    }
}

/// Finds `{name}/{source}-{target}`, falling back to `{name}/{target}-{source}`.
///
/// Returns the directory and whether the reversed pair was used.
fn resolve_corpus(
    storage: &dyn StorageBackend,
    config: &LoaderConfig,
) -> Result<(PathBuf, bool)> {
    let dataset = &config.dataset;
    let root = PathBuf::from(&dataset.name);

    let forward = root.join(format!("{}-{}", dataset.source, dataset.target));
    if storage.exists(&forward)? {
        return Ok((forward, false));
    }

    let backward = root.join(format!("{}-{}", dataset.target, dataset.source));
    if storage.exists(&backward)? {
        return Ok((backward, true));
    }

    Err(LoaderError::dataset(
        dataset.name.clone(),
        format!(
            "no corpus directory for {}-{} or {}-{}",
            dataset.source, dataset.target, dataset.target, dataset.source
        ),
    ))
}

/// Training batches: a fresh lazy reader per epoch, bucketed or sequential.
struct StreamingSource {
    storage: Arc<dyn StorageBackend>,
    paths: Vec<PathBuf>,
    fields: Arc<[TokenField]>,
    options: ReaderOptions,
    cost: Arc<dyn CostFunction>,
    sort_key: Arc<dyn SortKey>,
    target_cost: usize,
    world_size: usize,
    bucket: bool,
    seed: u64,
}

impl BatchSource for StreamingSource {
    fn open_epoch(&mut self, epoch: u64) -> Result<BatchStream> {
        let reader = StreamingRecordReader::new(
            Arc::clone(&self.storage),
            self.paths.clone(),
            Arc::clone(&self.fields),
            self.options.clone(),
        )?;

        if self.bucket {
            let pool = BucketedShufflePool::new(
                reader,
                Arc::clone(&self.cost),
                Arc::clone(&self.sort_key),
                self.target_cost,
                self.world_size,
                Box::new(SeededShuffler::for_epoch(self.seed, epoch)),
            )?;
            Ok(Box::new(pool))
        } else {
            let assembler = DynamicBatchAssembler::new(
                reader,
                Arc::clone(&self.cost),
                AssemblerConfig {
                    target_cost: self.target_cost,
                    world_size: self.world_size,
                    reserve: true,
                },
            )?;
            Ok(Box::new(assembler))
        }
    }
}

/// Held-out batches: the same in-memory examples every epoch.
struct MaterializedSource {
    examples: Arc<[Example]>,
    cost: Arc<dyn CostFunction>,
    config: AssemblerConfig,
}

impl BatchSource for MaterializedSource {
    fn open_epoch(&mut self, _epoch: u64) -> Result<BatchStream> {
        let examples = Arc::clone(&self.examples);
        let input = (0..examples.len()).map(move |i| Ok(examples[i].clone()));
        let assembler = DynamicBatchAssembler::new(input, Arc::clone(&self.cost), self.config)?;
        Ok(Box::new(assembler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatasetConfig, DistributedConfig, StorageConfig};
    use crate::dataset::TokenSeq;
    use std::fs;
    use tempfile::TempDir;

    fn write_corpus(root: &Path, pair: &str, split: &str, src: &[&str], trg: &[&str]) {
        let dir = root.join("toy").join(pair);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{split}.src")), src.join("\n") + "\n").unwrap();
        fs::write(dir.join(format!("{split}.trg")), trg.join("\n") + "\n").unwrap();
    }

    fn config(base: &Path, rank: usize, world_size: usize) -> LoaderConfig {
        LoaderConfig {
            storage: StorageConfig {
                base_path: base.to_path_buf(),
                ..Default::default()
            },
            dataset: DatasetConfig {
                name: "toy".into(),
                source: "en".into(),
                target: "de".into(),
                test: Some("test".into()),
                ..Default::default()
            },
            distributed: DistributedConfig { rank, world_size },
            ..Default::default()
        }
    }

    fn seven_lines(temp: &TempDir, pair: &str, split: &str) {
        let src: Vec<String> = (0..7).map(|i| format!("s{i}")).collect();
        let trg: Vec<String> = (0..7).map(|i| format!("t{i}")).collect();
        let src: Vec<&str> = src.iter().map(String::as_str).collect();
        let trg: Vec<&str> = trg.iter().map(String::as_str).collect();
        write_corpus(temp.path(), pair, split, &src, &trg);
    }

    fn text(seq: &TokenSeq) -> String {
        match seq {
            TokenSeq::Flat(tokens) => tokens.join(" "),
            TokenSeq::Grid(_) => unreachable!(),
        }
    }

    #[test]
    fn test_split_from_str() {
        assert_eq!("train".parse::<Split>().unwrap(), Split::Train);
        assert_eq!("Valid".parse::<Split>().unwrap(), Split::Dev);
        assert_eq!(Split::Test.to_string(), "test");
        assert!("holdout".parse::<Split>().is_err());
    }

    #[test]
    fn test_resolves_forward_pair() {
        let temp = TempDir::new().unwrap();
        seven_lines(&temp, "en-de", "train");

        let loader = Loader::from_config(config(temp.path(), 0, 1)).unwrap();
        assert!(!loader.is_reversed());
        assert_eq!(loader.corpus_dir(), Path::new("toy/en-de"));

        let paths = loader.split_paths(Split::Train).unwrap();
        let expected = vec![
            PathBuf::from("toy/en-de/train.src"),
            PathBuf::from("toy/en-de/train.trg"),
        ];
        assert_eq!(paths, expected);
    }

    #[test]
    fn test_reversed_pair_swaps_streams() {
        let temp = TempDir::new().unwrap();
        // A de-en corpus: ".src" holds German, ".trg" holds English.
        write_corpus(temp.path(), "de-en", "test", &["hallo welt"], &["hello world"]);

        let loader = Loader::from_config(config(temp.path(), 0, 1)).unwrap();
        assert!(loader.is_reversed());

        let batch = loader.test().unwrap().next().unwrap().unwrap();
        let src = batch.field("src").unwrap();
        let trg = batch.field("trg").unwrap();
        assert_eq!(text(src[0]), "hello world");
        assert_eq!(text(trg[0]), "hallo welt");
    }

    #[test]
    fn test_missing_corpus() {
        let temp = TempDir::new().unwrap();
        let result = Loader::from_config(config(temp.path(), 0, 1));
        assert!(matches!(result, Err(LoaderError::Dataset { .. })));
    }

    #[test]
    fn test_unconfigured_split() {
        let temp = TempDir::new().unwrap();
        seven_lines(&temp, "en-de", "train");

        let mut cfg = config(temp.path(), 0, 1);
        cfg.dataset.test = None;
        let loader = Loader::from_config(cfg).unwrap();
        assert!(matches!(loader.test(), Err(LoaderError::Dataset { .. })));
    }

    #[test]
    fn test_missing_train_file_fails_early() {
        let temp = TempDir::new().unwrap();
        seven_lines(&temp, "en-de", "dev");

        let loader = Loader::from_config(config(temp.path(), 0, 1)).unwrap();
        assert!(matches!(loader.train(), Err(LoaderError::Storage { .. })));
    }

    #[test]
    fn test_test_split_shards_per_rank() {
        let temp = TempDir::new().unwrap();
        seven_lines(&temp, "en-de", "test");

        let mut shards = Vec::new();
        for rank in 0..2 {
            let mut cfg = config(temp.path(), rank, 2);
            cfg.batching.target_cost = 3;
            cfg.batching.cost = "count".into();
            let loader = Loader::from_config(cfg).unwrap();
            let batches: Vec<_> = loader.test().unwrap().map(|b| b.unwrap()).collect();
            shards.push(batches);
        }

        // Reserve mode folds the 7 examples into one batch
        assert_eq!(shards[0].len(), 1);
        assert_eq!(shards[1].len(), 1);
        assert_eq!(shards[0][0].global_size, 7);
        assert_eq!((shards[0][0].start, shards[0][0].end()), (0, 4));
        assert_eq!((shards[1][0].start, shards[1][0].end()), (4, 7));
    }

    #[test]
    fn test_train_split_repeats() {
        let temp = TempDir::new().unwrap();
        write_corpus(temp.path(), "en-de", "train", &["a b", "c"], &["x", "y z w"]);

        let mut cfg = config(temp.path(), 0, 1);
        cfg.batching.target_cost = 1;
        cfg.batching.bucket = false;
        cfg.dataset.buffer_size = Some(2);
        let loader = Loader::from_config(cfg).unwrap();
        assert_eq!(loader.cost().name(), "count");

        // Far more batches than the corpus has lines
        let batches: Vec<_> = loader
            .train()
            .unwrap()
            .take(10)
            .map(|b| b.unwrap())
            .collect();
        assert_eq!(batches.len(), 10);
        assert!(batches.iter().all(|b| !b.is_empty()));
    }

    #[test]
    fn test_train_ranks_agree() {
        let temp = TempDir::new().unwrap();
        let src: Vec<String> = (0..50).map(|i| "w ".repeat(i % 9 + 1)).collect();
        let trg: Vec<String> = (0..50).map(|i| "v ".repeat(i % 4 + 1)).collect();
        let src: Vec<&str> = src.iter().map(String::as_str).collect();
        let trg: Vec<&str> = trg.iter().map(String::as_str).collect();
        write_corpus(temp.path(), "en-de", "train", &src, &trg);

        let shards_of = |rank| {
            let mut cfg = config(temp.path(), rank, 2);
            cfg.batching.target_cost = 6;
            cfg.batching.seed = 11;
            cfg.dataset.buffer_size = Some(16);
            let loader = Loader::from_config(cfg).unwrap();
            loader
                .train()
                .unwrap()
                .take(5)
                .map(|b| b.unwrap())
                .collect::<Vec<_>>()
        };
        let rank0 = shards_of(0);
        let rank1 = shards_of(1);

        for (a, b) in rank0.iter().zip(&rank1) {
            assert_eq!(a.global_size, b.global_size);
            assert_eq!(a.end(), b.start);
            assert_eq!(b.end(), b.global_size);
            assert!(!a.is_empty() && !b.is_empty());
        }
    }

    #[test]
    fn test_grid_fields() {
        let temp = TempDir::new().unwrap();
        write_corpus(temp.path(), "en-de", "dev", &["ab cd"], &["xyz"]);

        let mut cfg = config(temp.path(), 0, 1);
        cfg.fields.base = crate::config::TokenizerBase::Char;
        cfg.fields.grid = true;
        cfg.batching.cost = "grid-tokens".into();
        let loader = Loader::from_config(cfg).unwrap();

        let batch = loader.dev().unwrap().next().unwrap().unwrap();
        let src = batch.field("src").unwrap();
        assert_eq!(src[0].len(), 2);
        assert_eq!(src[0].total_len(), 4);
        assert_eq!(loader.fields()[0].detokenize(src[0]), "ab cd");
    }
}
