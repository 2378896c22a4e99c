// rust/loader-core/src/config.rs

//! Configuration management for the distributed text loader.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{LoaderError, Result};

/// Surviving tuples buffered per rank before the lazy reader flushes.
pub const READER_BUFFER_PER_RANK: usize = 16384;

/// Cost policy names accepted by `batching.cost`.
pub const COST_POLICIES: [&str; 5] = ["auto", "count", "tokens", "padded-tokens", "grid-tokens"];

// Top-level loader configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub storage: StorageConfig,
    pub dataset: DatasetConfig,
    pub fields: FieldsConfig,
    pub batching: BatchingConfig,
    pub distributed: DistributedConfig,
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Base path that relative corpus paths are resolved against.
    pub base_path: PathBuf,
    // Buffer size in bytes for line reads.
    pub buffer_size: usize,
    // Whether to memory-map large corpus files.
    pub use_mmap: bool,
    // File size threshold (bytes) above which to use mmap.
    pub mmap_threshold: u64,
}

/// Parallel corpus layout and reader options.
///
/// Files are looked up as `{name}/{source}-{target}/{split}{extension}`,
/// one file per extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Corpus directory name under the storage base path.
    pub name: String,
    /// Source language code.
    pub source: String,
    /// Target language code.
    pub target: String,
    /// One extension per aligned stream, in field order.
    pub extensions: Vec<String>,
    /// Field names, one per stream.
    pub field_names: Vec<String>,
    /// Split file prefixes. `None` disables the split.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub train: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    /// Drop training tuples with any field longer than this many words.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_len: Option<usize>,
    /// Lazy reader flush size. Defaults to 16384 per rank.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,
    /// Fail instead of truncating when aligned files differ in length.
    pub strict_alignment: bool,
}

/// Tokenizer base unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerBase {
    /// Whitespace-separated words.
    #[default]
    Word,
    /// Unicode characters.
    Char,
    /// UTF-8 bytes rendered as two-digit hex.
    Byte,
}

// Field shape options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldsConfig {
    pub base: TokenizerBase,
    // Split each word into characters (char base only).
    pub grid: bool,
    // Pad every sequence to this length downstream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_length: Option<usize>,
}

/// Batch assembly options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Per-rank cost budget of one batch.
    pub target_cost: usize,
    /// Cost policy, one of `COST_POLICIES`.
    pub cost: String,
    /// Use the bucketed shuffle pool for the training split.
    pub bucket: bool,
    /// Sort each batch longest-first before splitting.
    pub sort_within_batch: bool,
    /// Base seed for batch shuffling. Must match across ranks.
    pub seed: u64,
}

// Rank identity supplied by the launcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    pub rank: usize,
    pub world_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./data"),
            buffer_size: 64 * 1024, // 64 KB
            use_mmap: false,
            mmap_threshold: 64 * 1024 * 1024, // 64 MB
        }
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            source: "src".to_string(),
            target: "trg".to_string(),
            extensions: vec![".src".to_string(), ".trg".to_string()],
            field_names: vec!["src".to_string(), "trg".to_string()],
            train: Some("train".to_string()),
            dev: Some("dev".to_string()),
            test: None,
            max_len: None,
            buffer_size: None,
            strict_alignment: false,
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            target_cost: 2048,
            cost: "auto".to_string(),
            bucket: true,
            sort_within_batch: true,
            seed: 0,
        }
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }
}

impl DatasetConfig {
    /// Flush size of the lazy reader for the given world size.
    pub fn reader_buffer(&self, world_size: usize) -> usize {
        self.buffer_size
            .unwrap_or(READER_BUFFER_PER_RANK * world_size.max(1))
    }
}

impl BatchingConfig {
    /// Resolves `auto` to a concrete policy name.
    ///
    /// A target of one falls back to counting examples, which yields one
    /// example per rank per batch.
    pub fn resolved_cost(&self) -> &str {
        match self.cost.as_str() {
            "auto" if self.target_cost == 1 => "count",
            "auto" => "tokens",
            other => other,
        }
    }
}

impl FromStr for LoaderConfig {
    type Err = LoaderError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| LoaderError::config_with_source("failed to parse TOML config", e))
    }
}

impl LoaderConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LoaderError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `DTL_` and use underscores
    // to separate nested fields. For example:
    // - `DTL_STORAGE_BASE_PATH` overrides `storage.base_path`
    // - `DTL_BATCHING_TARGET_COST` overrides `batching.target_cost`
    // - `DTL_DISTRIBUTED_RANK` overrides `distributed.rank`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Storage overrides
        if let Ok(val) = std::env::var("DTL_STORAGE_BASE_PATH") {
            self.storage.base_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("DTL_STORAGE_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.storage.buffer_size = v;
            }
        }
        if let Ok(val) = std::env::var("DTL_STORAGE_USE_MMAP") {
            if let Ok(v) = val.parse() {
                self.storage.use_mmap = v;
            }
        }

        // Dataset overrides
        if let Ok(val) = std::env::var("DTL_DATASET_NAME") {
            self.dataset.name = val;
        }
        if let Ok(val) = std::env::var("DTL_DATASET_MAX_LEN") {
            if let Ok(v) = val.parse() {
                self.dataset.max_len = Some(v);
            }
        }
        if let Ok(val) = std::env::var("DTL_DATASET_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.dataset.buffer_size = Some(v);
            }
        }

        // Field overrides
        if let Ok(val) = std::env::var("DTL_FIELDS_BASE") {
            match val.to_lowercase().as_str() {
                "word" => self.fields.base = TokenizerBase::Word,
                "char" => self.fields.base = TokenizerBase::Char,
                "byte" => self.fields.base = TokenizerBase::Byte,
                _ => {} // ignore invalid values
            }
        }

        // Batching overrides
        if let Ok(val) = std::env::var("DTL_BATCHING_TARGET_COST") {
            if let Ok(v) = val.parse() {
                self.batching.target_cost = v;
            }
        }
        if let Ok(val) = std::env::var("DTL_BATCHING_COST") {
            self.batching.cost = val;
        }
        if let Ok(val) = std::env::var("DTL_BATCHING_SEED") {
            if let Ok(v) = val.parse() {
                self.batching.seed = v;
            }
        }

        // Distributed overrides
        if let Ok(val) = std::env::var("DTL_DISTRIBUTED_RANK") {
            if let Ok(v) = val.parse() {
                self.distributed.rank = v;
            }
        }
        if let Ok(val) = std::env::var("DTL_DISTRIBUTED_WORLD_SIZE") {
            if let Ok(v) = val.parse() {
                self.distributed.world_size = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        // Storage validation
        if self.storage.buffer_size == 0 {
            return Err(LoaderError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }

        // Dataset validation
        if self.dataset.extensions.is_empty() {
            return Err(LoaderError::config(
                "dataset.extensions must name at least one stream",
            ));
        }
        if self.dataset.field_names.len() != self.dataset.extensions.len() {
            return Err(LoaderError::config(format!(
                "dataset.field_names has {} entries but dataset.extensions has {}",
                self.dataset.field_names.len(),
                self.dataset.extensions.len()
            )));
        }
        if self.dataset.max_len == Some(0) {
            return Err(LoaderError::config(
                "dataset.max_len must be greater than 0",
            ));
        }
        if self.dataset.buffer_size == Some(0) {
            return Err(LoaderError::config(
                "dataset.buffer_size must be greater than 0",
            ));
        }

        // Field validation
        if self.fields.grid && self.fields.base != TokenizerBase::Char {
            return Err(LoaderError::config(
                "fields.grid requires fields.base = \"char\"",
            ));
        }
        if self.fields.grid && self.fields.fix_length.is_some() {
            return Err(LoaderError::config(
                "fields.fix_length is not supported for grid fields",
            ));
        }

        // Batching validation
        if self.batching.target_cost == 0 {
            return Err(LoaderError::config(
                "batching.target_cost must be greater than 0",
            ));
        }
        if !COST_POLICIES.contains(&self.batching.cost.as_str()) {
            return Err(LoaderError::config(format!(
                "batching.cost must be one of: {}",
                COST_POLICIES.join(", ")
            )));
        }

        // Distributed validation
        if self.distributed.world_size == 0 {
            return Err(LoaderError::config(
                "distributed.world_size must be greater than 0",
            ));
        }
        if self.distributed.rank >= self.distributed.world_size {
            return Err(LoaderError::config(format!(
                "distributed.rank {} must be less than world_size {}",
                self.distributed.rank, self.distributed.world_size
            )));
        }

        Ok(())
    }
}
