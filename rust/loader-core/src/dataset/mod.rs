// rust/loader-core/src/dataset/mod.rs

//! Reading aligned text corpora into tokenized examples.
//!
//! A corpus is N files where line `i` of each file belongs to the same
//! example. `StreamingRecordReader` reads them lazily and forever, for
//! training; `read_full` loads a small split once.
//!
//! # Example
//!
//! ```no_run
//! use loader_core::config::{FieldsConfig, StorageConfig};
//! use loader_core::dataset::{ReaderOptions, StreamingRecordReader, TokenField};
//! use loader_core::storage::LocalStorage;
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! # fn main() -> loader_core::Result<()> {
//! let storage = Arc::new(LocalStorage::new(&StorageConfig::default())?);
//! let fields: Arc<[TokenField]> = vec![
//!     TokenField::from_config("src", &FieldsConfig::default())?,
//!     TokenField::from_config("trg", &FieldsConfig::default())?,
//! ]
//! .into();
//! let paths = vec![PathBuf::from("train.src"), PathBuf::from("train.trg")];
//!
//! let reader = StreamingRecordReader::new(storage, paths, fields, ReaderOptions::default())?;
//! for example in reader.take(10) {
//!     let example = example?;
//!     println!("line {}: {} tokens", example.line, example.max_len());
//! }
//! # Ok(())
//! # }
//! ```

mod example;
mod field;
mod reader;

pub use example::Example;
pub use field::{FlatTokenField, GridTokenField, TokenField, TokenSeq, Tokenizer};
pub use reader::{read_full, ReaderOptions, ReaderStats, StreamingRecordReader};
