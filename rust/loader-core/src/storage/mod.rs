// rust/loader-core/src/storage/mod.rs

//! Storage abstraction for the text loader.
//!
//! The reader opens every aligned corpus file through a `StorageBackend`,
//! so tests and alternative backends can stand in for the local filesystem.
//!
//! # Example
//!
//! ```no_run
//! use loader_core::config::StorageConfig;
//! use loader_core::storage::{LocalStorage, StorageBackend};
//! use std::io::BufRead;
//! use std::path::Path;
//!
//! let config = StorageConfig::default();
//! let storage = LocalStorage::new(&config).unwrap();
//!
//! let reader = storage.open_read(Path::new("wmt16/ro-en/train.src")).unwrap();
//! for line in reader.lines() {
//!     println!("{}", line.unwrap());
//! }
//! ```

mod local;
mod traits;

pub use local::LocalStorage;
pub use traits::{ObjectMeta, StorageBackend, StorageReader};
