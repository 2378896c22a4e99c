// rust/loader-core/src/dataset/reader.rs

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::example::Example;
use super::field::TokenField;
use crate::config::READER_BUFFER_PER_RANK;
use crate::error::{LoaderError, Result};
use crate::storage::{StorageBackend, StorageReader};

/// Options for the lazy reader.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Drop tuples with any field longer than this many whitespace tokens.
    pub max_len: Option<usize>,
    /// Number of surviving tuples buffered before they are emitted.
    pub buffer_size: usize,
    /// Fail instead of truncating when aligned files differ in length.
    pub strict_alignment: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            max_len: None,
            buffer_size: READER_BUFFER_PER_RANK,
            strict_alignment: false,
        }
    }
}

/// Counters for one reader, accumulated over all read cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Completed passes over the files.
    pub cycles: u64,
    /// Aligned line tuples read.
    pub lines_read: u64,
    /// Tuples that survived filtering.
    pub kept: u64,
    /// Tuples dropped because a field was blank.
    pub dropped_empty: u64,
    /// Tuples dropped by the length filter.
    pub dropped_long: u64,
}

/// The N open handles of one read cycle.
///
/// All handles are acquired together and released together when this value
/// is dropped, whether the cycle ended normally or with an error.
struct AlignedFiles {
    paths: Vec<PathBuf>,
    readers: Vec<Box<dyn StorageReader>>,
    strict: bool,
    line: u64,
    buf: String,
}

impl AlignedFiles {
    /// Opens every path. If any open fails, the handles already opened are
    /// dropped before the error is returned.
    fn open(storage: &dyn StorageBackend, paths: &[PathBuf], strict: bool) -> Result<Self> {
        let readers = paths
            .iter()
            .map(|p| storage.open_read(p))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            paths: paths.to_vec(),
            readers,
            strict,
            line: 0,
            buf: String::new(),
        })
    }

    /// Reads the next aligned tuple of stripped lines.
    ///
    /// Returns `None` once any file is exhausted; the shortest file bounds
    /// the cycle.
    fn next_tuple(&mut self) -> Result<Option<(u64, Vec<String>)>> {
        let mut lines = Vec::with_capacity(self.readers.len());
        let mut ended = Vec::new();

        for (idx, reader) in self.readers.iter_mut().enumerate() {
            self.buf.clear();
            let n = reader.read_line(&mut self.buf).map_err(|e| {
                LoaderError::storage_with_source(
                    &self.paths[idx],
                    format!("failed to read line {}", self.line),
                    e,
                )
            })?;
            if n == 0 {
                ended.push(idx);
            } else {
                lines.push(self.buf.trim().to_string());
            }
        }

        if ended.is_empty() {
            let line = self.line;
            self.line += 1;
            return Ok(Some((line, lines)));
        }

        if ended.len() < self.readers.len() {
            let short = &self.paths[ended[0]];
            if self.strict {
                return Err(LoaderError::alignment(short, self.line));
            }
            warn!(
                "Aligned file {} ended after {} lines while sibling files continue; truncating",
                short.display(),
                self.line
            );
        }
        Ok(None)
    }
}

/// Outcome of filtering one raw tuple.
enum Filtered {
    Keep(Example),
    Empty,
    TooLong,
}

fn filter_tuple(
    line: u64,
    lines: &[String],
    fields: &[TokenField],
    max_len: Option<usize>,
) -> Filtered {
    if lines.iter().any(String::is_empty) {
        return Filtered::Empty;
    }
    if let Some(max_len) = max_len {
        if lines.iter().any(|l| l.split_whitespace().count() > max_len) {
            return Filtered::TooLong;
        }
    }

    let tokens = fields
        .iter()
        .zip(lines)
        .map(|(field, text)| field.tokenize(text))
        .collect();
    Filtered::Keep(Example::new(line, tokens))
}

fn check_fields(paths: &[PathBuf], fields: &[TokenField]) -> Result<()> {
    if paths.is_empty() {
        return Err(LoaderError::config("at least one aligned file is required"));
    }
    if paths.len() != fields.len() {
        return Err(LoaderError::config(format!(
            "{} aligned files but {} fields",
            paths.len(),
            fields.len()
        )));
    }
    Ok(())
}

/// Infinite, lazily read stream of aligned examples.
///
/// Line `i` of every file forms one tuple. Tuples with a blank field, or
/// with a field over `max_len` whitespace tokens, are dropped. Survivors
/// are buffered and emitted `buffer_size` at a time. At end of input all
/// files are closed and reopened, so the stream never ends on its own.
///
/// The buffer carries over between cycles: the emitted sequence is the
/// surviving tuples of the corpus, repeated forever in file order.
pub struct StreamingRecordReader {
    storage: Arc<dyn StorageBackend>,
    paths: Vec<PathBuf>,
    fields: Arc<[TokenField]>,
    options: ReaderOptions,
    files: Option<AlignedFiles>,
    staged: Vec<Example>,
    ready: VecDeque<Example>,
    kept_this_cycle: u64,
    stats: ReaderStats,
    failed: bool,
}

impl StreamingRecordReader {
    /// Creates a reader over `paths`, one field per path.
    ///
    /// No file is opened until the first example is requested.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the number of paths and fields differ
    /// or the buffer size is zero.
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        paths: Vec<PathBuf>,
        fields: Arc<[TokenField]>,
        options: ReaderOptions,
    ) -> Result<Self> {
        check_fields(&paths, &fields)?;
        if options.buffer_size == 0 {
            return Err(LoaderError::config("reader buffer_size must be greater than 0"));
        }

        Ok(Self {
            storage,
            paths,
            fields,
            staged: Vec::with_capacity(options.buffer_size.min(READER_BUFFER_PER_RANK)),
            options,
            files: None,
            ready: VecDeque::new(),
            kept_this_cycle: 0,
            stats: ReaderStats::default(),
            failed: false,
        })
    }

    /// Opens all files eagerly so that a missing file fails before any batch
    /// is assembled.
    pub fn open(mut self) -> Result<Self> {
        self.ensure_open()?;
        Ok(self)
    }

    /// Returns the next example, or an error if reading fails.
    ///
    /// Never returns `Ok(None)` unless a previous call failed.
    pub fn next_example(&mut self) -> Result<Option<Example>> {
        if self.failed {
            return Ok(None);
        }
        let result = self.advance();
        if result.is_err() {
            self.failed = true;
            self.files = None;
        }
        result
    }

    fn advance(&mut self) -> Result<Option<Example>> {
        loop {
            if let Some(example) = self.ready.pop_front() {
                return Ok(Some(example));
            }

            self.ensure_open()?;
            let next = match self.files.as_mut() {
                Some(files) => files.next_tuple()?,
                None => None,
            };

            match next {
                Some((line, lines)) => self.accept(line, &lines),
                None => self.finish_cycle()?,
            }
        }
    }

    fn ensure_open(&mut self) -> Result<()> {
        if self.files.is_none() {
            self.files = Some(AlignedFiles::open(
                self.storage.as_ref(),
                &self.paths,
                self.options.strict_alignment,
            )?);
        }
        Ok(())
    }

    fn accept(&mut self, line: u64, lines: &[String]) {
        self.stats.lines_read += 1;
        match filter_tuple(line, lines, &self.fields, self.options.max_len) {
            Filtered::Keep(example) => {
                self.stats.kept += 1;
                self.kept_this_cycle += 1;
                self.staged.push(example);
                if self.staged.len() >= self.options.buffer_size {
                    self.ready.extend(self.staged.drain(..));
                }
            }
            Filtered::Empty => {
                self.stats.dropped_empty += 1;
                trace!("Dropped line {} with an empty field", line);
            }
            Filtered::TooLong => {
                self.stats.dropped_long += 1;
                trace!("Dropped line {} over the length limit", line);
            }
        }
    }

    fn finish_cycle(&mut self) -> Result<()> {
        // Releases every handle of this cycle at once.
        self.files = None;
        self.stats.cycles += 1;

        debug!(
            "Read cycle {} done: {} tuples kept, {} staged",
            self.stats.cycles,
            self.kept_this_cycle,
            self.staged.len()
        );

        if self.kept_this_cycle == 0 {
            return Err(LoaderError::dataset(
                self.paths[0].display().to_string(),
                "no aligned line survives filtering; the stream would never yield",
            ));
        }
        self.kept_this_cycle = 0;
        Ok(())
    }

    /// Returns counters accumulated so far.
    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    /// Returns the aligned file paths, in field order.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Iterator for StreamingRecordReader {
    type Item = Result<Example>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_example() {
            Ok(Some(example)) => Some(Ok(example)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Reads the whole aligned corpus once.
///
/// Blank-field tuples are dropped; there is no length filter, buffering or
/// cycling. Used for small held-out splits.
pub fn read_full(
    storage: &dyn StorageBackend,
    paths: &[PathBuf],
    fields: &[TokenField],
    strict_alignment: bool,
) -> Result<Vec<Example>> {
    check_fields(paths, fields)?;

    let mut files = AlignedFiles::open(storage, paths, strict_alignment)?;
    let mut examples = Vec::new();
    let mut dropped = 0u64;

    while let Some((line, lines)) = files.next_tuple()? {
        match filter_tuple(line, &lines, fields, None) {
            Filtered::Keep(example) => examples.push(example),
            _ => dropped += 1,
        }
    }

    debug!(
        "Read {} examples from {} ({} dropped)",
        examples.len(),
        paths[0].display(),
        dropped
    );
    Ok(examples)
}
