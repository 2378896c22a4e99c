// rust/loader-core/src/dataset/example.rs

use super::field::TokenSeq;

/// One aligned tuple of tokenized fields.
///
/// Field `i` was read from line `line` of aligned stream `i`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Example {
    /// Zero-based line index within the read cycle that produced it.
    pub line: u64,
    pub fields: Vec<TokenSeq>,
}

impl Example {
    pub fn new(line: u64, fields: Vec<TokenSeq>) -> Self {
        Self { line, fields }
    }

    pub fn field(&self, index: usize) -> Option<&TokenSeq> {
        self.fields.get(index)
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Longest field, in top-level units.
    pub fn max_len(&self) -> usize {
        self.fields.iter().map(TokenSeq::len).max().unwrap_or(0)
    }

    /// Longest field, in innermost tokens.
    pub fn max_total_len(&self) -> usize {
        self.fields.iter().map(TokenSeq::total_len).max().unwrap_or(0)
    }
}
