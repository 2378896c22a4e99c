// rust/loader-core/src/dataset/field.rs

//! Field shapes and tokenizers.
//!
//! Every aligned stream is tokenized by one `TokenField`. Only two shapes
//! exist: a flat token sequence, or a grid where each word is further split
//! into characters. Both are chosen from configuration at setup time.

use crate::config::{FieldsConfig, TokenizerBase};
use crate::error::{LoaderError, Result};

/// The tokens of one field of one example.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TokenSeq {
    Flat(Vec<String>),
    Grid(Vec<Vec<String>>),
}

impl TokenSeq {
    /// Number of top-level units: tokens for flat fields, words for grids.
    pub fn len(&self) -> usize {
        match self {
            Self::Flat(tokens) => tokens.len(),
            Self::Grid(words) => words.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of innermost tokens. Equal to `len` for flat fields.
    pub fn total_len(&self) -> usize {
        match self {
            Self::Flat(tokens) => tokens.len(),
            Self::Grid(words) => words.iter().map(Vec::len).sum(),
        }
    }
}

/// Maps a raw line to tokens and back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tokenizer {
    base: TokenizerBase,
}

impl Tokenizer {
    pub fn new(base: TokenizerBase) -> Self {
        Self { base }
    }

    pub fn base(&self) -> TokenizerBase {
        self.base
    }

    pub fn tokenize(&self, line: &str) -> Vec<String> {
        match self.base {
            TokenizerBase::Word => line.split_whitespace().map(str::to_string).collect(),
            TokenizerBase::Char => line.chars().map(String::from).collect(),
            TokenizerBase::Byte => line.bytes().map(|b| format!("{b:02x}")).collect(),
        }
    }

    /// Inverse of `tokenize`.
    ///
    /// Byte tokens that are not valid hex, or that do not decode to UTF-8,
    /// produce an empty string.
    pub fn detokenize(&self, tokens: &[String]) -> String {
        match self.base {
            TokenizerBase::Word => tokens.join(" "),
            TokenizerBase::Char => tokens.concat(),
            TokenizerBase::Byte => {
                let bytes: Option<Vec<u8>> = tokens
                    .iter()
                    .map(|t| u8::from_str_radix(t, 16).ok())
                    .collect();
                bytes
                    .and_then(|b| String::from_utf8(b).ok())
                    .unwrap_or_default()
            }
        }
    }
}

/// A field producing flat token sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatTokenField {
    pub name: String,
    pub tokenizer: Tokenizer,
    pub fix_length: Option<usize>,
}

/// A field producing one character sequence per whitespace-separated word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridTokenField {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenField {
    Flat(FlatTokenField),
    Grid(GridTokenField),
}

impl TokenField {
    /// Builds the field for one stream from the shared field configuration.
    ///
    /// # Errors
    ///
    /// Grid fields only exist at character level and cannot be padded to a
    /// fixed length.
    pub fn from_config(name: impl Into<String>, config: &FieldsConfig) -> Result<Self> {
        let name = name.into();
        if !config.grid {
            return Ok(Self::Flat(FlatTokenField {
                name,
                tokenizer: Tokenizer::new(config.base),
                fix_length: config.fix_length,
            }));
        }

        if config.base != TokenizerBase::Char {
            return Err(LoaderError::config(format!(
                "field '{name}': grid inputs only work at character level"
            )));
        }
        if config.fix_length.is_some() {
            return Err(LoaderError::config(format!(
                "field '{name}': fixed-length padding is not supported for grid fields"
            )));
        }
        Ok(Self::Grid(GridTokenField { name }))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Flat(f) => &f.name,
            Self::Grid(f) => &f.name,
        }
    }

    pub fn tokenize(&self, line: &str) -> TokenSeq {
        match self {
            Self::Flat(f) => TokenSeq::Flat(f.tokenizer.tokenize(line)),
            Self::Grid(_) => TokenSeq::Grid(
                line.split_whitespace()
                    .map(|word| word.chars().map(String::from).collect())
                    .collect(),
            ),
        }
    }

    pub fn detokenize(&self, seq: &TokenSeq) -> String {
        match (self, seq) {
            (Self::Flat(f), TokenSeq::Flat(tokens)) => f.tokenizer.detokenize(tokens),
            (_, TokenSeq::Grid(words)) => words
                .iter()
                .map(|w| w.concat())
                .collect::<Vec<_>>()
                .join(" "),
            (Self::Grid(_), TokenSeq::Flat(tokens)) => tokens.concat(),
        }
    }
}
