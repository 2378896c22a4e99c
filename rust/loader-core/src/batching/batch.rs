// rust/loader-core/src/batching/batch.rs

use crate::dataset::Example;

/// A bounded-cost group of examples, before it is split across ranks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Batch {
    pub examples: Vec<Example>,
}

impl Batch {
    pub fn new(examples: Vec<Example>) -> Self {
        Self { examples }
    }

    /// Number of examples in the batch
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Example> {
        self.examples.iter()
    }
}

impl From<Vec<Example>> for Batch {
    fn from(examples: Vec<Example>) -> Self {
        Self::new(examples)
    }
}

impl IntoIterator for Batch {
    type Item = Example;
    type IntoIter = std::vec::IntoIter<Example>;

    fn into_iter(self) -> Self::IntoIter {
        self.examples.into_iter()
    }
}
