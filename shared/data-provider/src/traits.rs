use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Eval,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => f.write_str("train"),
            Split::Eval => f.write_str("eval"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataError {
    #[error("{split} split has {len} tokens, too few for sequences of length {length}")]
    SplitTooShort {
        split: Split,
        len: usize,
        length: usize,
    },

    #[error("requested an empty batch (batch_size={batch_size}, length={length})")]
    EmptyBatch { batch_size: usize, length: usize },
}

/// Row-major token ids, `batch_size` rows of `length + 1` tokens each.
///
/// The extra token per row lets callers split every row into inputs and next-token targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    pub tokens: Vec<i32>,
    pub batch_size: usize,
    pub length: usize,
}

impl TokenBatch {
    pub fn row_len(&self) -> usize {
        self.length + 1
    }

    pub fn rows(&self) -> impl Iterator<Item = &[i32]> {
        self.tokens.chunks(self.row_len())
    }

    pub fn num_tokens(&self) -> usize {
        self.batch_size * self.length
    }
}

pub trait BatchSampler {
    fn split_len(&self, split: Split) -> usize;

    /// Rows start at uniformly random offsets, drawn with replacement.
    fn sample_batch(
        &mut self,
        split: Split,
        batch_size: usize,
        length: usize,
    ) -> Result<TokenBatch, DataError>;

    /// The `index`-th batch of a deterministic sweep over `split`.
    fn fixed_batch(
        &self,
        split: Split,
        index: usize,
        batch_size: usize,
        length: usize,
    ) -> Result<TokenBatch, DataError>;
}
