use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{BatchSampler, DataError, Split, TokenBatch};

/// Training and held-out token streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSplits {
    train: Vec<i32>,
    eval: Vec<i32>,
}

impl TokenSplits {
    pub fn new(train: Vec<i32>, eval: Vec<i32>) -> Self {
        Self { train, eval }
    }

    pub fn tokens(&self, split: Split) -> &[i32] {
        match split {
            Split::Train => &self.train,
            Split::Eval => &self.eval,
        }
    }

    /// Number of valid window starts for rows of `length + 1` tokens.
    fn num_starts(
        &self,
        split: Split,
        batch_size: usize,
        length: usize,
    ) -> Result<usize, DataError> {
        if batch_size == 0 || length == 0 {
            return Err(DataError::EmptyBatch { batch_size, length });
        }
        let len = self.tokens(split).len();
        match len.checked_sub(length + 1) {
            Some(starts) if starts > 0 => Ok(starts),
            _ => Err(DataError::SplitTooShort { split, len, length }),
        }
    }

    fn gather(
        &self,
        split: Split,
        starts: impl Iterator<Item = usize>,
        batch_size: usize,
        length: usize,
    ) -> TokenBatch {
        let data = self.tokens(split);
        let mut tokens = Vec::with_capacity(batch_size * (length + 1));
        for start in starts {
            tokens.extend_from_slice(&data[start..start + length + 1]);
        }
        TokenBatch {
            tokens,
            batch_size,
            length,
        }
    }
}

/// Samples windows at uniformly random offsets from a seeded stream.
#[derive(Debug)]
pub struct UniformSampler {
    splits: TokenSplits,
    rng: ChaCha8Rng,
}

impl UniformSampler {
    pub fn new(splits: TokenSplits, seed: u64) -> Self {
        Self {
            splits,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn splits(&self) -> &TokenSplits {
        &self.splits
    }
}

impl BatchSampler for UniformSampler {
    fn split_len(&self, split: Split) -> usize {
        self.splits.tokens(split).len()
    }

    fn sample_batch(
        &mut self,
        split: Split,
        batch_size: usize,
        length: usize,
    ) -> Result<TokenBatch, DataError> {
        let num_starts = self.splits.num_starts(split, batch_size, length)?;
        let starts: Vec<usize> = (0..batch_size)
            .map(|_| self.rng.random_range(0..num_starts))
            .collect();
        Ok(self
            .splits
            .gather(split, starts.into_iter(), batch_size, length))
    }

    fn fixed_batch(
        &self,
        split: Split,
        index: usize,
        batch_size: usize,
        length: usize,
    ) -> Result<TokenBatch, DataError> {
        let num_starts = self.splits.num_starts(split, batch_size, length)?;
        let first_row = index * batch_size;
        // consecutive rows tile the split end to end, wrapping once they run off the end
        let starts =
            (first_row..first_row + batch_size).map(|row| (row * (length + 1)) % num_starts);
        Ok(self.splits.gather(split, starts, batch_size, length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn counting(n: i32) -> TokenSplits {
        TokenSplits::new((0..n).collect(), (1000..1000 + n).collect())
    }

    #[test]
    fn rows_are_contiguous_windows() {
        let mut sampler = UniformSampler::new(counting(500), 0);
        let batch = sampler.sample_batch(Split::Train, 8, 16).unwrap();
        assert_eq!(batch.tokens.len(), 8 * 17);
        for row in batch.rows() {
            assert_eq!(row.len(), 17);
            for pair in row.windows(2) {
                assert_eq!(pair[1], pair[0] + 1);
            }
            assert!(*row.last().unwrap() < 500);
        }
    }

    #[test]
    fn eval_split_is_separate() {
        let mut sampler = UniformSampler::new(counting(100), 0);
        let batch = sampler.sample_batch(Split::Eval, 2, 4).unwrap();
        assert!(batch.tokens.iter().all(|t| *t >= 1000));
    }

    #[test]
    fn same_seed_same_batches() {
        let mut a = UniformSampler::new(counting(1000), 9);
        let mut b = UniformSampler::new(counting(1000), 9);
        for _ in 0..5 {
            assert_eq!(
                a.sample_batch(Split::Train, 4, 8).unwrap(),
                b.sample_batch(Split::Train, 4, 8).unwrap()
            );
        }
    }

    #[test]
    fn fixed_batches_tile_and_repeat() {
        let sampler = UniformSampler::new(counting(100), 0);
        let first = sampler.fixed_batch(Split::Eval, 0, 2, 9).unwrap();
        assert_eq!(first.rows().next().unwrap()[0], 1000);
        assert_eq!(first.rows().nth(1).unwrap()[0], 1010);
        assert_eq!(first, sampler.fixed_batch(Split::Eval, 0, 2, 9).unwrap());
        let wrapped = sampler.fixed_batch(Split::Eval, 50, 2, 9).unwrap();
        assert!(wrapped.rows().all(|row| row.len() == 10 && row[9] < 1100));
    }

    #[test]
    fn short_split_is_an_error() {
        let mut sampler = UniformSampler::new(counting(10), 0);
        assert_eq!(
            sampler.sample_batch(Split::Train, 1, 9).unwrap_err(),
            DataError::SplitTooShort {
                split: Split::Train,
                len: 10,
                length: 9
            }
        );
        assert!(matches!(
            sampler.fixed_batch(Split::Train, 0, 0, 4),
            Err(DataError::EmptyBatch { .. })
        ));
    }
}
