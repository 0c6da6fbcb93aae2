use std::sync::Arc;

use candle_core::Tensor;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::prelude::*;

use super::{
    source::{Sample, SampleSource, Target},
    Result,
};
use crate::TrainingError;

/// Parallel sequences of frames and their target sets.
///
/// Targets differ in object count, so samples are unzipped rather than
/// stacked; `inputs[i]` always belongs to `targets[i]`.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub inputs: Vec<Tensor>,
    pub targets: Vec<Target>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

pub fn collate(samples: Vec<Sample>) -> Batch {
    let (inputs, targets) = samples
        .into_iter()
        .map(|sample| (sample.input, sample.target))
        .unzip();
    Batch { inputs, targets }
}

/// Groups a sample source into ordered mini-batches.
pub struct DataLoader {
    source: Arc<dyn SampleSource>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    pool: Option<rayon::ThreadPool>,
}

impl DataLoader {
    /// `num_workers > 0` loads the samples of each batch on a dedicated pool;
    /// batch order and in-batch order are unaffected.
    pub fn new(
        source: Arc<dyn SampleSource>,
        batch_size: usize,
        shuffle: bool,
        num_workers: usize,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }

        let pool = if num_workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(num_workers)
                .thread_name(|idx| format!("data-worker-{idx}"))
                .build()
                .map_err(|err| {
                    TrainingError::initialization(format!(
                        "failed to start data worker pool: {err}"
                    ))
                })?;
            Some(pool)
        } else {
            None
        };

        Ok(Self {
            source,
            batch_size,
            shuffle,
            seed,
            pool,
        })
    }

    /// Number of samples served per epoch.
    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    /// Sample visiting order for `epoch`: a fresh permutation per epoch when
    /// shuffling, the source order otherwise.
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    pub fn batches(&self, epoch: usize) -> Batches<'_> {
        Batches {
            loader: self,
            order: self.epoch_order(epoch),
            cursor: 0,
        }
    }

    fn load(&self, indices: &[usize]) -> Result<Batch> {
        let samples: Result<Vec<Sample>> = match &self.pool {
            Some(pool) => pool.install(|| {
                indices
                    .par_iter()
                    .map(|&idx| self.source.sample(idx))
                    .collect()
            }),
            None => indices.iter().map(|&idx| self.source.sample(idx)).collect(),
        };
        Ok(collate(samples?))
    }
}

pub struct Batches<'a> {
    loader: &'a DataLoader,
    order: Vec<usize>,
    cursor: usize,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;
        Some(self.loader.load(indices))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.order.len() - self.cursor).div_ceil(self.loader.batch_size);
        (remaining, Some(remaining))
    }
}
