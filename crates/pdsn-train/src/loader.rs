//! Batched pair loading.
//!
//! A loader owns an index order over a [`PairDataset`] and yields decoded
//! batches. Training loaders reshuffle every epoch from `seed + epoch`;
//! validation loaders keep the split order. Decoding runs on a dedicated
//! rayon pool when `num_workers > 0`.

use crate::dataset::{DatasetError, PairDataset, PairSample};
use image::RgbImage;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub num_workers: usize,
    pub height: u32,
    pub width: u32,
    pub seed: u64,
}

/// One decoded batch.
#[derive(Debug, Clone, Default)]
pub struct PairBatch {
    pub indices: Vec<usize>,
    pub sources: Vec<RgbImage>,
    pub targets: Vec<RgbImage>,
    pub labels: Vec<usize>,
    pub same: Vec<Option<bool>>,
}

impl PairBatch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    fn push(&mut self, index: usize, sample: PairSample) {
        self.indices.push(index);
        self.sources.push(sample.source);
        self.targets.push(sample.target);
        self.labels.push(sample.label);
        self.same.push(sample.same);
    }
}

pub struct PairLoader {
    dataset: Arc<PairDataset>,
    indices: Vec<usize>,
    config: LoaderConfig,
    pool: Option<ThreadPool>,
    epoch: u64,
}

impl PairLoader {
    pub fn new(
        dataset: Arc<PairDataset>,
        indices: Vec<usize>,
        config: LoaderConfig,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = if config.num_workers > 0 {
            Some(ThreadPoolBuilder::new().num_threads(config.num_workers).build()?)
        } else {
            None
        };
        Ok(Self {
            dataset,
            indices,
            config,
            pool,
            epoch: 0,
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Number of records this loader covers.
    pub fn num_samples(&self) -> usize {
        self.indices.len()
    }

    /// Number of batches per epoch; the last batch may be short.
    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.config.batch_size.max(1))
    }

    /// Record order for the next epoch, advancing the epoch counter.
    pub fn next_order(&mut self) -> Vec<usize> {
        let mut order = self.indices.clone();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(self.epoch));
            order.shuffle(&mut rng);
        }
        self.epoch += 1;
        order
    }

    /// Iterate one epoch of decoded batches.
    pub fn epoch(&mut self) -> Batches<'_> {
        let order = self.next_order();
        tracing::debug!(epoch = self.epoch - 1, batches = self.num_batches(), "loader epoch");
        Batches {
            loader: self,
            order,
            position: 0,
        }
    }

    /// Decode the records at `indices` into one batch.
    pub fn load_batch(&self, indices: &[usize]) -> Result<PairBatch, DatasetError> {
        let (h, w) = (self.config.height, self.config.width);
        let dataset = &self.dataset;
        let samples: Vec<PairSample> = match &self.pool {
            Some(pool) => pool.install(|| {
                indices
                    .par_iter()
                    .map(|&i| dataset.get(i, h, w))
                    .collect::<Result<_, _>>()
            })?,
            None => indices
                .iter()
                .map(|&i| dataset.get(i, h, w))
                .collect::<Result<_, _>>()?,
        };

        let mut batch = PairBatch::default();
        for (&index, sample) in indices.iter().zip(samples) {
            batch.push(index, sample);
        }
        Ok(batch)
    }
}

pub struct Batches<'a> {
    loader: &'a PairLoader,
    order: Vec<usize>,
    position: usize,
}

impl Iterator for Batches<'_> {
    type Item = Result<PairBatch, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.loader.config.batch_size.max(1)).min(self.order.len());
        let indices = &self.order[self.position..end];
        self.position = end;
        Some(self.loader.load_batch(indices))
    }
}
