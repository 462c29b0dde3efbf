//! pdsn-train: data and optimization support for training the difference-mask branch.
//!
//! [`PairDataModule`] ties the pieces together: it reads the pair dataset
//! named in [`TrainConfig`], splits it per identity class, hands out the
//! training and validation loaders, and builds the optimizer.

pub mod config;
pub mod dataset;
pub mod loader;
pub mod loss;
pub mod optim;
pub mod split;

pub use config::{ConfigError, TrainConfig};
pub use dataset::{DatasetError, PairDataset, PairRecord};
pub use loader::{LoaderConfig, PairBatch, PairLoader};
pub use optim::{Sgd, SgdConfig};
pub use split::{stratified_split, Split};

use pdsn_core::CropConfig;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("dataset: {0}")]
    Dataset(#[from] DatasetError),
    #[error("loader thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Dataset, split and loaders for one training run.
pub struct PairDataModule {
    config: TrainConfig,
    dataset: Arc<PairDataset>,
    split: Split,
}

impl PairDataModule {
    /// Load the configured dataset and split it.
    pub fn prepare_data(config: TrainConfig) -> Result<Self, TrainError> {
        config.validate()?;
        let dataset = PairDataset::load(&config.df_path)?;
        Ok(Self::from_dataset(config, dataset))
    }

    pub fn from_dataset(config: TrainConfig, dataset: PairDataset) -> Self {
        let split = stratified_split(&dataset.labels(), config.val_fraction, config.seed);
        tracing::info!(
            train = split.train.len(),
            val = split.val.len(),
            classes = dataset.num_classes(),
            "data prepared"
        );
        Self {
            config,
            dataset: Arc::new(dataset),
            split,
        }
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn dataset(&self) -> &PairDataset {
        &self.dataset
    }

    pub fn split(&self) -> &Split {
        &self.split
    }

    pub fn train_dataloader(&self) -> Result<PairLoader, TrainError> {
        self.loader(self.split.train.clone(), true)
    }

    pub fn val_dataloader(&self) -> Result<PairLoader, TrainError> {
        self.loader(self.split.val.clone(), false)
    }

    fn loader(&self, indices: Vec<usize>, shuffle: bool) -> Result<PairLoader, TrainError> {
        let config = LoaderConfig {
            batch_size: self.config.batch_size,
            shuffle,
            num_workers: self.config.num_workers,
            height: self.config.height(),
            width: self.config.width(),
            seed: self.config.seed,
        };
        Ok(PairLoader::new(self.dataset.clone(), indices, config)?)
    }

    /// SGD over the trainable parameters.
    pub fn configure_optimizer(&self) -> Sgd {
        Sgd::new(SgdConfig {
            lr: self.config.lr,
            momentum: self.config.momentum,
            weight_decay: self.config.weight_decay,
        })
    }

    /// Face crop settings matching this run.
    pub fn crop_config(&self) -> CropConfig {
        CropConfig {
            height: self.config.height(),
            width: self.config.width(),
            margin: self.config.margin,
            post_process: self.config.mtcnn_norm,
            select_largest: self.config.select_largest,
            keep_all: self.config.keep_all,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::record;

    fn module() -> PairDataModule {
        let records = ["a", "a", "a", "a", "a", "b", "b", "b", "b", "b"]
            .iter()
            .map(|id| record(id))
            .collect();
        let config = TrainConfig {
            batch_size: 3,
            ..TrainConfig::default()
        };
        PairDataModule::from_dataset(config, PairDataset::from_records(records, "."))
    }

    #[test]
    fn test_loaders_cover_split() {
        let data = module();
        assert_eq!(data.split().train.len(), 8);
        assert_eq!(data.split().val.len(), 2);

        let train = data.train_dataloader().unwrap();
        assert!(train.config().shuffle);
        assert_eq!(train.num_batches(), 3);

        let val = data.val_dataloader().unwrap();
        assert!(!val.config().shuffle);
        assert_eq!(val.num_samples(), 2);
    }

    #[test]
    fn test_optimizer_and_crop_follow_config() {
        let data = module();
        let opt = data.configure_optimizer();
        assert_eq!(opt.config().lr, 0.02);
        assert_eq!(opt.config().momentum, data.config().momentum);

        let crop = data.crop_config();
        assert_eq!((crop.height, crop.width), (112, 96));
        assert!(crop.post_process);
        assert!(crop.select_largest);
    }

    #[test]
    fn test_prepare_data_missing_file() {
        let config = TrainConfig {
            df_path: "/nonexistent/pairs.json".into(),
            ..TrainConfig::default()
        };
        assert!(matches!(
            PairDataModule::prepare_data(config),
            Err(TrainError::Dataset(DatasetError::Io(_)))
        ));
    }
}
