use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid training configuration: {0}")]
    Invalid(String),
}

/// Training hyperparameters, loaded from a TOML file.
///
/// Every field has a default, so a file only lists what it overrides:
///
/// ```toml
/// df_path = "data/pairs.jsonl"
/// batch_size = 64
/// momentum = 0.9
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    /// Decoding threads per loader; 0 decodes on the calling thread.
    pub num_workers: usize,
    /// Pair dataset (JSON array or JSON Lines).
    pub df_path: PathBuf,
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    /// Crop size as `[height, width]`.
    pub input_size: [u32; 2],
    /// Output pixels of context kept around each face crop.
    pub margin: u32,
    /// Standardize face crops before they reach the backbone.
    pub mtcnn_norm: bool,
    /// Pick the face with the largest box rather than the most confident one.
    pub select_largest: bool,
    /// Keep every detected face instead of only the selected one.
    pub keep_all: bool,
    /// Seed for the split, loader shuffling and weight initialization.
    pub seed: u64,
    /// Fraction of each identity class held out for validation.
    pub val_fraction: f32,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            num_workers: 0,
            df_path: PathBuf::from("pairs.jsonl"),
            lr: 0.02,
            momentum: 0.9,
            weight_decay: 5e-4,
            input_size: [112, 96],
            margin: 0,
            mtcnn_norm: true,
            select_largest: true,
            keep_all: false,
            seed: 42,
            val_fraction: 0.2,
        }
    }
}

impl TrainConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text).map_err(|e| match e {
            ConfigError::Toml { source, .. } => ConfigError::Toml {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        tracing::info!(path = %path.display(), ?config, "training config loaded");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Toml {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        if !(self.lr > 0.0) {
            return Err(ConfigError::Invalid(format!("lr must be positive, got {}", self.lr)));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(ConfigError::Invalid(format!("momentum must be in [0, 1), got {}", self.momentum)));
        }
        if self.weight_decay < 0.0 {
            return Err(ConfigError::Invalid("weight_decay must not be negative".into()));
        }
        if !(self.val_fraction > 0.0 && self.val_fraction < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "val_fraction must be in (0, 1), got {}",
                self.val_fraction
            )));
        }
        if self.input_size.contains(&0) {
            return Err(ConfigError::Invalid("input_size must be non-zero".into()));
        }
        if self.margin >= self.height().min(self.width()) {
            return Err(ConfigError::Invalid(format!(
                "margin {} leaves no room for the face in a {}x{} crop",
                self.margin,
                self.height(),
                self.width()
            )));
        }
        Ok(())
    }

    pub fn height(&self) -> u32 {
        self.input_size[0]
    }

    pub fn width(&self) -> u32 {
        self.input_size[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TrainConfig::default();
        assert_eq!(config.lr, 0.02);
        assert_eq!(config.seed, 42);
        assert_eq!((config.height(), config.width()), (112, 96));
        assert!(config.select_largest);
        assert_eq!(config.margin, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = TrainConfig::from_toml(
            r#"
            df_path = "data/pairs.json"
            batch_size = 8
            num_workers = 4
            weight_decay = 0.0
            "#,
        )
        .unwrap();
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.df_path, PathBuf::from("data/pairs.json"));
        assert_eq!(config.weight_decay, 0.0);
        assert_eq!(config.lr, 0.02);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            TrainConfig::from_toml("batch_size = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(TrainConfig::from_toml("momentum = 1.5").is_err());
        assert!(TrainConfig::from_toml("input_size = [112, 0]").is_err());
        assert!(TrainConfig::from_toml("margin = 96").is_err());
        assert!(TrainConfig::from_toml("margin = 32").is_ok());
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            TrainConfig::from_toml("batch_size = \"many\""),
            Err(ConfigError::Toml { .. })
        ));
    }
}
