//! Identity-labelled face pairs.
//!
//! A dataset file is either a JSON array of records or JSON Lines (`.jsonl`,
//! one record per line). Relative image paths resolve against the directory
//! holding the dataset file.
//!
//! ```json
//! {"source": "masked/0001.jpg", "target": "clean/0001.jpg", "id_class": "0001", "same": true}
//! ```

use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("dataset io: {0}")]
    Io(#[from] std::io::Error),
    #[error("dataset json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("dataset line {line}: {source}")]
    Line {
        line: usize,
        source: serde_json::Error,
    },
    #[error("dataset {0} has no records")]
    Empty(PathBuf),
    #[error("image {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("record index {index} out of range for {len} records")]
    OutOfRange { index: usize, len: usize },
}

/// One source/target pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairRecord {
    pub source: PathBuf,
    pub target: PathBuf,
    /// Identity class; numeric labels are read as their decimal string.
    #[serde(deserialize_with = "class_label")]
    pub id_class: String,
    #[serde(default)]
    pub same: Option<bool>,
}

fn class_label<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Label {
        Text(String),
        Int(i64),
    }
    Ok(match Label::deserialize(deserializer)? {
        Label::Text(s) => s,
        Label::Int(n) => n.to_string(),
    })
}

/// A decoded pair, resized to the crop size.
#[derive(Debug, Clone)]
pub struct PairSample {
    pub source: RgbImage,
    pub target: RgbImage,
    pub label: usize,
    pub same: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct PairDataset {
    records: Vec<PairRecord>,
    root: PathBuf,
    classes: BTreeMap<String, usize>,
}

impl PairDataset {
    /// Build a dataset from in-memory records; relative paths resolve against `root`.
    pub fn from_records(records: Vec<PairRecord>, root: impl Into<PathBuf>) -> Self {
        let classes = records
            .iter()
            .map(|r| r.id_class.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .enumerate()
            .map(|(idx, name)| (name, idx))
            .collect();
        Self {
            records,
            root: root.into(),
            classes,
        }
    }

    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let records = if path.extension().is_some_and(|ext| ext == "jsonl") {
            read_json_lines(path)?
        } else {
            serde_json::from_reader(BufReader::new(File::open(path)?))?
        };
        if records.is_empty() {
            return Err(DatasetError::Empty(path.to_path_buf()));
        }

        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let dataset = Self::from_records(records, root);
        tracing::info!(
            path = %path.display(),
            records = dataset.len(),
            classes = dataset.num_classes(),
            "dataset loaded"
        );
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[PairRecord] {
        &self.records
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Dense class index for an identity label.
    pub fn class_index(&self, id_class: &str) -> Option<usize> {
        self.classes.get(id_class).copied()
    }

    /// Identity label per record, in record order.
    pub fn labels(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.id_class.as_str()).collect()
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Decode record `index`, resizing both images to `height × width`.
    pub fn get(&self, index: usize, height: u32, width: u32) -> Result<PairSample, DatasetError> {
        let record = self.records.get(index).ok_or(DatasetError::OutOfRange {
            index,
            len: self.records.len(),
        })?;
        let source = self.decode(&record.source, height, width)?;
        let target = self.decode(&record.target, height, width)?;
        Ok(PairSample {
            source,
            target,
            label: self.classes[&record.id_class],
            same: record.same,
        })
    }

    fn decode(&self, path: &Path, height: u32, width: u32) -> Result<RgbImage, DatasetError> {
        let path = self.resolve(path);
        let image = image::open(&path)
            .map_err(|source| DatasetError::Image { path: path.clone(), source })?
            .to_rgb8();
        if image.dimensions() == (width, height) {
            return Ok(image);
        }
        Ok(imageops::resize(&image, width, height, FilterType::Triangle))
    }
}

fn read_json_lines(path: &Path) -> Result<Vec<PairRecord>, DatasetError> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| DatasetError::Line {
            line: idx + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}
