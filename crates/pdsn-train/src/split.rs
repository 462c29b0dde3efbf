//! Stratified train/validation split.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::BTreeMap;

/// Record indices on each side of the split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Split {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
}

/// Per-class sizes of a split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassCounts {
    pub train: usize,
    pub val: usize,
}

/// Number of rows a class of size `n` contributes to validation.
///
/// Classes with at least two rows keep one row on each side. A singleton
/// class stays entirely in training.
fn val_count(n: usize, val_fraction: f32) -> usize {
    if n < 2 {
        return 0;
    }
    let wanted = (n as f32 * val_fraction).round() as usize;
    wanted.clamp(1, n - 1)
}

/// Split record indices so every class keeps its proportion on both sides.
///
/// The same labels, fraction and seed always produce the same split.
pub fn stratified_split<S: AsRef<str>>(labels: &[S], val_fraction: f32, seed: u64) -> Split {
    let mut by_class: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, label) in labels.iter().enumerate() {
        by_class.entry(label.as_ref()).or_default().push(idx);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::with_capacity(labels.len());
    let mut val = Vec::new();
    for (class, mut members) in by_class {
        members.shuffle(&mut rng);
        let n_val = val_count(members.len(), val_fraction);
        if n_val == 0 {
            tracing::debug!(class, rows = members.len(), "class too small to stratify, kept in training");
        }
        val.extend_from_slice(&members[..n_val]);
        train.extend_from_slice(&members[n_val..]);
    }

    train.shuffle(&mut rng);
    val.shuffle(&mut rng);
    tracing::debug!(train = train.len(), val = val.len(), seed, "stratified split");
    Split { train, val }
}

impl Split {
    /// Train/validation sizes per class label.
    pub fn class_counts<S: AsRef<str>>(&self, labels: &[S]) -> BTreeMap<String, ClassCounts> {
        let mut counts: BTreeMap<String, ClassCounts> = BTreeMap::new();
        for &idx in &self.train {
            counts
                .entry(labels[idx].as_ref().to_string())
                .or_insert(ClassCounts { train: 0, val: 0 })
                .train += 1;
        }
        for &idx in &self.val {
            counts
                .entry(labels[idx].as_ref().to_string())
                .or_insert(ClassCounts { train: 0, val: 0 })
                .val += 1;
        }
        counts
    }
}
