//! Siamese difference-mask branch.
//!
//! Given backbone feature maps for a source and a target face, the branch
//! learns a soft spatial mask from their absolute difference, applies it to
//! both maps and projects each masked map into a comparison embedding:
//!
//! ```text
//! diff = |f1 - f2|
//! mask = sigmoid(bn(prelu(conv3x3(diff))))
//! e_i  = bn(linear(bn(flatten(f_i * mask))))
//! ```
//!
//! Parameter names follow the sequential layout of the trained checkpoints:
//! `sia.0` conv, `sia.1` PReLU, `sia.2` batch norm, `fc.0` batch norm,
//! `fc.1` linear, `fc.2` batch norm.

use crate::layers::{sigmoid, BatchNorm, Conv2d, LayerError, Linear, Mode, PRelu};
use crate::params::{join, Module, Parameter};
use ndarray::{Array2, Array4, ArrayView3, ArrayView4, Axis, Ix2, Ix4};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FEATURE_CHANNELS: usize = 512;
pub const FEATURE_HEIGHT: usize = 7;
pub const FEATURE_WIDTH: usize = 6;
pub const COMPARISON_DIM: usize = 512;
const MASK_KERNEL: usize = 3;
const MASK_PADDING: usize = 1;
const DEFAULT_SEED: u64 = 42;

#[derive(Error, Debug)]
pub enum MaskError {
    #[error("feature map shape mismatch: source {source_shape:?}, target {target_shape:?}")]
    ShapeMismatch {
        source_shape: Vec<usize>,
        target_shape: Vec<usize>,
    },
    #[error("feature map {actual:?} does not match configured C×H×W {expected:?}")]
    UnexpectedShape {
        expected: [usize; 3],
        actual: Vec<usize>,
    },
    #[error("layer: {0}")]
    Layer(#[from] LayerError),
    #[error("tensor shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Shape and initialization settings for [`DiffMask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffMaskConfig {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub embedding_dim: usize,
    /// Seed for Xavier initialization of conv and linear weights.
    pub seed: u64,
}

impl Default for DiffMaskConfig {
    fn default() -> Self {
        Self {
            channels: FEATURE_CHANNELS,
            height: FEATURE_HEIGHT,
            width: FEATURE_WIDTH,
            embedding_dim: COMPARISON_DIM,
            seed: DEFAULT_SEED,
        }
    }
}

impl DiffMaskConfig {
    pub fn flattened(&self) -> usize {
        self.channels * self.height * self.width
    }
}

/// Everything the branch produces for one pair batch.
#[derive(Debug, Clone)]
pub struct DiffMaskOutput {
    pub source_masked: Array4<f32>,
    pub target_masked: Array4<f32>,
    pub source_embedding: Array2<f32>,
    pub target_embedding: Array2<f32>,
    pub diff: Array4<f32>,
    pub mask: Array4<f32>,
}

/// conv3x3 → PReLU → BatchNorm2d → sigmoid.
#[derive(Debug, Clone)]
struct MaskGenerator {
    conv: Conv2d,
    prelu: PRelu,
    bn: BatchNorm,
}

/// BatchNorm1d → Linear → BatchNorm1d, shared by both branches.
#[derive(Debug, Clone)]
struct Projection {
    bn_in: BatchNorm,
    linear: Linear,
    bn_out: BatchNorm,
}

#[derive(Debug, Clone)]
pub struct DiffMask {
    config: DiffMaskConfig,
    sia: MaskGenerator,
    fc: Projection,
}

impl DiffMask {
    pub fn new(config: DiffMaskConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let c = config.channels;

        let sia = MaskGenerator {
            conv: Conv2d::new(c, c, MASK_KERNEL, MASK_PADDING, &mut rng),
            prelu: PRelu::new(c),
            bn: BatchNorm::new(c),
        };
        let fc = Projection {
            bn_in: BatchNorm::new(config.flattened()),
            linear: Linear::new(config.flattened(), config.embedding_dim, &mut rng),
            bn_out: BatchNorm::new(config.embedding_dim),
        };

        tracing::debug!(
            channels = c,
            height = config.height,
            width = config.width,
            embedding_dim = config.embedding_dim,
            seed = config.seed,
            "difference mask initialized"
        );

        Self { config, sia, fc }
    }

    pub fn config(&self) -> &DiffMaskConfig {
        &self.config
    }

    /// Run the branch on batched `N×C×H×W` feature maps.
    pub fn forward(
        &mut self,
        source: ArrayView4<f32>,
        target: ArrayView4<f32>,
        mode: Mode,
    ) -> Result<DiffMaskOutput, MaskError> {
        self.check_shapes(&source, &target)?;

        let diff = (&source - &target).mapv(f32::abs);

        let mask = {
            let x = self.sia.conv.forward(diff.view())?;
            let x = self.sia.prelu.forward(x.into_dyn().view())?;
            let x = self.sia.bn.forward(x.view(), mode)?;
            sigmoid(&x).into_dimensionality::<Ix4>()?
        };

        let source_masked = &source * &mask;
        let target_masked = &target * &mask;

        let source_embedding = self.project(&source_masked, mode)?;
        let target_embedding = self.project(&target_masked, mode)?;

        Ok(DiffMaskOutput {
            source_masked,
            target_masked,
            source_embedding,
            target_embedding,
            diff,
            mask,
        })
    }

    /// Run the branch on a single unbatched `C×H×W` pair.
    pub fn forward_pair(
        &mut self,
        source: ArrayView3<f32>,
        target: ArrayView3<f32>,
        mode: Mode,
    ) -> Result<DiffMaskOutput, MaskError> {
        self.forward(source.insert_axis(Axis(0)), target.insert_axis(Axis(0)), mode)
    }

    fn project(&mut self, masked: &Array4<f32>, mode: Mode) -> Result<Array2<f32>, MaskError> {
        let n = masked.len_of(Axis(0));
        let flat = masked
            .to_shape((n, self.config.flattened()))?
            .into_owned()
            .into_dyn();
        let x = self.fc.bn_in.forward(flat.view(), mode)?;
        let x = self.fc.linear.forward(x.view().into_dimensionality::<Ix2>()?)?;
        let x = self.fc.bn_out.forward(x.into_dyn().view(), mode)?;
        Ok(x.into_dimensionality::<Ix2>()?)
    }

    fn check_shapes(&self, source: &ArrayView4<f32>, target: &ArrayView4<f32>) -> Result<(), MaskError> {
        if source.shape() != target.shape() {
            return Err(MaskError::ShapeMismatch {
                source_shape: source.shape().to_vec(),
                target_shape: target.shape().to_vec(),
            });
        }
        let expected = [self.config.channels, self.config.height, self.config.width];
        if source.shape()[1..] != expected {
            return Err(MaskError::UnexpectedShape {
                expected,
                actual: source.shape().to_vec(),
            });
        }
        Ok(())
    }
}

impl Module for DiffMask {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Parameter)) {
        let sia = join(prefix, "sia");
        self.sia.conv.visit(&join(&sia, "0"), f);
        self.sia.prelu.visit(&join(&sia, "1"), f);
        self.sia.bn.visit(&join(&sia, "2"), f);
        let fc = join(prefix, "fc");
        self.fc.bn_in.visit(&join(&fc, "0"), f);
        self.fc.linear.visit(&join(&fc, "1"), f);
        self.fc.bn_out.visit(&join(&fc, "2"), f);
    }

    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Parameter)) {
        let sia = join(prefix, "sia");
        self.sia.conv.visit_mut(&join(&sia, "0"), f);
        self.sia.prelu.visit_mut(&join(&sia, "1"), f);
        self.sia.bn.visit_mut(&join(&sia, "2"), f);
        let fc = join(prefix, "fc");
        self.fc.bn_in.visit_mut(&join(&fc, "0"), f);
        self.fc.linear.visit_mut(&join(&fc, "1"), f);
        self.fc.bn_out.visit_mut(&join(&fc, "2"), f);
    }
}
