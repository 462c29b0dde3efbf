//! Minimal CPU layers for the difference-mask branch.
//!
//! Tensors follow the NCHW convention of the exported backbones. Only what the
//! mask generator and projection head need is implemented: a same-padded
//! convolution, PReLU, batch normalization, a dense layer and sigmoid.

use crate::params::{join, Module, Parameter};
use ndarray::{
    s, Array1, Array2, Array4, ArrayD, ArrayView2, ArrayView4, ArrayViewD, Axis, Ix1, Ix2, Ix4, IxDyn,
};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use thiserror::Error;

const BATCH_NORM_EPS: f32 = 1e-5;
const BATCH_NORM_MOMENTUM: f32 = 0.1;
const PRELU_INIT: f32 = 0.25;

#[derive(Error, Debug)]
pub enum LayerError {
    #[error("tensor shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("{layer}: expected {expected} input channels/features, got {actual}")]
    Features {
        layer: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("batch norm needs more than one value per channel in training mode")]
    SingleValueBatch,
}

/// Forward-pass mode.
///
/// `Train` normalizes with batch statistics and updates running statistics;
/// `Eval` uses the running statistics and leaves the layer untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    Train,
    #[default]
    Eval,
}

/// Xavier/Glorot uniform initializer: U(-b, b) with b = sqrt(6 / (fan_in + fan_out)).
pub fn xavier_uniform<R: Rng + ?Sized>(
    shape: &[usize],
    fan_in: usize,
    fan_out: usize,
    rng: &mut R,
) -> ArrayD<f32> {
    let bound = (6.0 / (fan_in + fan_out) as f32).sqrt();
    let dist = Uniform::new_inclusive(-bound, bound);
    ArrayD::from_shape_simple_fn(IxDyn(shape), || dist.sample(rng))
}

/// Logistic sigmoid, elementwise.
pub fn sigmoid(x: &ArrayD<f32>) -> ArrayD<f32> {
    x.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

/// 2-D convolution with stride 1, symmetric zero padding and no bias.
#[derive(Debug, Clone)]
pub struct Conv2d {
    pub weight: Parameter,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    padding: usize,
}

impl Conv2d {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        padding: usize,
        rng: &mut R,
    ) -> Self {
        let receptive = kernel * kernel;
        let weight = xavier_uniform(
            &[out_channels, in_channels, kernel, kernel],
            in_channels * receptive,
            out_channels * receptive,
            rng,
        );
        Self {
            weight: Parameter::new(weight),
            in_channels,
            out_channels,
            kernel,
            padding,
        }
    }

    pub fn forward(&self, x: ArrayView4<f32>) -> Result<Array4<f32>, LayerError> {
        let (n, c, h, w) = x.dim();
        if c != self.in_channels {
            return Err(LayerError::Features {
                layer: "conv2d",
                expected: self.in_channels,
                actual: c,
            });
        }
        let weight = self.weight.value.view().into_dimensionality::<Ix4>()?;
        let (k, p) = (self.kernel, self.padding);

        let mut padded = Array4::<f32>::zeros((n, c, h + 2 * p, w + 2 * p));
        padded.slice_mut(s![.., .., p..p + h, p..p + w]).assign(&x);

        let out_h = h + 2 * p + 1 - k;
        let out_w = w + 2 * p + 1 - k;
        let mut out = Array4::<f32>::zeros((n, self.out_channels, out_h, out_w));

        for b in 0..n {
            for o in 0..self.out_channels {
                let mut plane = out.slice_mut(s![b, o, .., ..]);
                for i in 0..c {
                    for ky in 0..k {
                        for kx in 0..k {
                            let wv = weight[[o, i, ky, kx]];
                            if wv == 0.0 {
                                continue;
                            }
                            let window = padded.slice(s![b, i, ky..ky + out_h, kx..kx + out_w]);
                            plane.scaled_add(wv, &window);
                        }
                    }
                }
            }
        }

        Ok(out)
    }
}

impl Module for Conv2d {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Parameter)) {
        f(join(prefix, "weight"), &self.weight);
    }

    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Parameter)) {
        f(join(prefix, "weight"), &mut self.weight);
    }
}

/// Parametric ReLU with one learned slope per channel (axis 1).
#[derive(Debug, Clone)]
pub struct PRelu {
    pub weight: Parameter,
}

impl PRelu {
    pub fn new(channels: usize) -> Self {
        Self {
            weight: Parameter::new(ArrayD::from_elem(IxDyn(&[channels]), PRELU_INIT)),
        }
    }

    pub fn forward(&self, x: ArrayViewD<f32>) -> Result<ArrayD<f32>, LayerError> {
        let slopes = self.weight.value.view().into_dimensionality::<Ix1>()?;
        let channels = x.shape().get(1).copied().unwrap_or(0);
        if channels != slopes.len() {
            return Err(LayerError::Features {
                layer: "prelu",
                expected: slopes.len(),
                actual: channels,
            });
        }

        let mut y = x.to_owned();
        for (ch, mut lane) in y.axis_iter_mut(Axis(1)).enumerate() {
            let a = slopes[ch];
            lane.mapv_inplace(|v| if v >= 0.0 { v } else { a * v });
        }
        Ok(y)
    }
}

impl Module for PRelu {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Parameter)) {
        f(join(prefix, "weight"), &self.weight);
    }

    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Parameter)) {
        f(join(prefix, "weight"), &mut self.weight);
    }
}

/// Batch normalization over axis 1; serves both `N×C` and `N×C×H×W` inputs.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    pub weight: Parameter,
    pub bias: Parameter,
    pub running_mean: Parameter,
    pub running_var: Parameter,
    num_features: usize,
}

impl BatchNorm {
    pub fn new(num_features: usize) -> Self {
        let shape = IxDyn(&[num_features]);
        Self {
            weight: Parameter::new(ArrayD::ones(shape.clone())),
            bias: Parameter::new(ArrayD::zeros(shape.clone())),
            running_mean: Parameter::buffer(ArrayD::zeros(shape.clone())),
            running_var: Parameter::buffer(ArrayD::ones(shape)),
            num_features,
        }
    }

    pub fn forward(&mut self, x: ArrayViewD<f32>, mode: Mode) -> Result<ArrayD<f32>, LayerError> {
        let shape = x.shape().to_vec();
        let channels = shape.get(1).copied().unwrap_or(0);
        if shape.len() < 2 || channels != self.num_features {
            return Err(LayerError::Features {
                layer: "batch_norm",
                expected: self.num_features,
                actual: channels,
            });
        }
        let n = shape[0];
        let rest: usize = shape[2..].iter().product();
        let x3 = x.to_shape((n, channels, rest))?;

        let (mean, var) = match mode {
            Mode::Train => {
                let count = n * rest;
                if count < 2 {
                    return Err(LayerError::SingleValueBatch);
                }
                let mean = x3.sum_axis(Axis(2)).sum_axis(Axis(0)) / count as f32;
                let centered = &x3 - &mean.view().insert_axis(Axis(0)).insert_axis(Axis(2));
                let var = centered.mapv(|v| v * v).sum_axis(Axis(2)).sum_axis(Axis(0)) / count as f32;

                let unbiased = &var * (count as f32 / (count - 1) as f32);
                let m = BATCH_NORM_MOMENTUM;
                self.running_mean
                    .value
                    .zip_mut_with(&mean, |r, &b| *r = (1.0 - m) * *r + m * b);
                self.running_var
                    .value
                    .zip_mut_with(&unbiased, |r, &b| *r = (1.0 - m) * *r + m * b);
                (mean, var)
            }
            Mode::Eval => (
                self.running_mean.value.view().into_dimensionality::<Ix1>()?.to_owned(),
                self.running_var.value.view().into_dimensionality::<Ix1>()?.to_owned(),
            ),
        };

        let gamma = self.weight.value.view().into_dimensionality::<Ix1>()?;
        let beta = self.bias.value.view().into_dimensionality::<Ix1>()?;
        let scale = Array1::from_shape_fn(channels, |c| gamma[c] / (var[c] + BATCH_NORM_EPS).sqrt());
        let shift = Array1::from_shape_fn(channels, |c| beta[c] - mean[c] * scale[c]);

        let scale3 = scale.into_shape_with_order((1, channels, 1))?;
        let shift3 = shift.into_shape_with_order((1, channels, 1))?;
        let y = &x3 * &scale3 + &shift3;

        Ok(y.into_shape_with_order(IxDyn(&shape))?)
    }
}

impl Module for BatchNorm {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Parameter)) {
        f(join(prefix, "weight"), &self.weight);
        f(join(prefix, "bias"), &self.bias);
        f(join(prefix, "running_mean"), &self.running_mean);
        f(join(prefix, "running_var"), &self.running_var);
    }

    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Parameter)) {
        f(join(prefix, "weight"), &mut self.weight);
        f(join(prefix, "bias"), &mut self.bias);
        f(join(prefix, "running_mean"), &mut self.running_mean);
        f(join(prefix, "running_var"), &mut self.running_var);
    }
}

/// Fully connected layer, `y = x Wᵀ + b`.
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Parameter,
    pub bias: Parameter,
    in_features: usize,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        Self {
            weight: Parameter::new(xavier_uniform(
                &[out_features, in_features],
                in_features,
                out_features,
                rng,
            )),
            bias: Parameter::new(ArrayD::zeros(IxDyn(&[out_features]))),
            in_features,
        }
    }

    pub fn forward(&self, x: ArrayView2<f32>) -> Result<Array2<f32>, LayerError> {
        if x.ncols() != self.in_features {
            return Err(LayerError::Features {
                layer: "linear",
                expected: self.in_features,
                actual: x.ncols(),
            });
        }
        let w = self.weight.value.view().into_dimensionality::<Ix2>()?;
        let b = self.bias.value.view().into_dimensionality::<Ix1>()?;
        Ok(x.dot(&w.t()) + &b)
    }
}

impl Module for Linear {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Parameter)) {
        f(join(prefix, "weight"), &self.weight);
        f(join(prefix, "bias"), &self.bias);
    }

    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Parameter)) {
        f(join(prefix, "weight"), &mut self.weight);
        f(join(prefix, "bias"), &mut self.bias);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_xavier_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let w = xavier_uniform(&[16, 8], 8, 16, &mut rng);
        let bound = (6.0f32 / 24.0).sqrt();
        assert_eq!(w.shape(), &[16, 8]);
        assert!(w.iter().all(|v| v.abs() <= bound));
        assert!(w.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_conv_identity_kernel() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut conv = Conv2d::new(1, 1, 3, 1, &mut rng);
        conv.weight.value.fill(0.0);
        conv.weight.value[[0, 0, 1, 1]] = 1.0;

        let x = Array::from_shape_fn((1, 1, 4, 3), |(_, _, y, x)| (y * 3 + x) as f32);
        let y = conv.forward(x.view()).unwrap();
        assert_eq!(y, x);
    }

    #[test]
    fn test_conv_zero_padding_sum() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut conv = Conv2d::new(1, 1, 3, 1, &mut rng);
        conv.weight.value.fill(1.0);

        let x = Array4::<f32>::ones((1, 1, 3, 3));
        let y = conv.forward(x.view()).unwrap();
        // Corner sees a 2x2 window, edge 2x3, center 3x3.
        assert_eq!(y[[0, 0, 0, 0]], 4.0);
        assert_eq!(y[[0, 0, 0, 1]], 6.0);
        assert_eq!(y[[0, 0, 1, 1]], 9.0);
    }

    #[test]
    fn test_conv_channel_mismatch() {
        let mut rng = StdRng::seed_from_u64(0);
        let conv = Conv2d::new(2, 2, 3, 1, &mut rng);
        let x = Array4::<f32>::zeros((1, 3, 2, 2));
        assert!(matches!(conv.forward(x.view()), Err(LayerError::Features { .. })));
    }

    #[test]
    fn test_prelu_slopes() {
        let prelu = PRelu::new(2);
        let x = array![[-4.0f32, 2.0], [1.0, -1.0]].into_dyn();
        let y = prelu.forward(x.view()).unwrap();
        assert_eq!(y, array![[-1.0f32, 2.0], [1.0, -0.25]].into_dyn());
    }

    #[test]
    fn test_batch_norm_init() {
        let bn = BatchNorm::new(4);
        assert!(bn.weight.value.iter().all(|&v| v == 1.0));
        assert!(bn.bias.value.iter().all(|&v| v == 0.0));
        assert!(bn.running_mean.is_buffer());
    }

    #[test]
    fn test_batch_norm_train_normalizes() {
        let mut bn = BatchNorm::new(2);
        let x = array![[1.0f32, 10.0], [3.0, 30.0]].into_dyn();
        let y = bn.forward(x.view(), Mode::Train).unwrap();
        for c in 0..2 {
            let col: Vec<f32> = (0..2).map(|n| y[[n, c]]).collect();
            assert!((col[0] + 1.0).abs() < 1e-3, "got {col:?}");
            assert!((col[1] - 1.0).abs() < 1e-3, "got {col:?}");
        }
        // running_mean = 0.9 * 0 + 0.1 * batch_mean
        assert!((bn.running_mean.value[[0]] - 0.2).abs() < 1e-6);
        assert!((bn.running_mean.value[[1]] - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_batch_norm_eval_uses_running_stats() {
        let mut bn = BatchNorm::new(1);
        bn.running_mean.value.fill(2.0);
        bn.running_var.value.fill(4.0);
        let x = array![[[[4.0f32]]]].into_dyn();
        let y = bn.forward(x.view(), Mode::Eval).unwrap();
        assert!((y[[0, 0, 0, 0]] - 1.0).abs() < 1e-4);
        assert_eq!(bn.running_mean.value[[0]], 2.0);
    }

    #[test]
    fn test_batch_norm_single_value_train() {
        let mut bn = BatchNorm::new(3);
        let x = ArrayD::<f32>::zeros(IxDyn(&[1, 3]));
        assert!(matches!(bn.forward(x.view(), Mode::Train), Err(LayerError::SingleValueBatch)));
    }

    #[test]
    fn test_linear_forward() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut fc = Linear::new(2, 1, &mut rng);
        fc.weight.value.assign(&array![[2.0f32, -1.0]].into_dyn());
        fc.bias.value.fill(0.5);
        let y = fc.forward(array![[3.0f32, 1.0]].view()).unwrap();
        assert_eq!(y, array![[5.5f32]]);
    }

    #[test]
    fn test_sigmoid_range() {
        let x = array![-100.0f32, 0.0, 100.0].into_dyn();
        let y = sigmoid(&x);
        assert_eq!(y[[1]], 0.5);
        assert!(y.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }
}
