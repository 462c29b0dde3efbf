//! Training losses with their gradients.
//!
//! Each loss returns the mean value together with the gradient with respect to
//! its prediction, ready to feed the optimizer.

use ndarray::{Array2, ArrayD, ArrayView2, ArrayViewD, Axis};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum LossError {
    #[error("shape mismatch: prediction {prediction:?}, target {target:?}")]
    ShapeMismatch {
        prediction: Vec<usize>,
        target: Vec<usize>,
    },
    #[error("class index {index} out of range for {classes} classes")]
    ClassOutOfRange { index: usize, classes: usize },
    #[error("empty batch")]
    Empty,
}

/// Loss value and gradient.
#[derive(Debug, Clone)]
pub struct LossOutput<G> {
    pub value: f32,
    pub grad: G,
}

/// Mean absolute error.
pub fn l1_loss(prediction: ArrayViewD<f32>, target: ArrayViewD<f32>) -> Result<LossOutput<ArrayD<f32>>, LossError> {
    if prediction.shape() != target.shape() {
        return Err(LossError::ShapeMismatch {
            prediction: prediction.shape().to_vec(),
            target: target.shape().to_vec(),
        });
    }
    let n = prediction.len();
    if n == 0 {
        return Err(LossError::Empty);
    }

    let diff = &prediction - &target;
    let value = diff.mapv(f32::abs).sum() / n as f32;
    let scale = 1.0 / n as f32;
    let grad = diff.mapv(|d| if d == 0.0 { 0.0 } else { d.signum() * scale });
    Ok(LossOutput { value, grad })
}

/// Mean cross-entropy of `N × K` logits against class indices.
pub fn cross_entropy(logits: ArrayView2<f32>, targets: &[usize]) -> Result<LossOutput<Array2<f32>>, LossError> {
    let (n, k) = logits.dim();
    if n != targets.len() {
        return Err(LossError::ShapeMismatch {
            prediction: vec![n, k],
            target: vec![targets.len()],
        });
    }
    if n == 0 || k == 0 {
        return Err(LossError::Empty);
    }
    if let Some(&index) = targets.iter().find(|&&t| t >= k) {
        return Err(LossError::ClassOutOfRange { index, classes: k });
    }

    let mut probs = softmax_rows(logits);
    let mut value = 0.0f32;
    for (mut row, &t) in probs.axis_iter_mut(Axis(0)).zip(targets) {
        value -= row[t].max(f32::MIN_POSITIVE).ln();
        row[t] -= 1.0;
    }
    probs /= n as f32;
    Ok(LossOutput {
        value: value / n as f32,
        grad: probs,
    })
}

/// Row-wise softmax, shifted by the row maximum.
pub fn softmax_rows(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut out = logits.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_l1_matches_manual() {
        let p = array![[1.0f32, -2.0], [0.5, 3.0]].into_dyn();
        let t = array![[0.0f32, -2.0], [1.5, 1.0]].into_dyn();
        let out = l1_loss(p.view(), t.view()).unwrap();
        assert!((out.value - (1.0 + 0.0 + 1.0 + 2.0) / 4.0).abs() < 1e-6);
        assert_eq!(out.grad, array![[0.25f32, 0.0], [-0.25, 0.25]].into_dyn());
    }

    #[test]
    fn test_l1_shape_mismatch() {
        let p = ArrayD::<f32>::zeros(ndarray::IxDyn(&[2, 3]));
        let t = ArrayD::<f32>::zeros(ndarray::IxDyn(&[3, 2]));
        assert!(matches!(l1_loss(p.view(), t.view()), Err(LossError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let logits = Array2::<f32>::zeros((2, 4));
        let out = cross_entropy(logits.view(), &[0, 3]).unwrap();
        assert!((out.value - 4.0f32.ln()).abs() < 1e-6);
        assert!((out.grad[[0, 0]] - (0.25 - 1.0) / 2.0).abs() < 1e-6);
        assert!((out.grad[[0, 1]] - 0.125).abs() < 1e-6);
        for row in out.grad.rows() {
            assert!(row.sum().abs() < 1e-6);
        }
    }

    #[test]
    fn test_cross_entropy_confident_prediction() {
        let logits = array![[20.0f32, 0.0, 0.0]];
        let out = cross_entropy(logits.view(), &[0]).unwrap();
        assert!(out.value < 1e-6);
    }

    #[test]
    fn test_cross_entropy_errors() {
        let logits = Array2::<f32>::zeros((2, 3));
        assert_eq!(
            cross_entropy(logits.view(), &[0, 3]).unwrap_err(),
            LossError::ClassOutOfRange { index: 3, classes: 3 }
        );
        assert!(matches!(cross_entropy(logits.view(), &[0]), Err(LossError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_softmax_stable_for_large_logits() {
        let p = softmax_rows(array![[1000.0f32, 1000.0]].view());
        assert!((p[[0, 0]] - 0.5).abs() < 1e-6);
    }
}
