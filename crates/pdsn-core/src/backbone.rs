//! ArcFace-family backbone via ONNX Runtime.
//!
//! The exported graph takes `N×3×H×W` face crops and returns two outputs: the
//! identity embedding (`N×E`) and the last convolutional feature map
//! (`N×512×h×w`) consumed by the difference-mask branch. Outputs are told
//! apart by rank, so export order does not matter.

use crate::session::{build_session, Device};
use ndarray::{Array2, Array4, ArrayView4, Axis};
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Spatial reduction between the input crop and the last feature map.
const BACKBONE_STRIDE: usize = 16;

#[derive(Error, Debug)]
pub enum BackboneError {
    #[error("backbone model not found: {0}")]
    ModelNotFound(String),
    #[error("invalid backbone configuration: {0}")]
    InvalidConfig(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("tensor shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Backbone architecture family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetMode {
    Ir,
    IrSe,
    MobileFaceNet,
}

impl FromStr for NetMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ir" => Ok(NetMode::Ir),
            "ir_se" => Ok(NetMode::IrSe),
            "mobilefacenet" => Ok(NetMode::MobileFaceNet),
            other => Err(format!("unknown net mode '{other}', expected ir, ir_se or mobilefacenet")),
        }
    }
}

impl fmt::Display for NetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetMode::Ir => "ir",
            NetMode::IrSe => "ir_se",
            NetMode::MobileFaceNet => "mobilefacenet",
        })
    }
}

/// Input size and architecture of the exported backbone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneConfig {
    pub input_height: usize,
    pub input_width: usize,
    pub embedding_size: usize,
    pub net_mode: NetMode,
    pub net_depth: usize,
    /// Dropout ratio the graph was trained with; inert at inference.
    pub drop_ratio: f32,
    pub feature_channels: usize,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            input_height: 112,
            input_width: 96,
            embedding_size: 512,
            net_mode: NetMode::IrSe,
            net_depth: 50,
            drop_ratio: 0.6,
            feature_channels: 512,
        }
    }
}

impl BackboneConfig {
    pub fn validate(&self) -> Result<(), BackboneError> {
        if self.net_mode != NetMode::MobileFaceNet && ![50, 100, 152].contains(&self.net_depth) {
            return Err(BackboneError::InvalidConfig(format!(
                "net depth must be 50, 100 or 152, got {}",
                self.net_depth
            )));
        }
        if self.input_height % BACKBONE_STRIDE != 0 || self.input_width % BACKBONE_STRIDE != 0 {
            return Err(BackboneError::InvalidConfig(format!(
                "input size {}x{} is not a multiple of {BACKBONE_STRIDE}",
                self.input_height, self.input_width
            )));
        }
        if !(0.0..1.0).contains(&self.drop_ratio) {
            return Err(BackboneError::InvalidConfig(format!(
                "drop ratio must be in [0, 1), got {}",
                self.drop_ratio
            )));
        }
        if self.embedding_size == 0 {
            return Err(BackboneError::InvalidConfig("embedding size must be positive".into()));
        }
        Ok(())
    }

    /// Feature map size `(C, H, W)` for this input resolution.
    pub fn feature_shape(&self) -> (usize, usize, usize) {
        (
            self.feature_channels,
            self.input_height / BACKBONE_STRIDE,
            self.input_width / BACKBONE_STRIDE,
        )
    }

    /// Conventional file name of the exported graph, e.g. `model_ir_se50.onnx`.
    pub fn model_file_name(&self) -> String {
        match self.net_mode {
            NetMode::MobileFaceNet => "model_mobilefacenet.onnx".to_string(),
            mode => format!("model_{mode}{}.onnx", self.net_depth),
        }
    }
}

/// Embeddings and feature maps for a batch of crops.
#[derive(Debug, Clone)]
pub struct BackboneOutput {
    pub embeddings: Array2<f32>,
    pub features: Array4<f32>,
}

/// Pretrained embedding network.
pub struct Backbone {
    session: Session,
    config: BackboneConfig,
    output_count: usize,
}

impl Backbone {
    pub fn load(
        model_path: &Path,
        device: Device,
        intra_threads: usize,
        config: BackboneConfig,
    ) -> Result<Self, BackboneError> {
        config.validate()?;
        if !model_path.exists() {
            return Err(BackboneError::ModelNotFound(model_path.display().to_string()));
        }

        let session = build_session(model_path, device, intra_threads)?;
        let output_count = session.outputs().len();
        tracing::info!(
            path = %model_path.display(),
            %device,
            net_mode = %config.net_mode,
            net_depth = config.net_depth,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded backbone"
        );

        if output_count < 2 {
            return Err(BackboneError::InferenceFailed(format!(
                "backbone must export embedding and feature map outputs, got {output_count}"
            )));
        }

        Ok(Self { session, config, output_count })
    }

    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }

    /// Embed a batch of `N×3×H×W` crops.
    pub fn extract(&mut self, faces: ArrayView4<f32>) -> Result<BackboneOutput, BackboneError> {
        let (n, _, h, w) = faces.dim();
        if (h, w) != (self.config.input_height, self.config.input_width) {
            return Err(BackboneError::InvalidConfig(format!(
                "crop size {h}x{w} does not match backbone input {}x{}",
                self.config.input_height, self.config.input_width
            )));
        }

        let (embeddings, features) = {
            let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(faces)?])?;

            let mut embeddings = None;
            let mut features = None;
            for idx in 0..self.output_count {
                let (shape, data) = outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map_err(|e| BackboneError::InferenceFailed(format!("output extraction: {e}")))?;
                let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
                match dims.len() {
                    2 => embeddings = Some(Array2::from_shape_vec((dims[0], dims[1]), data.to_vec())?),
                    4 => {
                        features = Some(Array4::from_shape_vec(
                            (dims[0], dims[1], dims[2], dims[3]),
                            data.to_vec(),
                        )?)
                    }
                    _ => tracing::debug!(?dims, "ignoring backbone output"),
                }
            }
            (embeddings, features)
        };

        let embeddings = embeddings
            .ok_or_else(|| BackboneError::InferenceFailed("graph has no rank-2 embedding output".into()))?;
        let features = features
            .ok_or_else(|| BackboneError::InferenceFailed("graph has no rank-4 feature output".into()))?;

        check_output(&self.config, n, &embeddings, &features)?;
        Ok(BackboneOutput {
            embeddings: l2_normalize_rows(embeddings),
            features,
        })
    }
}

/// Check a batch of backbone outputs against the configured shapes.
fn check_output(
    config: &BackboneConfig,
    n: usize,
    embeddings: &Array2<f32>,
    features: &Array4<f32>,
) -> Result<(), BackboneError> {
    if embeddings.dim() != (n, config.embedding_size) {
        return Err(BackboneError::InferenceFailed(format!(
            "expected {n}x{} embeddings, got {:?}",
            config.embedding_size,
            embeddings.shape()
        )));
    }
    let (c, fh, fw) = config.feature_shape();
    if features.dim() != (n, c, fh, fw) {
        return Err(BackboneError::InferenceFailed(format!(
            "expected {n}x{c}x{fh}x{fw} feature map, got {:?}",
            features.shape()
        )));
    }
    Ok(())
}

/// Scale each row to unit L2 norm; zero rows are left alone.
pub fn l2_normalize_rows(mut x: Array2<f32>) -> Array2<f32> {
    for mut row in x.axis_iter_mut(Axis(0)) {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row /= norm;
        }
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_default_feature_shape_is_7x6() {
        assert_eq!(BackboneConfig::default().feature_shape(), (512, 7, 6));
        let square = BackboneConfig { input_width: 112, ..BackboneConfig::default() };
        assert_eq!(square.feature_shape(), (512, 7, 7));
    }

    #[test]
    fn test_validate_depth() {
        let bad = BackboneConfig { net_depth: 34, ..BackboneConfig::default() };
        assert!(matches!(bad.validate(), Err(BackboneError::InvalidConfig(_))));
        let mobile = BackboneConfig { net_mode: NetMode::MobileFaceNet, net_depth: 34, ..BackboneConfig::default() };
        assert!(mobile.validate().is_ok());
    }

    #[test]
    fn test_validate_input_size_and_dropout() {
        let odd = BackboneConfig { input_width: 100, ..BackboneConfig::default() };
        assert!(odd.validate().is_err());
        let drop = BackboneConfig { drop_ratio: 1.0, ..BackboneConfig::default() };
        assert!(drop.validate().is_err());
    }

    #[test]
    fn test_model_file_name() {
        assert_eq!(BackboneConfig::default().model_file_name(), "model_ir_se50.onnx");
        let ir = BackboneConfig { net_mode: NetMode::Ir, net_depth: 100, ..BackboneConfig::default() };
        assert_eq!(ir.model_file_name(), "model_ir100.onnx");
    }

    #[test]
    fn test_net_mode_parse() {
        assert_eq!("IR_SE".parse::<NetMode>().unwrap(), NetMode::IrSe);
        assert_eq!("mobilefacenet".parse::<NetMode>().unwrap(), NetMode::MobileFaceNet);
        assert!("resnet".parse::<NetMode>().is_err());
    }

    #[test]
    fn test_check_output_shapes() {
        let config = BackboneConfig::default();
        let embeddings = Array2::<f32>::zeros((2, 512));
        let features = Array4::<f32>::zeros((2, 512, 7, 6));
        assert!(check_output(&config, 2, &embeddings, &features).is_ok());

        let short = Array2::<f32>::zeros((2, 128));
        assert!(matches!(
            check_output(&config, 2, &short, &features),
            Err(BackboneError::InferenceFailed(_))
        ));
        let square = Array4::<f32>::zeros((2, 512, 7, 7));
        assert!(check_output(&config, 2, &embeddings, &square).is_err());
        assert!(check_output(&config, 3, &embeddings, &features).is_err());
    }

    #[test]
    fn test_l2_normalize_rows() {
        let x = l2_normalize_rows(array![[3.0f32, 4.0], [0.0, 0.0]]);
        assert!((x[[0, 0]] - 0.6).abs() < 1e-6);
        assert!((x[[0, 1]] - 0.8).abs() < 1e-6);
        assert_eq!(x.row(1).to_vec(), vec![0.0, 0.0]);
    }
}
