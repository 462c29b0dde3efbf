//! The composed verification model.
//!
//! [`PdsnWeights`] holds every Rust-side tensor: the difference-mask branch and
//! any pretrained tensors carried along in a checkpoint under the detector or
//! backbone namespaces. [`BioPdsn`] pairs those weights with the ONNX detector
//! and backbone sessions and runs the full source/target pipeline.

use crate::alignment;
use crate::backbone::{Backbone, BackboneError};
use crate::checkpoint::{self, CheckpointError};
use crate::detector::{DetectorError, FaceDetector};
use crate::layers::Mode;
use crate::mask::{DiffMask, DiffMaskConfig, DiffMaskOutput, MaskError};
use crate::params::{self, join, named_parameters, Module, ParamError, Parameter, StateDict};
use crate::types::{BoundingBox, Embedding, FaceInput, PairVerdict};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{stack, Array3, Array4, Axis};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Parameters under this namespace belong to the pretrained detector and are never trained.
pub const DETECTOR_NAMESPACE: &str = "mtcnn";
/// Namespace of pretrained backbone tensors carried in checkpoints.
pub const BACKBONE_NAMESPACE: &str = "resnet";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("backbone: {0}")]
    Backbone(#[from] BackboneError),
    #[error("difference mask: {0}")]
    Mask(#[from] MaskError),
    #[error("parameters: {0}")]
    Params(#[from] ParamError),
    #[error("checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("no face detected in image {0}")]
    NoFaceDetected(usize),
    #[error("expected one face per pair image, got {0}")]
    FaceCount(usize),
    #[error("tensor shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Face cropping options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropConfig {
    pub height: u32,
    pub width: u32,
    /// Output pixels of context kept around each face.
    pub margin: u32,
    /// Standardize crops to `(v - 127.5) / 128`.
    pub post_process: bool,
    /// Order faces by box area rather than detector confidence.
    pub select_largest: bool,
    /// Return every detected face instead of only the first in order.
    pub keep_all: bool,
}

impl Default for CropConfig {
    fn default() -> Self {
        Self {
            height: 112,
            width: 96,
            margin: 0,
            post_process: true,
            select_largest: true,
            keep_all: false,
        }
    }
}

/// Trainable and carried tensors of the model.
#[derive(Debug, Clone)]
pub struct PdsnWeights {
    pub mask: DiffMask,
    pretrained: BTreeMap<String, Parameter>,
}

impl PdsnWeights {
    pub fn new(config: DiffMaskConfig) -> Self {
        let mut weights = Self {
            mask: DiffMask::new(config),
            pretrained: BTreeMap::new(),
        };
        weights.freeze_layers();
        weights
    }

    /// Exclude every detector tensor from gradient updates.
    pub fn freeze_layers(&mut self) -> usize {
        let frozen = params::freeze_matching(self, DETECTOR_NAMESPACE);
        tracing::debug!(frozen, namespace = DETECTOR_NAMESPACE, "froze detector parameters");
        frozen
    }

    /// Load a state dict.
    ///
    /// All branch tensors must be present. Extra tensors under the detector or
    /// backbone namespaces are kept as pretrained parameters; any other extra
    /// key is rejected. A rejected state dict leaves the weights untouched.
    pub fn load_state_dict(&mut self, state: &StateDict) -> Result<(), ParamError> {
        let branch: HashSet<String> = named_parameters(&self.mask)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        let unknown: Vec<String> = state
            .keys()
            .filter(|name| !branch.contains(name.as_str()) && !is_pretrained_name(name))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(ParamError::UnexpectedKeys(unknown));
        }

        let report = params::load_state_dict(&mut self.mask, state)?;
        self.pretrained = report
            .unexpected
            .into_iter()
            .map(|name| {
                let tensor = state[&name].clone();
                (name, Parameter::new(tensor))
            })
            .collect();
        self.freeze_layers();

        tracing::info!(
            branch = report.loaded,
            pretrained = self.pretrained.len(),
            "state dict loaded"
        );
        Ok(())
    }

    pub fn state_dict(&self) -> StateDict {
        params::state_dict(self)
    }

    pub fn load_checkpoint(&mut self, path: &Path) -> Result<(), PipelineError> {
        let ckpt = checkpoint::load(path)?;
        self.load_state_dict(&ckpt.state)?;
        Ok(())
    }

    pub fn save_checkpoint(&self, path: &Path) -> Result<String, PipelineError> {
        Ok(checkpoint::save(path, &self.state_dict())?)
    }
}

fn is_pretrained_name(name: &str) -> bool {
    [DETECTOR_NAMESPACE, BACKBONE_NAMESPACE]
        .iter()
        .any(|ns| name == *ns || name.starts_with(&format!("{ns}.")))
}

impl Module for PdsnWeights {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Parameter)) {
        self.mask.visit(prefix, f);
        for (name, p) in &self.pretrained {
            f(join(prefix, name), p);
        }
    }

    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Parameter)) {
        self.mask.visit_mut(prefix, f);
        for (name, p) in self.pretrained.iter_mut() {
            f(join(prefix, name), p);
        }
    }
}

/// Detector + backbone + difference-mask branch for pairwise face verification.
pub struct BioPdsn {
    detector: FaceDetector,
    backbone: Backbone,
    pub weights: PdsnWeights,
    crop: CropConfig,
    mode: Mode,
}

impl BioPdsn {
    /// Compose the model. The branch resolution follows the backbone's feature map.
    pub fn new(detector: FaceDetector, backbone: Backbone, crop: CropConfig, seed: u64) -> Self {
        let (channels, height, width) = backbone.config().feature_shape();
        let mask_config = DiffMaskConfig {
            channels,
            height,
            width,
            seed,
            ..DiffMaskConfig::default()
        };
        Self {
            detector,
            backbone,
            weights: PdsnWeights::new(mask_config),
            crop,
            mode: Mode::Train,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn eval(&mut self) {
        self.mode = Mode::Eval;
    }

    pub fn train(&mut self) {
        self.mode = Mode::Train;
    }

    /// Detect and crop faces from one image or a batch.
    ///
    /// Batch images are first resized so their shorter side equals the crop
    /// height. Each image yields its first face in [`select_faces`] order, or
    /// all faces with `keep_all`.
    pub fn get_faces(&mut self, input: &FaceInput) -> Result<Vec<Vec<Array3<f32>>>, PipelineError> {
        let resize = input.is_batch();
        let mut per_image = Vec::with_capacity(input.len());

        for (idx, image) in input.images().enumerate() {
            let resized;
            let image = if resize {
                resized = resize_shorter_side(image, self.crop.height);
                &resized
            } else {
                image
            };

            let detections = self.detector.detect(image)?;
            let faces = select_faces(detections, self.crop.keep_all, self.crop.select_largest);
            tracing::debug!(image = idx, faces = faces.len(), "faces detected");

            let crops = faces
                .iter()
                .map(|face| {
                    let crop = alignment::extract_face(image, face, self.crop.height, self.crop.width, self.crop.margin);
                    alignment::to_tensor(&crop, self.crop.post_process)
                })
                .collect();
            per_image.push(crops);
        }

        Ok(per_image)
    }

    /// Backbone feature maps for the first face of each pair image.
    pub fn get_features(&mut self, source: &RgbImage, target: &RgbImage) -> Result<(Array4<f32>, Array4<f32>), PipelineError> {
        let batch = FaceInput::Batch(vec![source.clone(), target.clone()]);
        let faces = self.get_faces(&batch)?;

        let mut crops = Vec::with_capacity(2);
        for (idx, image_faces) in faces.into_iter().enumerate() {
            let face = image_faces
                .into_iter()
                .next()
                .ok_or(PipelineError::NoFaceDetected(idx))?;
            crops.push(face);
        }
        if crops.len() != 2 {
            return Err(PipelineError::FaceCount(crops.len()));
        }

        let views: Vec<_> = crops.iter().map(|c| c.view()).collect();
        let input = stack(Axis(0), &views)?;
        let out = self.backbone.extract(input.view())?;

        let source_features = out.features.slice_axis(Axis(0), (0..1).into()).to_owned();
        let target_features = out.features.slice_axis(Axis(0), (1..2).into()).to_owned();
        Ok((source_features, target_features))
    }

    /// Full pipeline: detect, crop, embed and run the difference-mask branch.
    pub fn forward(&mut self, source: &RgbImage, target: &RgbImage) -> Result<DiffMaskOutput, PipelineError> {
        let (f1, f2) = self.get_features(source, target)?;
        let mode = self.mode;
        Ok(self.weights.mask.forward(f1.view(), f2.view(), mode)?)
    }

    /// Same/different decision on the branch's comparison embeddings.
    pub fn verify(&mut self, source: &RgbImage, target: &RgbImage, threshold: f32) -> Result<PairVerdict, PipelineError> {
        let out = self.forward(source, target)?;
        let a = Embedding::new(out.source_embedding.row(0).to_vec());
        let b = Embedding::new(out.target_embedding.row(0).to_vec());
        let verdict = a.verify(&b, threshold);
        tracing::info!(
            distance = verdict.distance,
            similarity = verdict.similarity,
            same = verdict.same,
            "pair verified"
        );
        Ok(verdict)
    }
}

/// Order detections and keep the first unless `keep_all` is set.
///
/// Detections arrive sorted by confidence. With `select_largest` they are
/// re-sorted by box area, largest first; equal areas keep confidence order.
pub fn select_faces(mut faces: Vec<BoundingBox>, keep_all: bool, select_largest: bool) -> Vec<BoundingBox> {
    if select_largest {
        faces.sort_by(|a, b| b.area().total_cmp(&a.area()));
    }
    if !keep_all {
        faces.truncate(1);
    }
    faces
}

fn resize_shorter_side(image: &RgbImage, side: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let shorter = w.min(h).max(1);
    let scale = side as f32 / shorter as f32;
    let new_w = ((w as f32 * scale).round() as u32).max(1);
    let new_h = ((h as f32 * scale).round() as u32).max(1);
    imageops::resize(image, new_w, new_h, FilterType::Triangle)
}
