//! Pretrained face detector via ONNX Runtime.
//!
//! Expects an SCRFD-style export: nine outputs holding per-anchor scores,
//! box distances and five-point landmark offsets for strides 8, 16 and 32.
//! Detections are mapped back through the letterbox, filtered by score and
//! minimum face size, and de-duplicated with NMS.

use crate::session::{build_session, Device};
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const DETECTOR_INPUT_SIZE: u32 = 640;
const DETECTOR_MEAN: f32 = 127.5;
const DETECTOR_STD: f32 = 128.0;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detection thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    /// Faces whose shorter side is below this many source pixels are dropped.
    pub min_face_size: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
            min_face_size: 80.0,
        }
    }
}

/// Scale and padding applied when fitting a frame into the square input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, side: u32) -> Self {
        let scale = (side as f32 / width as f32).min(side as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((side as f32 - new_w) / 2.0).floor(),
            pad_y: ((side as f32 - new_h) / 2.0).floor(),
        }
    }

    /// Map a point from network input space back to the source frame.
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Raw head outputs for one stride level.
struct StrideHead<'a> {
    stride: usize,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

impl StrideHead<'_> {
    fn decode(&self, side: usize, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
        let grid_w = side / self.stride;
        let grid_h = side / self.stride;
        let stride = self.stride as f32;

        (0..grid_w * grid_h * ANCHORS_PER_CELL)
            .filter_map(|idx| {
                let score = *self.scores.get(idx)?;
                if score <= threshold {
                    return None;
                }
                let cell = idx / ANCHORS_PER_CELL;
                let cx = (cell % grid_w) as f32 * stride;
                let cy = (cell / grid_w) as f32 * stride;

                let d = self.bboxes.get(idx * 4..idx * 4 + 4)?;
                let (x1, y1) = letterbox.to_source(cx - d[0] * stride, cy - d[1] * stride);
                let (x2, y2) = letterbox.to_source(cx + d[2] * stride, cy + d[3] * stride);

                let landmarks: Option<[(f32, f32); 5]> = self.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                    std::array::from_fn(|i| letterbox.to_source(cx + k[i * 2] * stride, cy + k[i * 2 + 1] * stride))
                });

                Some(BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: score,
                    landmarks,
                })
            })
            .collect()
    }
}

/// Face detector backed by a pretrained ONNX graph.
pub struct FaceDetector {
    session: Session,
    config: DetectorConfig,
    outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the detector graph onto `device`.
    pub fn load(
        model_path: &Path,
        device: Device,
        intra_threads: usize,
        config: DetectorConfig,
    ) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = build_session(model_path, device, intra_threads)?;
        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            %device,
            outputs = ?names,
            "loaded face detector"
        );

        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "detector requires 9 outputs (3 strides × score/bbox/kps), got {}",
                names.len()
            )));
        }

        let outputs = map_outputs(&names);
        tracing::debug!(?outputs, "detector output mapping");

        Ok(Self { session, config, outputs })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Detect faces, sorted by descending confidence.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in STRIDES.iter().enumerate() {
            let positions = self.outputs[slot];
            let extract = |idx: usize, what: &'static str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let head = StrideHead {
                stride,
                scores: extract(positions.score, "scores")?,
                bboxes: extract(positions.bbox, "bboxes")?,
                kps: extract(positions.kps, "kps")?,
            };
            candidates.extend(head.decode(
                DETECTOR_INPUT_SIZE as usize,
                &letterbox,
                self.config.confidence_threshold,
            ));
        }

        let found = candidates.len();
        let faces: Vec<BoundingBox> = nms(candidates, self.config.nms_threshold)
            .into_iter()
            .filter(|f| f.min_side() >= self.config.min_face_size)
            .collect();

        tracing::debug!(candidates = found, kept = faces.len(), "detection finished");
        Ok(faces)
    }
}

/// Letterbox an RGB image into the normalized `1×3×640×640` input.
fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let side = DETECTOR_INPUT_SIZE;
    let letterbox = Letterbox::fit(image.width(), image.height(), side);
    let new_w = ((image.width() as f32 * letterbox.scale).round() as u32).clamp(1, side);
    let new_h = ((image.height() as f32 * letterbox.scale).round() as u32).clamp(1, side);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let (px, py) = (letterbox.pad_x as u32, letterbox.pad_y as u32);
    let s = side as usize;
    // Padding stays 0.0, which is the normalized mean.
    let mut tensor = Array4::<f32>::zeros((1, 3, s, s));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = ((x + px) as usize, (y + py) as usize);
        if tx >= s || ty >= s {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - DETECTOR_MEAN) / DETECTOR_STD;
        }
    }

    (tensor, letterbox)
}

/// Map output tensors to stride slots by name (`score_8`, `bbox_16`, ...),
/// falling back to the positional layout [scores 8/16/32, bboxes, kps].
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideOutputs {
                score: find("score", stride)?,
                bbox: find("bbox", stride)?,
                kps: find("kps", stride)?,
            })
        })
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => {
            tracing::info!(?names, "detector output names not recognized, using positional mapping");
            std::array::from_fn(|i| StrideOutputs { score: i, bbox: i + 3, kps: i + 6 })
        }
    }
}

/// Non-maximum suppression; keeps the highest-confidence box of each overlapping group.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Intersection-over-union of two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: conf, landmarks: None }
    }

    #[test]
    fn test_iou_identical() {
        let a = make_bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_roundtrip() {
        let lb = Letterbox::fit(320, 240, 640);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 80.0);
        let (x, y) = lb.to_source(100.0 * 2.0, 50.0 * 2.0 + 80.0);
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let image = RgbImage::from_pixel(320, 160, image::Rgb([255, 255, 255]));
        let (tensor, lb) = preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(lb.pad_y, 160.0);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let inside = tensor[[0, 1, 320, 320]];
        assert!((inside - (255.0 - 127.5) / 128.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_single_anchor() {
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let stride = 32;
        let grid = 640 / stride;
        let anchors = grid * grid * ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut bboxes = vec![0.0f32; anchors * 4];
        let kps = vec![0.0f32; anchors * 10];

        // Cell (x=2, y=1), second anchor.
        let idx = (grid + 2) * ANCHORS_PER_CELL + 1;
        scores[idx] = 0.95;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 2.0, 3.0]);

        let head = StrideHead { stride, scores: &scores, bboxes: &bboxes, kps: &kps };
        let dets = head.decode(640, &lb, 0.5);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!((d.x, d.y), (64.0 - 32.0, 32.0 - 32.0));
        assert_eq!((d.width, d.height), (96.0, 128.0));
        assert_eq!(d.landmarks.unwrap()[0], (64.0, 32.0));
    }

    #[test]
    fn test_map_outputs_named_shuffled() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let m = map_outputs(&names);
        assert_eq!(m[0], StrideOutputs { score: 2, bbox: 0, kps: 1 });
        assert_eq!(m[2], StrideOutputs { score: 8, bbox: 6, kps: 7 });
    }

    #[test]
    fn test_map_outputs_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        let m = map_outputs(&names);
        assert_eq!(m[1], StrideOutputs { score: 1, bbox: 4, kps: 7 });
    }

    #[test]
    fn test_default_min_face_size() {
        assert_eq!(DetectorConfig::default().min_face_size, 80.0);
    }
}
