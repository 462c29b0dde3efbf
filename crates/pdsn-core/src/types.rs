use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Length of the shorter box side, compared against the minimum face size.
    pub fn min_side(&self) -> f32 {
        self.width.min(self.height)
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

/// Comparison embedding for one face of a pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Unit-length copy. Zero vectors are returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            Embedding::new(self.values.iter().map(|x| x / norm).collect())
        } else {
            self.clone()
        }
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Same/different decision on the distance between the unit-normalized
    /// embeddings. Pairs at or below `threshold` are considered the same identity.
    pub fn verify(&self, other: &Embedding, threshold: f32) -> PairVerdict {
        let distance = self.normalized().euclidean_distance(&other.normalized());
        PairVerdict {
            same: distance <= threshold,
            distance,
            similarity: self.similarity(other),
            threshold,
        }
    }
}

/// Outcome of comparing the two embeddings of a face pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairVerdict {
    pub same: bool,
    /// Distance between the unit-normalized embeddings, in [0, 2].
    pub distance: f32,
    /// Cosine similarity in [-1, 1].
    pub similarity: f32,
    pub threshold: f32,
}

/// Images handed to the face cropper: one image, or a batch.
#[derive(Debug, Clone)]
pub enum FaceInput {
    Single(RgbImage),
    Batch(Vec<RgbImage>),
}

impl FaceInput {
    pub fn len(&self) -> usize {
        match self {
            FaceInput::Single(_) => 1,
            FaceInput::Batch(images) => images.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, FaceInput::Batch(_))
    }

    /// Uniform view over the contained images.
    pub fn images(&self) -> impl Iterator<Item = &RgbImage> {
        let slice: &[RgbImage] = match self {
            FaceInput::Single(image) => std::slice::from_ref(image),
            FaceInput::Batch(images) => images,
        };
        slice.iter()
    }
}

impl From<RgbImage> for FaceInput {
    fn from(image: RgbImage) -> Self {
        FaceInput::Single(image)
    }
}

impl From<Vec<RgbImage>> for FaceInput {
    fn from(images: Vec<RgbImage>) -> Self {
        FaceInput::Batch(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_verify_scale_invariant() {
        let a = Embedding::new(vec![3.0, 4.0]);
        let b = Embedding::new(vec![0.6, 0.8]);
        let verdict = a.verify(&b, 0.5);
        assert!(verdict.same);
        assert!(verdict.distance < 1e-6);
    }

    #[test]
    fn test_verify_opposite_is_different() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![-1.0, 0.0]);
        let verdict = a.verify(&b, 0.5);
        assert!(!verdict.same);
        assert!((verdict.distance - 2.0).abs() < 1e-6);
        assert!((verdict.similarity + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_face_input_single_and_batch() {
        let single = FaceInput::from(RgbImage::new(4, 4));
        assert_eq!(single.len(), 1);
        assert!(!single.is_batch());

        let batch = FaceInput::from(vec![RgbImage::new(2, 2), RgbImage::new(3, 3)]);
        assert_eq!(batch.len(), 2);
        assert!(batch.is_batch());
        let widths: Vec<u32> = batch.images().map(|i| i.width()).collect();
        assert_eq!(widths, vec![2, 3]);
    }
}
