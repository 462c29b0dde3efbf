//! Face cropping: landmark alignment, box crops and tensor conversion.
//!
//! Faces with landmarks are warped onto the ArcFace five-point template with a
//! 4-DOF similarity transform. Faces without landmarks fall back to a crop of
//! the detection box. Either way the output has the backbone's input size.
//!
//! The `margin` argument is measured in output pixels: the face occupies the
//! inner `(height - margin) × (width - margin)` region of the crop.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array3;

/// ArcFace reference landmarks for a 112×112 crop.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];
const REFERENCE_SIZE: f32 = 112.0;

/// Pixel standardization applied when post-processing is enabled.
const STANDARDIZE_MEAN: f32 = 127.5;
const STANDARDIZE_STD: f32 = 128.0;

/// Reference landmarks scaled to a `height × width` crop.
///
/// The template is scaled by `height / 112` and centered horizontally, which
/// yields the familiar 8-pixel shift for 112×96 crops.
pub fn reference_landmarks(height: u32, width: u32) -> [(f32, f32); 5] {
    let scale = height as f32 / REFERENCE_SIZE;
    let x_offset = (width as f32 - REFERENCE_SIZE * scale) / 2.0;
    REFERENCE_LANDMARKS_112.map(|(x, y)| (x * scale + x_offset, y * scale))
}

/// Least-squares similarity transform `[a, -b, tx, b, a, ty]` mapping `src` onto `dst`.
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    // Normal equations for the unknowns [a, b, tx, ty]; each correspondence
    // contributes rows [sx, -sy, 1, 0] → dx and [sy, sx, 0, 1] → dy.
    let mut ata = [[0.0f32; 4]; 4];
    let mut atb = [0.0f32; 4];

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let rows = [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)];
        for (row, rhs) in rows {
            for j in 0..4 {
                for k in 0..4 {
                    ata[j][k] += row[j] * row[k];
                }
                atb[j] += row[j] * rhs;
            }
        }
    }

    let [a, b, tx, ty] = solve_normal_equations(ata, atb).unwrap_or([1.0, 0.0, 0.0, 0.0]);
    [a, -b, tx, b, a, ty]
}

/// Gaussian elimination with partial pivoting. `None` for a singular system.
#[allow(clippy::needless_range_loop)]
fn solve_normal_equations(mut m: [[f32; 4]; 4], mut rhs: [f32; 4]) -> Option<[f32; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4)
            .max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot_row);
        rhs.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for k in col..4 {
                m[row][k] -= factor * m[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (rhs[i] - tail) / m[i][i];
    }
    Some(x)
}

/// Bilinear sample of an RGB image; outside pixels read as black.
fn sample_bilinear(image: &RgbImage, sx: f32, sy: f32) -> Rgb<u8> {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let x0 = sx.floor() as i64;
    let y0 = sy.floor() as i64;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let fetch = |x: i64, y: i64| -> [f32; 3] {
        if x >= 0 && x < w && y >= 0 && y < h {
            let p = image.get_pixel(x as u32, y as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let (tl, tr, bl, br) = (fetch(x0, y0), fetch(x0 + 1, y0), fetch(x0, y0 + 1), fetch(x0 + 1, y0 + 1));
    let mut out = [0u8; 3];
    for c in 0..3 {
        let v = tl[c] * (1.0 - fx) * (1.0 - fy)
            + tr[c] * fx * (1.0 - fy)
            + bl[c] * (1.0 - fx) * fy
            + br[c] * fx * fy;
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Warp `image` with the forward transform `matrix` into a `height × width` crop.
fn warp_similarity(image: &RgbImage, matrix: &[f32; 6], height: u32, width: u32) -> RgbImage {
    let (a, b, tx, ty) = (matrix[0], matrix[3], matrix[2], matrix[5]);
    let det = a * a + b * b;
    if det < 1e-12 {
        return RgbImage::new(width, height);
    }
    let (ia, ib) = (a / det, b / det);

    RgbImage::from_fn(width, height, |ox, oy| {
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        sample_bilinear(image, ia * dx + ib * dy, -ib * dx + ia * dy)
    })
}

/// Reference landmarks for a crop whose outer `margin` pixels surround the face.
fn margin_template(height: u32, width: u32, margin: u32) -> [(f32, f32); 5] {
    let margin = margin.min(height.min(width).saturating_sub(1));
    let offset = margin as f32 / 2.0;
    reference_landmarks(height - margin, width - margin).map(|(x, y)| (x + offset, y + offset))
}

/// Align a face onto the reference template at `height × width`.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5], height: u32, width: u32, margin: u32) -> RgbImage {
    let matrix = estimate_similarity_transform(landmarks, &margin_template(height, width, margin));
    warp_similarity(image, &matrix, height, width)
}

/// Crop the detection box and resize it to `height × width`.
///
/// The box is grown so that, after resizing, `margin` output pixels of
/// context surround it.
pub fn crop_box(image: &RgbImage, face: &BoundingBox, height: u32, width: u32, margin: u32) -> RgbImage {
    let margin = margin.min(height.min(width).saturating_sub(1)) as f32;
    let grow_x = margin * face.width / (width as f32 - margin) / 2.0;
    let grow_y = margin * face.height / (height as f32 - margin) / 2.0;

    let x0 = (face.x - grow_x).max(0.0) as u32;
    let y0 = (face.y - grow_y).max(0.0) as u32;
    let x1 = ((face.x + face.width + grow_x).max(0.0) as u32).min(image.width());
    let y1 = ((face.y + face.height + grow_y).max(0.0) as u32).min(image.height());

    if x1 <= x0 || y1 <= y0 {
        return RgbImage::new(width, height);
    }
    let crop = imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image();
    imageops::resize(&crop, width, height, FilterType::Triangle)
}

/// Crop a detected face, preferring landmark alignment.
pub fn extract_face(image: &RgbImage, face: &BoundingBox, height: u32, width: u32, margin: u32) -> RgbImage {
    match &face.landmarks {
        Some(landmarks) => align_face(image, landmarks, height, width, margin),
        None => crop_box(image, face, height, width, margin),
    }
}

/// Convert a crop to a `3 × H × W` tensor.
///
/// With `standardize`, pixels map to `(v - 127.5) / 128`; otherwise raw 0–255
/// values are kept.
pub fn to_tensor(crop: &RgbImage, standardize: bool) -> Array3<f32> {
    let (w, h) = crop.dimensions();
    Array3::from_shape_fn((3, h as usize, w as usize), |(c, y, x)| {
        let v = crop.get_pixel(x as u32, y as u32)[c] as f32;
        if standardize {
            (v - STANDARDIZE_MEAN) / STANDARDIZE_STD
        } else {
            v
        }
    })
}
