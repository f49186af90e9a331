//! Anti-spoofing classifier via an ensemble of MiniFASNet ONNX models.
//!
//! Each ensemble member sees a differently scaled crop around the detected
//! face (e.g. 2.7× and 4.0× the box), resized to 80×80 BGR with raw 0–255
//! values. Softmax outputs are averaged across members; class 1 is "real".

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const MINIFAS_INPUT_SIZE: u32 = 80;
const MINIFAS_REAL_CLASS: usize = 1;

#[derive(Error, Debug)]
pub enum AntiSpoofError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("no anti-spoofing models configured")]
    EmptyEnsemble,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

struct EnsembleMember {
    session: Session,
    crop_scale: f32,
}

/// MiniFASNet anti-spoofing ensemble.
pub struct AntiSpoofModel {
    members: Vec<EnsembleMember>,
}

impl AntiSpoofModel {
    /// Load each `(path, crop_scale)` pair as one ensemble member.
    pub fn load(models: &[(&Path, f32)]) -> Result<Self, AntiSpoofError> {
        if models.is_empty() {
            return Err(AntiSpoofError::EmptyEnsemble);
        }

        let mut members = Vec::with_capacity(models.len());
        for &(path, crop_scale) in models {
            if !path.exists() {
                return Err(AntiSpoofError::ModelNotFound(path.display().to_string()));
            }
            let session = Session::builder()?
                .with_intra_threads(1)?
                .commit_from_file(path)?;
            tracing::info!(path = %path.display(), crop_scale, "loaded MiniFASNet model");
            members.push(EnsembleMember { session, crop_scale });
        }

        Ok(Self { members })
    }

    /// Probability that `face` is a real, live face, averaged over the ensemble.
    pub fn real_score(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<f32, AntiSpoofError> {
        let mut total = 0.0f32;

        for member in &mut self.members {
            let crop = scaled_crop(image, face, member.crop_scale);
            let input = bgr_tensor(&crop);

            let outputs = member
                .session
                .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, logits) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| AntiSpoofError::InferenceFailed(format!("logits: {e}")))?;

            let probs = softmax(logits);
            let real = probs.get(MINIFAS_REAL_CLASS).copied().ok_or_else(|| {
                AntiSpoofError::InferenceFailed(format!("expected ≥2 classes, got {}", probs.len()))
            })?;
            total += real;
        }

        Ok(total / self.members.len() as f32)
    }
}

/// Crop a square-ish region `scale`× the face box, shifted to stay inside the
/// image, then resized to the MiniFASNet input.
fn scaled_crop(image: &RgbImage, face: &BoundingBox, scale: f32) -> RgbImage {
    let (x1, y1, x2, y2) = crop_box(image.width(), image.height(), face, scale);
    let crop = imageops::crop_imm(image, x1, y1, (x2 - x1).max(1), (y2 - y1).max(1)).to_image();
    imageops::resize(&crop, MINIFAS_INPUT_SIZE, MINIFAS_INPUT_SIZE, FilterType::Triangle)
}

/// Box corners `(x1, y1, x2, y2)` of the scaled crop, clamped to the image.
fn crop_box(src_w: u32, src_h: u32, face: &BoundingBox, scale: f32) -> (u32, u32, u32, u32) {
    let max_x = (src_w.saturating_sub(1)) as f32;
    let max_y = (src_h.saturating_sub(1)) as f32;
    let box_w = face.width.max(1.0);
    let box_h = face.height.max(1.0);

    let scale = scale.min(max_y / box_h).min(max_x / box_w);
    let (new_w, new_h) = (box_w * scale, box_h * scale);
    let (cx, cy) = (face.x + box_w / 2.0, face.y + box_h / 2.0);

    let (mut left, mut top) = (cx - new_w / 2.0, cy - new_h / 2.0);
    let (mut right, mut bottom) = (cx + new_w / 2.0, cy + new_h / 2.0);

    if left < 0.0 {
        right -= left;
        left = 0.0;
    }
    if top < 0.0 {
        bottom -= top;
        top = 0.0;
    }
    if right > max_x {
        left -= right - max_x;
        right = max_x;
    }
    if bottom > max_y {
        top -= bottom - max_y;
        bottom = max_y;
    }

    (
        left.max(0.0) as u32,
        top.max(0.0) as u32,
        right.max(0.0) as u32,
        bottom.max(0.0) as u32,
    )
}

/// RGB crop → BGR NCHW tensor with raw 0–255 values.
fn bgr_tensor(crop: &RgbImage) -> Array4<f32> {
    let (w, h) = (crop.width() as usize, crop.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in crop.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[2 - c] as f32;
        }
    }
    tensor
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn face(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9, landmarks: None }
    }

    #[test]
    fn test_crop_box_centred() {
        // 100×100 face in the middle of a 1000×1000 image, scale 2.5 → 250 px box.
        let (x1, y1, x2, y2) = crop_box(1000, 1000, &face(450.0, 450.0, 100.0, 100.0), 2.5);
        assert_eq!((x1, y1, x2, y2), (375, 375, 625, 625));
    }

    #[test]
    fn test_crop_box_shifted_inside_edge() {
        // Face at the top-left corner: the crop is pushed right/down, not truncated.
        let (x1, y1, x2, y2) = crop_box(1000, 1000, &face(0.0, 0.0, 100.0, 100.0), 4.0);
        assert_eq!((x1, y1), (0, 0));
        assert_eq!((x2, y2), (400, 400));
    }

    #[test]
    fn test_crop_box_scale_limited_by_image() {
        // Scale 4.0 would exceed a 300 px image; the crop shrinks to fit.
        let (x1, _, x2, _) = crop_box(300, 300, &face(100.0, 100.0, 100.0, 100.0), 4.0);
        assert!(x2 - x1 <= 299);
    }

    #[test]
    fn test_bgr_tensor_swaps_channels() {
        let crop = RgbImage::from_pixel(80, 80, Rgb([10, 20, 30]));
        let t = bgr_tensor(&crop);
        assert_eq!(t.shape(), &[1, 3, 80, 80]);
        assert_eq!((t[[0, 0, 0, 0]], t[[0, 1, 0, 0]], t[[0, 2, 0, 0]]), (30.0, 20.0, 10.0));
    }

    #[test]
    fn test_scaled_crop_size() {
        let img = RgbImage::from_pixel(640, 480, Rgb([1, 2, 3]));
        let crop = scaled_crop(&img, &face(200.0, 150.0, 120.0, 150.0), 2.7);
        assert_eq!(crop.dimensions(), (80, 80));
    }

    #[test]
    fn test_softmax() {
        let p = softmax(&[0.0, 0.0, 0.0]);
        assert!(p.iter().all(|v| (v - 1.0 / 3.0).abs() < 1e-6));
        let p = softmax(&[1000.0, 0.0]);
        assert!((p[0] - 1.0).abs() < 1e-6);
    }
}
