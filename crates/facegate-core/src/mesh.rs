//! Dense face-mesh landmark model (468 points) via ONNX Runtime.
//!
//! The mesh network sees a square crop around the SCRFD box. Its landmarks
//! come back in crop pixels and are mapped to image-normalized coordinates:
//! `x`, `y` in [0, 1] of the image width/height and `z` as relative depth on
//! the same scale as `x`.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

pub const MESH_POINT_COUNT: usize = 468;
const MESH_INPUT_SIZE: u32 = 192;
/// Crop side relative to the larger side of the detector box.
const MESH_CROP_SCALE: f32 = 1.5;
const MESH_PRESENCE_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// One mesh landmark in image-normalized coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshPoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Full 468-point face mesh for one face.
#[derive(Debug, Clone)]
pub struct FaceMesh {
    pub points: Vec<MeshPoint>,
}

/// Square crop in source pixel coordinates; may extend past the image.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CropRegion {
    x0: i64,
    y0: i64,
    side: u32,
}

pub struct FaceMeshModel {
    session: Session,
}

impl FaceMeshModel {
    pub fn load(model_path: &Path) -> Result<Self, MeshError> {
        if !model_path.exists() {
            return Err(MeshError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face mesh model"
        );

        Ok(Self { session })
    }

    /// Landmarks for the face inside `face`, or `None` when the mesh model's
    /// presence score says there is no face in the crop.
    pub fn landmarks(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Option<FaceMesh>, MeshError> {
        let region = crop_region(face);
        let input = nhwc_tensor(&crop_square(image, region));

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut coords: Option<Vec<f32>> = None;
        let mut presence: Option<f32> = None;
        for (_, value) in outputs.iter() {
            let Ok((_, data)) = value.try_extract_tensor::<f32>() else {
                continue;
            };
            match data.len() {
                n if n == MESH_POINT_COUNT * 3 => coords = Some(data.to_vec()),
                1 => presence = Some(sigmoid(data[0])),
                _ => {}
            }
        }

        let coords = coords.ok_or_else(|| {
            MeshError::InferenceFailed(format!("no output with {} values", MESH_POINT_COUNT * 3))
        })?;

        if let Some(score) = presence {
            if score < MESH_PRESENCE_THRESHOLD {
                tracing::debug!(score, "face mesh presence below threshold");
                return Ok(None);
            }
        }

        Ok(Some(decode_points(&coords, region, image.width(), image.height())))
    }
}

fn crop_region(face: &BoundingBox) -> CropRegion {
    let side = (face.width.max(face.height) * MESH_CROP_SCALE).max(1.0);
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;
    CropRegion {
        x0: (cx - side / 2.0).round() as i64,
        y0: (cy - side / 2.0).round() as i64,
        side: side.round() as u32,
    }
}

/// Copy the crop region (black outside the image) and resize to the mesh input.
fn crop_square(image: &RgbImage, region: CropRegion) -> RgbImage {
    let square = RgbImage::from_fn(region.side, region.side, |x, y| {
        let (sx, sy) = (region.x0 + x as i64, region.y0 + y as i64);
        if sx < 0 || sy < 0 {
            return Rgb([0, 0, 0]);
        }
        image
            .get_pixel_checked(sx as u32, sy as u32)
            .copied()
            .unwrap_or(Rgb([0, 0, 0]))
    });
    imageops::resize(&square, MESH_INPUT_SIZE, MESH_INPUT_SIZE, FilterType::Triangle)
}

/// RGB crop → NHWC tensor scaled to [0, 1].
fn nhwc_tensor(crop: &RgbImage) -> Array4<f32> {
    let (w, h) = (crop.width() as usize, crop.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, h, w, 3));
    for (x, y, pixel) in crop.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, y as usize, x as usize, c]] = pixel[c] as f32 / 255.0;
        }
    }
    tensor
}

/// Flat `[x, y, z] × 468` in mesh-input pixels → image-normalized points.
fn decode_points(coords: &[f32], region: CropRegion, width: u32, height: u32) -> FaceMesh {
    let to_src = region.side as f32 / MESH_INPUT_SIZE as f32;
    let (w, h) = (width.max(1) as f32, height.max(1) as f32);

    let points = coords
        .chunks_exact(3)
        .map(|p| MeshPoint {
            x: (region.x0 as f32 + p[0] * to_src) / w,
            y: (region.y0 as f32 + p[1] * to_src) / h,
            z: p[2] * to_src / w,
        })
        .collect();

    FaceMesh { points }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
