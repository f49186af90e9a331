//! Enrollment: three captures in, one reference embedding out.

use crate::capability::{FaceEmbedder, InferenceError};
use crate::types::{Embedding, EmbeddingError};
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    /// `image` is the 1-based position in the front/left/right form.
    #[error("No face detected in image {image}")]
    NoFaceDetected { image: usize },
    #[error("embeddings cannot be combined: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),
}

/// The three registration captures.
pub struct EnrollmentCaptures<'a> {
    pub front: &'a RgbImage,
    pub left: &'a RgbImage,
    pub right: &'a RgbImage,
}

pub struct EnrollmentBuilder {
    embedder: Arc<dyn FaceEmbedder>,
}

impl EnrollmentBuilder {
    pub fn new(embedder: Arc<dyn FaceEmbedder>) -> Self {
        Self { embedder }
    }

    /// Mean of the raw left and right embeddings.
    ///
    /// The front capture only serves as the profile picture and does not
    /// contribute to the reference.
    pub fn build(&self, captures: &EnrollmentCaptures<'_>) -> Result<Embedding, EnrollError> {
        let sides = [(2, captures.left), (3, captures.right)];

        let mut embeddings = Vec::with_capacity(sides.len());
        for (image, capture) in sides {
            match self.embedder.embed(capture)? {
                Some(embedding) => embeddings.push(embedding),
                None => {
                    tracing::info!(image, "enrollment capture has no face");
                    return Err(EnrollError::NoFaceDetected { image });
                }
            }
        }

        let reference = Embedding::mean(&embeddings)?;
        tracing::info!(dim = reference.dim(), "reference embedding built");
        Ok(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    /// Embeds an image as its top-left pixel, or no face for black pixels.
    struct PixelEmbedder;

    impl FaceEmbedder for PixelEmbedder {
        fn embed(&self, image: &RgbImage) -> Result<Option<Embedding>, InferenceError> {
            let p = image.get_pixel(0, 0);
            if p.0 == [0, 0, 0] {
                return Ok(None);
            }
            Ok(Some(Embedding::new(p.0.iter().map(|&v| v as f32).collect())))
        }
    }

    fn px(r: u8, g: u8, b: u8) -> RgbImage {
        RgbImage::from_pixel(4, 4, Rgb([r, g, b]))
    }

    fn builder() -> EnrollmentBuilder {
        EnrollmentBuilder::new(Arc::new(PixelEmbedder))
    }

    #[test]
    fn test_reference_is_mean_of_sides() {
        let (front, left, right) = (px(9, 9, 9), px(10, 0, 2), px(0, 10, 4));
        let reference = builder()
            .build(&EnrollmentCaptures { front: &front, left: &left, right: &right })
            .unwrap();
        assert_eq!(reference.values, vec![5.0, 5.0, 3.0]);
    }

    #[test]
    fn test_front_capture_is_not_part_of_reference() {
        let (left, right) = (px(10, 0, 2), px(0, 10, 4));
        let a = builder()
            .build(&EnrollmentCaptures { front: &px(1, 1, 1), left: &left, right: &right })
            .unwrap();
        let b = builder()
            .build(&EnrollmentCaptures { front: &px(200, 7, 50), left: &left, right: &right })
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_faceless_front_is_accepted() {
        let (front, left, right) = (px(0, 0, 0), px(1, 2, 3), px(3, 2, 1));
        assert!(builder().build(&EnrollmentCaptures { front: &front, left: &left, right: &right }).is_ok());
    }

    #[test]
    fn test_faceless_left_is_image_2() {
        let (front, left, right) = (px(1, 1, 1), px(0, 0, 0), px(0, 0, 0));
        let err = builder()
            .build(&EnrollmentCaptures { front: &front, left: &left, right: &right })
            .unwrap_err();
        assert!(matches!(err, EnrollError::NoFaceDetected { image: 2 }));
        assert_eq!(err.to_string(), "No face detected in image 2");
    }

    #[test]
    fn test_faceless_right_is_image_3() {
        let (front, left, right) = (px(1, 1, 1), px(5, 5, 5), px(0, 0, 0));
        let err = builder()
            .build(&EnrollmentCaptures { front: &front, left: &left, right: &right })
            .unwrap_err();
        assert!(matches!(err, EnrollError::NoFaceDetected { image: 3 }));
    }
}
