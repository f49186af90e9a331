//! Fake capabilities for engine and HTTP tests.

use crate::engine::Pipeline;
use base64::{engine::general_purpose, Engine as _};
use facegate_core::{
    Embedding, EnrollmentBuilder, FaceEmbedder, HeadDirection, HeadPoseClassifier, InferenceError,
    Liveness, LivenessDetector, LookupError, ReferenceLookup, VerificationOrchestrator,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Top-left pixel as a 3-d embedding; black means no face.
pub struct PixelEmbedder;

impl FaceEmbedder for PixelEmbedder {
    fn embed(&self, image: &RgbImage) -> Result<Option<Embedding>, InferenceError> {
        let p = image.get_pixel(0, 0);
        if p.0 == [0, 0, 0] {
            return Ok(None);
        }
        Ok(Some(Embedding::new(p.0.iter().map(|&v| v as f32).collect())))
    }
}

pub struct SlowEmbedder(pub Duration);

impl FaceEmbedder for SlowEmbedder {
    fn embed(&self, image: &RgbImage) -> Result<Option<Embedding>, InferenceError> {
        std::thread::sleep(self.0);
        PixelEmbedder.embed(image)
    }
}

pub struct AlwaysLive;

impl LivenessDetector for AlwaysLive {
    fn assess(&self, _: &RgbImage) -> Result<Liveness, InferenceError> {
        Ok(Liveness::Live)
    }
}

pub struct AlwaysFront;

impl HeadPoseClassifier for AlwaysFront {
    fn classify(&self, _: &RgbImage) -> Result<HeadDirection, InferenceError> {
        Ok(HeadDirection::Front)
    }
}

#[derive(Default)]
pub struct MemoryReferences(Mutex<HashMap<String, Embedding>>);

impl MemoryReferences {
    pub fn insert(&self, identity: &str, embedding: Embedding) {
        self.0.lock().unwrap().insert(identity.to_string(), embedding);
    }
}

impl ReferenceLookup for MemoryReferences {
    fn reference_embedding(&self, identity: &str) -> Result<Option<Embedding>, LookupError> {
        Ok(self.0.lock().unwrap().get(identity).cloned())
    }
}

pub fn fake_pipeline(embedder: Arc<dyn FaceEmbedder>, references: Arc<dyn ReferenceLookup>) -> Pipeline {
    Pipeline {
        enrollment: EnrollmentBuilder::new(Arc::clone(&embedder)),
        verification: VerificationOrchestrator::new(
            embedder,
            Arc::new(AlwaysLive),
            Arc::new(AlwaysFront),
            references,
        ),
    }
}

pub fn solid(rgb: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(8, 8, Rgb(rgb))
}

pub fn data_uri(image: &RgbImage) -> String {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    format!("data:image/png;base64,{}", general_purpose::STANDARD.encode(buf.into_inner()))
}
