//! Capability seams between the verification pipeline and its models/storage.
//!
//! The enrollment builder and verification orchestrator only see these
//! traits. ONNX-backed implementations live in [`crate::backend`]; tests plug
//! in fakes.

use crate::antispoof::AntiSpoofError;
use crate::detector::DetectorError;
use crate::mesh::MeshError;
use crate::pose::PoseError;
use crate::recognizer::RecognizerError;
use crate::types::{Embedding, HeadDirection, Liveness};
use image::RgbImage;
use thiserror::Error;

/// Failure inside a model-backed capability.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("anti-spoofing: {0}")]
    AntiSpoof(#[from] AntiSpoofError),
    #[error("face mesh: {0}")]
    Mesh(#[from] MeshError),
    #[error("pose solve: {0}")]
    Pose(#[from] PoseError),
    #[error("model lock poisoned")]
    Poisoned,
}

/// Image → raw embedding of the most confident face, `None` when no face.
pub trait FaceEmbedder: Send + Sync {
    fn embed(&self, image: &RgbImage) -> Result<Option<Embedding>, InferenceError>;
}

/// Image → liveness verdict. No face is `Ok(Liveness::Unknown)`.
pub trait LivenessDetector: Send + Sync {
    fn assess(&self, image: &RgbImage) -> Result<Liveness, InferenceError>;
}

/// Image → head direction of the most confident face. No face is
/// `Ok(HeadDirection::Unknown)`.
pub trait HeadPoseClassifier: Send + Sync {
    fn classify(&self, image: &RgbImage) -> Result<HeadDirection, InferenceError>;
}

#[derive(Error, Debug)]
#[error("reference lookup failed: {0}")]
pub struct LookupError(pub String);

/// Stored reference embedding for an identity (email), if enrolled.
pub trait ReferenceLookup: Send + Sync {
    fn reference_embedding(&self, identity: &str) -> Result<Option<Embedding>, LookupError>;
}
