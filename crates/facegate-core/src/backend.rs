//! ONNX Runtime implementations of the pipeline capabilities.
//!
//! One SCRFD detector session is shared by the embedder, the liveness
//! detector and the pose classifier. Every session sits behind its own mutex
//! because `Session::run` needs exclusive access.

use crate::antispoof::AntiSpoofModel;
use crate::capability::{FaceEmbedder, HeadPoseClassifier, InferenceError, LivenessDetector};
use crate::detector::FaceDetector;
use crate::mesh::FaceMeshModel;
use crate::pose::HeadPoseSolver;
use crate::recognizer::FaceRecognizer;
use crate::types::{BoundingBox, Embedding, HeadDirection, Liveness};
use facegate_models::{models_with_role, ModelRole, FACE_MESH_MODEL, DETECTOR_MODEL, RECOGNIZER_MODEL};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// On-disk locations of every model the backends load.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
    /// Anti-spoofing ensemble members with their crop scales.
    pub antispoof: Vec<(PathBuf, f32)>,
    pub face_mesh: PathBuf,
}

impl ModelPaths {
    /// Standard file names from the model manifest, resolved under `dir`.
    pub fn from_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join(DETECTOR_MODEL),
            recognizer: dir.join(RECOGNIZER_MODEL),
            antispoof: models_with_role(ModelRole::AntiSpoof)
                .map(|m| (dir.join(m.name), m.crop_scale.unwrap_or(1.0)))
                .collect(),
            face_mesh: dir.join(FACE_MESH_MODEL),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, InferenceError> {
    mutex.lock().map_err(|_| InferenceError::Poisoned)
}

/// Most confident face, if any. The detector lock is released on return.
fn first_face(detector: &Mutex<FaceDetector>, image: &RgbImage) -> Result<Option<BoundingBox>, InferenceError> {
    let faces = lock(detector)?.detect(image)?;
    if faces.len() > 1 {
        tracing::debug!(count = faces.len(), "multiple faces, using the most confident");
    }
    Ok(faces.into_iter().next())
}

/// SCRFD + ArcFace.
pub struct OnnxFaceEmbedder {
    detector: Arc<Mutex<FaceDetector>>,
    recognizer: Mutex<FaceRecognizer>,
}

impl FaceEmbedder for OnnxFaceEmbedder {
    fn embed(&self, image: &RgbImage) -> Result<Option<Embedding>, InferenceError> {
        let Some(face) = first_face(&self.detector, image)? else {
            return Ok(None);
        };
        let embedding = lock(&self.recognizer)?.extract(image, &face)?;
        Ok(Some(embedding))
    }
}

/// SCRFD + MiniFASNet ensemble.
pub struct OnnxLivenessDetector {
    detector: Arc<Mutex<FaceDetector>>,
    model: Mutex<AntiSpoofModel>,
    threshold: f32,
}

impl LivenessDetector for OnnxLivenessDetector {
    fn assess(&self, image: &RgbImage) -> Result<Liveness, InferenceError> {
        let Some(face) = first_face(&self.detector, image)? else {
            return Ok(Liveness::Unknown);
        };
        let score = lock(&self.model)?.real_score(image, &face)?;
        let verdict = Liveness::from_score(score, self.threshold);
        tracing::debug!(score, threshold = self.threshold, %verdict, "liveness scored");
        Ok(verdict)
    }
}

/// SCRFD + face mesh + PnP head-pose solve.
pub struct MeshPoseClassifier {
    detector: Arc<Mutex<FaceDetector>>,
    mesh: Mutex<FaceMeshModel>,
    solver: HeadPoseSolver,
}

impl HeadPoseClassifier for MeshPoseClassifier {
    fn classify(&self, image: &RgbImage) -> Result<HeadDirection, InferenceError> {
        let Some(face) = first_face(&self.detector, image)? else {
            return Ok(HeadDirection::Unknown);
        };
        let Some(mesh) = lock(&self.mesh)?.landmarks(image, &face)? else {
            return Ok(HeadDirection::Unknown);
        };
        Ok(self.solver.classify(&mesh, image.width(), image.height())?)
    }
}

/// All three model-backed capabilities, loaded together.
pub struct OnnxBackends {
    pub embedder: Arc<OnnxFaceEmbedder>,
    pub liveness: Arc<OnnxLivenessDetector>,
    pub pose: Arc<MeshPoseClassifier>,
}

impl OnnxBackends {
    pub fn load(paths: &ModelPaths, liveness_threshold: f32) -> Result<Self, InferenceError> {
        let detector = Arc::new(Mutex::new(FaceDetector::load(&paths.detector)?));
        let recognizer = FaceRecognizer::load(&paths.recognizer)?;

        let members: Vec<(&Path, f32)> = paths.antispoof.iter().map(|(p, s)| (p.as_path(), *s)).collect();
        let antispoof = AntiSpoofModel::load(&members)?;
        let mesh = FaceMeshModel::load(&paths.face_mesh)?;

        tracing::info!(
            antispoof_members = members.len(),
            liveness_threshold,
            "model backends ready"
        );

        Ok(Self {
            embedder: Arc::new(OnnxFaceEmbedder {
                detector: Arc::clone(&detector),
                recognizer: Mutex::new(recognizer),
            }),
            liveness: Arc::new(OnnxLivenessDetector {
                detector: Arc::clone(&detector),
                model: Mutex::new(antispoof),
                threshold: liveness_threshold,
            }),
            pose: Arc::new(MeshPoseClassifier {
                detector,
                mesh: Mutex::new(mesh),
                solver: HeadPoseSolver::default(),
            }),
        })
    }
}
