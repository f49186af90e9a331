//! Enrollment and verification wired together over fake capabilities.
//!
//! The fake embedder reads the top-left pixel as a 3-d "embedding" and treats
//! black as "no face", so each test picks its identities by colour.

use base64::{engine::general_purpose, Engine as _};
use facegate_core::antispoof::AntiSpoofError;
use facegate_core::mesh::MeshError;
use facegate_core::{
    Embedding, EnrollError, EnrollmentBuilder, EnrollmentCaptures, FaceEmbedder, FaceMatch,
    HeadDirection, HeadPoseClassifier, InferenceError, Liveness, LivenessDetector, LookupError,
    ReferenceLookup, Task, TaskValidity, VerificationOrchestrator, VerifyError,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

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

struct FixedLiveness(Option<Liveness>);

impl LivenessDetector for FixedLiveness {
    fn assess(&self, _: &RgbImage) -> Result<Liveness, InferenceError> {
        self.0.ok_or_else(|| AntiSpoofError::InferenceFailed("anti-spoof model crashed".into()).into())
    }
}

struct FixedPose(Option<HeadDirection>);

impl HeadPoseClassifier for FixedPose {
    fn classify(&self, _: &RgbImage) -> Result<HeadDirection, InferenceError> {
        self.0.ok_or_else(|| MeshError::InferenceFailed("mesh model crashed".into()).into())
    }
}

#[derive(Default)]
struct MemoryReferences(Mutex<HashMap<String, Embedding>>);

impl MemoryReferences {
    fn insert(&self, identity: &str, embedding: Embedding) {
        self.0.lock().unwrap().insert(identity.to_string(), embedding);
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl ReferenceLookup for MemoryReferences {
    fn reference_embedding(&self, identity: &str) -> Result<Option<Embedding>, LookupError> {
        Ok(self.0.lock().unwrap().get(identity).cloned())
    }
}

fn solid(rgb: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(8, 8, Rgb(rgb))
}

fn data_uri(image: &RgbImage) -> String {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    format!("data:image/png;base64,{}", general_purpose::STANDARD.encode(buf.into_inner()))
}

fn orchestrator(
    references: Arc<MemoryReferences>,
    liveness: Option<Liveness>,
    pose: Option<HeadDirection>,
) -> VerificationOrchestrator {
    VerificationOrchestrator::new(
        Arc::new(PixelEmbedder),
        Arc::new(FixedLiveness(liveness)),
        Arc::new(FixedPose(pose)),
        references,
    )
}

/// Enroll `identity` with the same colour in every capture; persist on success.
fn enroll(references: &MemoryReferences, identity: &str, captures: [[u8; 3]; 3]) -> Result<(), EnrollError> {
    let [front, left, right] = captures.map(solid);
    let reference = EnrollmentBuilder::new(Arc::new(PixelEmbedder)).build(&EnrollmentCaptures {
        front: &front,
        left: &left,
        right: &right,
    })?;
    references.insert(identity, reference);
    Ok(())
}

#[test]
fn identical_captures_match() {
    let references = Arc::new(MemoryReferences::default());
    enroll(&references, "ada@example.com", [[90, 60, 30]; 3]).unwrap();

    let verifier = orchestrator(references, Some(Liveness::Live), Some(HeadDirection::Left));
    let outcome = verifier
        .verify("ada@example.com", &data_uri(&solid([90, 60, 30])), Task::Left)
        .unwrap();

    assert_eq!(outcome.face_match, FaceMatch::Matched);
    assert!((outcome.similarity - 1.0).abs() < 1e-6);
    assert_eq!(outcome.similarity_rounded(), 1.0);
    assert_eq!(outcome.liveness, Liveness::Live);
    assert_eq!(outcome.task_validity, TaskValidity::Correct);
    assert!(outcome.is_verified());
}

#[test]
fn different_person_does_not_match() {
    let references = Arc::new(MemoryReferences::default());
    enroll(&references, "ada@example.com", [[200, 1, 1]; 3]).unwrap();

    let verifier = orchestrator(references, Some(Liveness::Live), Some(HeadDirection::Front));
    let outcome = verifier
        .verify("ada@example.com", &data_uri(&solid([1, 200, 1])), Task::Front)
        .unwrap();

    assert_eq!(outcome.face_match, FaceMatch::NotMatched);
    assert!(outcome.similarity < 0.6);
    assert!(!outcome.is_verified());
}

#[test]
fn similarity_threshold_is_configurable() {
    let references = Arc::new(MemoryReferences::default());
    enroll(&references, "ada@example.com", [[200, 1, 1]; 3]).unwrap();

    let verifier = orchestrator(references, Some(Liveness::Live), Some(HeadDirection::Front))
        .with_similarity_threshold(-1.0);
    let outcome = verifier
        .verify("ada@example.com", &data_uri(&solid([1, 200, 1])), Task::Front)
        .unwrap();
    assert_eq!(outcome.face_match, FaceMatch::Matched);
}

#[test]
fn missing_reference_is_reported() {
    let verifier = orchestrator(Arc::default(), Some(Liveness::Live), Some(HeadDirection::Front));
    let err = verifier
        .verify("nobody@example.com", &data_uri(&solid([9, 9, 9])), Task::Front)
        .unwrap_err();
    assert!(matches!(err, VerifyError::ReferenceNotFound));
    assert_eq!(err.to_string(), "Reference embedding not found for this user");
}

#[test]
fn invalid_image_is_rejected_before_lookup() {
    let verifier = orchestrator(Arc::default(), Some(Liveness::Live), Some(HeadDirection::Front));
    let err = verifier
        .verify("nobody@example.com", "data:image/png;base64,bm90IGFuIGltYWdl", Task::Front)
        .unwrap_err();
    assert!(matches!(err, VerifyError::InvalidImageFormat(_)));
}

#[test]
fn faceless_capture_is_reported() {
    let references = Arc::new(MemoryReferences::default());
    enroll(&references, "ada@example.com", [[90, 60, 30]; 3]).unwrap();

    let verifier = orchestrator(references, Some(Liveness::Live), Some(HeadDirection::Front));
    let err = verifier
        .verify("ada@example.com", &data_uri(&solid([0, 0, 0])), Task::Front)
        .unwrap_err();
    assert!(matches!(err, VerifyError::NoFaceDetected));
}

#[test]
fn faceless_enrollment_persists_nothing() {
    let references = Arc::new(MemoryReferences::default());
    let err = enroll(&references, "ada@example.com", [[90, 60, 30], [90, 60, 30], [0, 0, 0]]).unwrap_err();
    assert_eq!(err.to_string(), "No face detected in image 3");
    assert_eq!(references.len(), 0);

    let verifier = orchestrator(references, Some(Liveness::Live), Some(HeadDirection::Front));
    let err = verifier
        .verify("ada@example.com", &data_uri(&solid([90, 60, 30])), Task::Front)
        .unwrap_err();
    assert!(matches!(err, VerifyError::ReferenceNotFound));
}

#[test]
fn liveness_failure_does_not_block_other_verdicts() {
    let references = Arc::new(MemoryReferences::default());
    enroll(&references, "ada@example.com", [[90, 60, 30]; 3]).unwrap();

    let verifier = orchestrator(references, None, Some(HeadDirection::Right));
    let outcome = verifier
        .verify("ada@example.com", &data_uri(&solid([90, 60, 30])), Task::Right)
        .unwrap();

    assert_eq!(outcome.liveness, Liveness::Unknown);
    assert_eq!(outcome.face_match, FaceMatch::Matched);
    assert_eq!(outcome.task_validity, TaskValidity::Correct);
    assert!(!outcome.is_verified());
}

#[test]
fn pose_failure_makes_task_incorrect() {
    let references = Arc::new(MemoryReferences::default());
    enroll(&references, "ada@example.com", [[90, 60, 30]; 3]).unwrap();

    let verifier = orchestrator(references, Some(Liveness::Live), None);
    let outcome = verifier
        .verify("ada@example.com", &data_uri(&solid([90, 60, 30])), Task::Front)
        .unwrap();

    assert_eq!(outcome.detected_direction, HeadDirection::Unknown);
    assert_eq!(outcome.task_validity, TaskValidity::Incorrect);
    assert_eq!(outcome.face_match, FaceMatch::Matched);
}

#[test]
fn down_task_is_never_correct() {
    let references = Arc::new(MemoryReferences::default());
    enroll(&references, "ada@example.com", [[90, 60, 30]; 3]).unwrap();

    for direction in [
        HeadDirection::Front,
        HeadDirection::Left,
        HeadDirection::Right,
        HeadDirection::Up,
        HeadDirection::Unknown,
    ] {
        let verifier = orchestrator(Arc::clone(&references), Some(Liveness::Live), Some(direction));
        let outcome = verifier
            .verify("ada@example.com", &data_uri(&solid([90, 60, 30])), Task::Down)
            .unwrap();
        assert_eq!(outcome.task_validity, TaskValidity::Incorrect, "{direction}");
    }
}

#[test]
fn reference_is_mean_of_side_captures() {
    let references = MemoryReferences::default();
    enroll(&references, "ada@example.com", [[7, 7, 7], [100, 0, 1], [0, 100, 1]]).unwrap();
    let reference = references.reference_embedding("ada@example.com").unwrap().unwrap();
    assert_eq!(reference.values, vec![50.0, 50.0, 1.0]);
}
