//! Verification: one capture, a claimed identity and a head-movement task in;
//! match, liveness and task verdicts out.

use crate::capability::{
    FaceEmbedder, HeadPoseClassifier, InferenceError, LivenessDetector, LookupError, ReferenceLookup,
};
use crate::capture::{self, DecodeError};
use crate::types::{
    Embedding, EmbeddingError, FaceMatch, HeadDirection, Liveness, Task, TaskValidity,
    VerificationOutcome,
};
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

/// Cosine similarity at or above which two faces are the same person.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Invalid image format")]
    InvalidImageFormat(#[source] DecodeError),
    #[error("Reference embedding not found for this user")]
    ReferenceNotFound,
    #[error("No face detected in the captured image")]
    NoFaceDetected,
    #[error("capture and reference are incomparable: {0}")]
    Incomparable(#[from] EmbeddingError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("face embedding failed: {0}")]
    Inference(#[from] InferenceError),
}

pub struct VerificationOrchestrator {
    embedder: Arc<dyn FaceEmbedder>,
    liveness: Arc<dyn LivenessDetector>,
    pose: Arc<dyn HeadPoseClassifier>,
    references: Arc<dyn ReferenceLookup>,
    similarity_threshold: f32,
}

impl VerificationOrchestrator {
    pub fn new(
        embedder: Arc<dyn FaceEmbedder>,
        liveness: Arc<dyn LivenessDetector>,
        pose: Arc<dyn HeadPoseClassifier>,
        references: Arc<dyn ReferenceLookup>,
    ) -> Self {
        Self {
            embedder,
            liveness,
            pose,
            references,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }

    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn similarity_threshold(&self) -> f32 {
        self.similarity_threshold
    }

    /// Full pipeline from an encoded capture (data URI or bare base64).
    pub fn verify(&self, identity: &str, payload: &str, task: Task) -> Result<VerificationOutcome, VerifyError> {
        let image = capture::decode_capture(payload).map_err(VerifyError::InvalidImageFormat)?;

        let reference = self
            .references
            .reference_embedding(identity)?
            .ok_or(VerifyError::ReferenceNotFound)?;

        let outcome = self.verify_against(&reference, &image, task)?;
        tracing::info!(
            identity,
            similarity = outcome.similarity,
            face_match = %outcome.face_match,
            liveness = %outcome.liveness,
            task = %task,
            direction = %outcome.detected_direction,
            task_validity = %outcome.task_validity,
            "verification complete"
        );
        Ok(outcome)
    }

    /// Steps after reference lookup: embed, compare, liveness, pose.
    pub fn verify_against(
        &self,
        reference: &Embedding,
        image: &RgbImage,
        task: Task,
    ) -> Result<VerificationOutcome, VerifyError> {
        let captured = self.embedder.embed(image)?.ok_or(VerifyError::NoFaceDetected)?;
        if captured.dim() != reference.dim() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: reference.dim(),
                actual: captured.dim(),
            }
            .into());
        }

        let similarity = captured.similarity(reference);
        let face_match = FaceMatch::from_similarity(similarity, self.similarity_threshold);

        let liveness = self.liveness.assess(image).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "liveness check failed, reporting Unknown");
            Liveness::Unknown
        });

        let detected_direction = self.pose.classify(image).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "head pose failed, reporting Unknown");
            HeadDirection::Unknown
        });

        Ok(VerificationOutcome {
            face_match,
            similarity,
            liveness,
            task_validity: TaskValidity::judge(task, detected_direction),
            detected_direction,
        })
    }
}
