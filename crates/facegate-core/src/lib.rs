//! facegate-core: face verification engine.
//!
//! SCRFD detection, ArcFace embeddings, MiniFASNet liveness and face-mesh
//! head pose, all through ONNX Runtime on the CPU. The enrollment builder and
//! verification orchestrator depend only on the traits in [`capability`].

pub mod alignment;
pub mod antispoof;
pub mod backend;
pub mod capability;
pub mod capture;
pub mod detector;
pub mod enroll;
pub mod mesh;
pub mod pose;
pub mod recognizer;
pub mod types;
pub mod verify;

pub use capability::{FaceEmbedder, HeadPoseClassifier, InferenceError, LivenessDetector, LookupError, ReferenceLookup};
pub use enroll::{EnrollError, EnrollmentBuilder, EnrollmentCaptures};
pub use types::{
    BoundingBox, Embedding, FaceMatch, HeadDirection, Liveness, Task, TaskValidity, VerificationOutcome,
};
pub use verify::{VerificationOrchestrator, VerifyError, DEFAULT_SIMILARITY_THRESHOLD};
