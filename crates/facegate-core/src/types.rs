use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

#[derive(Error, Debug, PartialEq)]
pub enum EmbeddingError {
    #[error("cannot average an empty set of embeddings")]
    Empty,
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Face embedding vector (512-dimensional for ArcFace).
///
/// Recognizers hand out the raw model output. Comparisons always go through
/// [`Embedding::normalized`] on both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// L2 norm of the raw values.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Unit-length copy. A zero vector stays zero.
    pub fn normalized(&self) -> Embedding {
        let norm = self.norm();
        let values = if norm > 0.0 {
            self.values.iter().map(|v| v / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }

    /// Cosine similarity: dot product of the two normalized vectors, in [-1, 1].
    ///
    /// Always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let a = self.normalized();
        let b = other.normalized();
        let dot: f32 = a.values.iter().zip(b.values.iter()).map(|(x, y)| x * y).sum();
        dot.clamp(-1.0, 1.0)
    }

    /// Element-wise arithmetic mean of raw embeddings.
    pub fn mean(embeddings: &[Embedding]) -> Result<Embedding, EmbeddingError> {
        let first = embeddings.first().ok_or(EmbeddingError::Empty)?;
        let dim = first.dim();

        let mut sum = vec![0.0f32; dim];
        for emb in embeddings {
            if emb.dim() != dim {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: dim,
                    actual: emb.dim(),
                });
            }
            for (acc, v) in sum.iter_mut().zip(emb.values.iter()) {
                *acc += v;
            }
        }

        let count = embeddings.len() as f32;
        Ok(Embedding {
            values: sum.into_iter().map(|v| v / count).collect(),
            model_version: first.model_version.clone(),
        })
    }
}

/// Face-match verdict. Serialized as the strings clients already expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaceMatch {
    #[serde(rename = "Matched")]
    Matched,
    #[serde(rename = "Not Matched")]
    NotMatched,
}

impl FaceMatch {
    /// Matched iff `similarity >= threshold`.
    pub fn from_similarity(similarity: f32, threshold: f32) -> Self {
        if similarity >= threshold {
            FaceMatch::Matched
        } else {
            FaceMatch::NotMatched
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FaceMatch::Matched => "Matched",
            FaceMatch::NotMatched => "Not Matched",
        }
    }
}

/// Liveness (anti-spoofing) verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liveness {
    Live,
    Spoof,
    Unknown,
}

impl Liveness {
    /// Live iff the real-face score is strictly above `threshold`.
    pub fn from_score(score: f32, threshold: f32) -> Self {
        if score > threshold {
            Liveness::Live
        } else {
            Liveness::Spoof
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Liveness::Live => "Live",
            Liveness::Spoof => "Spoof",
            Liveness::Unknown => "Unknown",
        }
    }
}

/// Dominant head direction reported by the pose classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadDirection {
    Front,
    Left,
    Right,
    Up,
    Unknown,
}

impl HeadDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeadDirection::Front => "Front",
            HeadDirection::Left => "Left",
            HeadDirection::Right => "Right",
            HeadDirection::Up => "Up",
            HeadDirection::Unknown => "Unknown",
        }
    }
}

/// Head-movement task the caller asked the user to perform.
///
/// `Down` is accepted but the pose classifier never reports it, so a `Down`
/// task is always judged incorrect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    Front,
    Left,
    Right,
    Up,
    Down,
}

impl Task {
    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Front => "Front",
            Task::Left => "Left",
            Task::Right => "Right",
            Task::Up => "Up",
            Task::Down => "Down",
        }
    }

    /// Label equality between the requested task and the detected direction.
    pub fn is_satisfied_by(&self, direction: HeadDirection) -> bool {
        self.as_str() == direction.as_str()
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("unknown task label: {0:?}")]
pub struct ParseTaskError(pub String);

impl FromStr for Task {
    type Err = ParseTaskError;

    /// Accepts the bare label ("Left") or the prompt form ("Look Left"),
    /// case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let label = trimmed
            .strip_prefix("Look ")
            .or_else(|| trimmed.strip_prefix("look "))
            .unwrap_or(trimmed)
            .trim();

        match label.to_ascii_lowercase().as_str() {
            "front" => Ok(Task::Front),
            "left" => Ok(Task::Left),
            "right" => Ok(Task::Right),
            "up" => Ok(Task::Up),
            "down" => Ok(Task::Down),
            _ => Err(ParseTaskError(s.to_string())),
        }
    }
}

/// Whether the detected head direction matched the requested task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskValidity {
    Correct,
    Incorrect,
}

impl TaskValidity {
    pub fn judge(task: Task, direction: HeadDirection) -> Self {
        if task.is_satisfied_by(direction) {
            TaskValidity::Correct
        } else {
            TaskValidity::Incorrect
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskValidity::Correct => "Correct",
            TaskValidity::Incorrect => "Incorrect",
        }
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        })*
    };
}

display_as_str!(FaceMatch, Liveness, HeadDirection, Task, TaskValidity);

/// Result of one verification call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationOutcome {
    pub face_match: FaceMatch,
    /// Cosine similarity in [-1, 1], full precision.
    pub similarity: f32,
    pub liveness: Liveness,
    pub task_validity: TaskValidity,
    /// Direction the pose classifier actually saw.
    pub detected_direction: HeadDirection,
}

impl VerificationOutcome {
    /// Similarity rounded to two decimals for reporting.
    pub fn similarity_rounded(&self) -> f64 {
        (self.similarity as f64 * 100.0).round() / 100.0
    }

    /// True when every check passed.
    pub fn is_verified(&self) -> bool {
        self.face_match == FaceMatch::Matched
            && self.liveness == Liveness::Live
            && self.task_validity == TaskValidity::Correct
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_scale_invariant() {
        let a = emb(&[3.0, 4.0]);
        let b = emb(&[0.3, 0.4]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_orthogonal() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_opposite() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_symmetric() {
        let a = emb(&[0.2, -0.7, 1.3, 0.05]);
        let b = emb(&[-0.4, 0.1, 0.9, 2.0]);
        assert_eq!(a.similarity(&b), b.similarity(&a));
    }

    #[test]
    fn test_similarity_zero_vector() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_normalized_is_unit_length() {
        let n = emb(&[3.0, 4.0]).normalized();
        assert!((n.norm() - 1.0).abs() < 1e-6);
        assert!((n.values[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_mean_of_two() {
        let mean = Embedding::mean(&[emb(&[1.0, 0.0]), emb(&[0.0, 1.0])]).unwrap();
        assert_eq!(mean.dim(), 2);
        assert_eq!(mean.values, vec![0.5, 0.5]);
    }

    #[test]
    fn test_mean_rejects_empty_and_mismatched() {
        assert_eq!(Embedding::mean(&[]).unwrap_err(), EmbeddingError::Empty);
        let err = Embedding::mean(&[emb(&[1.0, 0.0]), emb(&[1.0])]).unwrap_err();
        assert_eq!(err, EmbeddingError::DimensionMismatch { expected: 2, actual: 1 });
    }

    #[test]
    fn test_face_match_threshold_inclusive() {
        assert_eq!(FaceMatch::from_similarity(0.6, 0.6), FaceMatch::Matched);
        assert_eq!(FaceMatch::from_similarity(0.59, 0.6), FaceMatch::NotMatched);
    }

    #[test]
    fn test_liveness_threshold_exclusive() {
        assert_eq!(Liveness::from_score(0.51, 0.5), Liveness::Live);
        assert_eq!(Liveness::from_score(0.5, 0.5), Liveness::Spoof);
    }

    #[test]
    fn test_task_parsing() {
        assert_eq!("Left".parse::<Task>().unwrap(), Task::Left);
        assert_eq!("look up".parse::<Task>().unwrap(), Task::Up);
        assert_eq!("Look Down".parse::<Task>().unwrap(), Task::Down);
        assert!("Sideways".parse::<Task>().is_err());
    }

    #[test]
    fn test_down_task_never_satisfied() {
        for dir in [
            HeadDirection::Front,
            HeadDirection::Left,
            HeadDirection::Right,
            HeadDirection::Up,
            HeadDirection::Unknown,
        ] {
            assert_eq!(TaskValidity::judge(Task::Down, dir), TaskValidity::Incorrect);
        }
    }

    #[test]
    fn test_verdict_serialization() {
        assert_eq!(serde_json::to_string(&FaceMatch::NotMatched).unwrap(), "\"Not Matched\"");
        assert_eq!(serde_json::to_string(&Liveness::Unknown).unwrap(), "\"Unknown\"");
        assert_eq!(serde_json::to_string(&TaskValidity::Correct).unwrap(), "\"Correct\"");
    }

    #[test]
    fn test_similarity_rounding() {
        let outcome = VerificationOutcome {
            face_match: FaceMatch::Matched,
            similarity: 0.8765,
            liveness: Liveness::Live,
            task_validity: TaskValidity::Correct,
            detected_direction: HeadDirection::Left,
        };
        assert_eq!(outcome.similarity_rounded(), 0.88);
        assert!(outcome.is_verified());
    }
}
