use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label rendered and reported for a face that matched no student.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Face bounding box in pixel coordinates.
///
/// Field order follows the `(top, right, bottom, left)` convention used by the
/// upstream detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl BoundingBox {
    pub fn new(top: u32, right: u32, bottom: u32, left: u32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

/// Why an embedding cannot take part in matching.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingDefect {
    #[error("embedding is empty")]
    Empty,
    #[error("expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("non-finite value at index {index}")]
    NonFinite { index: usize },
}

/// Face embedding vector (128-dimensional for the dlib ResNet model).
///
/// Serialized as a bare number array, the shape used by roster payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Check that the vector is non-empty, finite, and (if given) of the expected length.
    pub fn validate(&self, expected_dim: Option<usize>) -> Result<(), EmbeddingDefect> {
        if self.values.is_empty() {
            return Err(EmbeddingDefect::Empty);
        }
        if let Some(expected) = expected_dim {
            if self.values.len() != expected {
                return Err(EmbeddingDefect::DimensionMismatch {
                    expected,
                    actual: self.values.len(),
                });
            }
        }
        if let Some(index) = self.values.iter().position(|v| !v.is_finite()) {
            return Err(EmbeddingDefect::NonFinite { index });
        }
        Ok(())
    }
}

/// An enrolled student and the reference embeddings taken from their photos.
///
/// `reference_embeddings` may be empty; such a student is known but can never match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub reference_embeddings: Vec<Embedding>,
}

impl Student {
    pub fn new(id: impl Into<String>, reference_embeddings: Vec<Embedding>) -> Self {
        Self {
            id: id.into(),
            reference_embeddings,
        }
    }
}

/// One detected face: where it is and what it looks like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceObservation {
    pub bounding_box: BoundingBox,
    pub embedding: Embedding,
}

/// Outcome of matching one observation against the roster.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub observation: FaceObservation,
    /// ID of the matched student, `None` when the face is unknown.
    pub matched_student_id: Option<String>,
    /// Best per-student distance seen, matched or not.
    pub distance: Option<f32>,
}

impl MatchResult {
    /// An unmatched result carrying no distance.
    pub fn unknown(observation: FaceObservation) -> Self {
        Self {
            observation,
            matched_student_id: None,
            distance: None,
        }
    }

    pub fn is_matched(&self) -> bool {
        self.matched_student_id.is_some()
    }

    /// Text drawn under the face box.
    pub fn label(&self) -> &str {
        self.matched_student_id.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

/// A photograph as received from the caller.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl ImageInput {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
        }
    }
}

/// Primary embedding extracted from one enrollment image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledEmbedding {
    pub image: String,
    pub embedding: Embedding,
}
