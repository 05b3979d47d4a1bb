//! rollcall-core — Attendance matching engine.
//!
//! Matches face embeddings from classroom photos against a per-request roster
//! index, draws the outcome onto the photo, and builds enrollment embeddings.

pub mod enroll;
pub mod extract;
mod font;
pub mod matcher;
pub mod render;
pub mod roster;
pub mod types;

pub use enroll::{EnrollError, EnrollmentBuilder};
pub use extract::{DetectionTable, EmbeddingExtractor, ExtractError};
pub use matcher::{
    match_faces, EuclideanMatcher, ImageMatches, MatchError, Matcher, DEFAULT_MATCH_THRESHOLD,
};
pub use render::{AnnotationRenderer, RenderError, RenderOptions};
pub use roster::RosterIndex;
pub use types::{
    BoundingBox, Embedding, EmbeddingDefect, EnrolledEmbedding, FaceObservation, ImageInput,
    MatchResult, Student, UNKNOWN_LABEL,
};
