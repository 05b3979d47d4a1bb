//! Face matching against a roster index.
//!
//! Distances are Euclidean, the metric the upstream embedder is trained for.
//! Lower is closer; a face matches when its best distance is strictly below
//! the threshold.

use crate::roster::RosterIndex;
use crate::types::{EmbeddingDefect, FaceObservation, MatchResult};
use thiserror::Error;

/// Distance threshold used when none is configured. Lower = stricter.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(#[from] EmbeddingDefect),
}

/// Strategy for comparing one observed face against the roster.
pub trait Matcher {
    fn compare(
        &self,
        observation: &FaceObservation,
        index: &RosterIndex,
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Nearest-student matcher: per-student minimum distance, then global minimum.
///
/// Equal distances resolve to the lexicographically smallest student id so the
/// choice never depends on roster order.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        observation: &FaceObservation,
        index: &RosterIndex,
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        observation.embedding.validate(index.dimension())?;

        // Best image wins: keep each student's closest reference.
        let mut best_per_student = vec![f32::INFINITY; index.student_count()];
        for (student, reference) in index.entries() {
            let d = observation.embedding.euclidean_distance(reference);
            if d < best_per_student[student] {
                best_per_student[student] = d;
            }
        }

        let mut best: Option<(usize, f32)> = None;
        for (student, &d) in best_per_student.iter().enumerate() {
            // Students without reference vectors never leave INFINITY.
            if !d.is_finite() {
                continue;
            }
            let is_better = match best {
                None => true,
                Some((prev, prev_d)) => {
                    d < prev_d
                        || (d == prev_d && index.student_id(student) < index.student_id(prev))
                }
            };
            if is_better {
                best = Some((student, d));
            }
        }

        let result = match best {
            Some((student, d)) if d < threshold => MatchResult {
                observation: observation.clone(),
                matched_student_id: Some(index.student_id(student).to_string()),
                distance: Some(d),
            },
            Some((_, d)) => MatchResult {
                observation: observation.clone(),
                matched_student_id: None,
                distance: Some(d),
            },
            None => MatchResult::unknown(observation.clone()),
        };

        Ok(result)
    }
}

/// Match results for every face in one image.
#[derive(Debug, Clone, Default)]
pub struct ImageMatches {
    /// One result per observation, in detection order.
    pub results: Vec<MatchResult>,
    /// Faces that were degraded to "Unknown" because matching failed.
    pub warnings: Vec<String>,
}

impl ImageMatches {
    /// Matched student ids in detection order.
    pub fn matched_ids(&self) -> Vec<String> {
        self.results
            .iter()
            .filter_map(|r| r.matched_student_id.clone())
            .collect()
    }
}

/// Match every face of an image.
///
/// A face whose embedding is malformed is labelled unknown and recorded as a
/// warning; the remaining faces are still matched.
pub fn match_faces<M: Matcher + ?Sized>(
    matcher: &M,
    observations: Vec<FaceObservation>,
    index: &RosterIndex,
    threshold: f32,
) -> ImageMatches {
    let mut matches = ImageMatches {
        results: Vec::with_capacity(observations.len()),
        warnings: Vec::new(),
    };

    for (i, observation) in observations.into_iter().enumerate() {
        match matcher.compare(&observation, index, threshold) {
            Ok(result) => {
                tracing::debug!(
                    face = i,
                    student = ?result.matched_student_id,
                    distance = ?result.distance,
                    "face matched"
                );
                matches.results.push(result);
            }
            Err(err) => {
                tracing::warn!(face = i, error = %err, "face degraded to unknown");
                matches.warnings.push(format!("face {i}: {err}"));
                matches.results.push(MatchResult::unknown(observation));
            }
        }
    }

    matches
}
