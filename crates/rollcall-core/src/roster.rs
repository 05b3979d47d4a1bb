//! Roster index: flattened reference embeddings for one verification request.
//!
//! Built fresh from the caller's roster on every request and dropped afterwards.
//! Holds no cross-request state.

use crate::types::{Embedding, Student};
use std::collections::HashMap;

/// One searchable reference vector and the student that owns it.
#[derive(Debug, Clone)]
struct IndexEntry {
    student: usize,
    embedding: Embedding,
}

/// Read-only lookup structure over every student's reference embeddings.
#[derive(Debug, Clone, Default)]
pub struct RosterIndex {
    /// Every known student id, in first-seen order. Includes students with no vectors.
    student_ids: Vec<String>,
    entries: Vec<IndexEntry>,
}

impl RosterIndex {
    /// Flatten the roster into a single searchable collection.
    ///
    /// Students appearing more than once under the same id are merged.
    pub fn build(students: &[Student]) -> Self {
        let mut positions: HashMap<&str, usize> = HashMap::with_capacity(students.len());
        let mut student_ids = Vec::with_capacity(students.len());
        let total: usize = students.iter().map(|s| s.reference_embeddings.len()).sum();
        let mut entries = Vec::with_capacity(total);

        for student in students {
            let idx = *positions.entry(student.id.as_str()).or_insert_with(|| {
                student_ids.push(student.id.clone());
                student_ids.len() - 1
            });
            entries.extend(student.reference_embeddings.iter().map(|embedding| IndexEntry {
                student: idx,
                embedding: embedding.clone(),
            }));
        }

        tracing::debug!(
            students = student_ids.len(),
            embeddings = entries.len(),
            "roster index built"
        );

        Self {
            student_ids,
            entries,
        }
    }

    /// True when there is nothing to match against.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn student_count(&self) -> usize {
        self.student_ids.len()
    }

    pub fn embedding_count(&self) -> usize {
        self.entries.len()
    }

    /// Dimensionality of the reference vectors, if there are any.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.dimension())
    }

    pub fn student_ids(&self) -> impl Iterator<Item = &str> {
        self.student_ids.iter().map(String::as_str)
    }

    pub fn contains_student(&self, id: &str) -> bool {
        self.student_ids.iter().any(|s| s == id)
    }

    pub(crate) fn student_id(&self, idx: usize) -> &str {
        &self.student_ids[idx]
    }

    /// `(student position, reference embedding)` pairs.
    pub(crate) fn entries(&self) -> impl Iterator<Item = (usize, &Embedding)> {
        self.entries.iter().map(|e| (e.student, &e.embedding))
    }
}
