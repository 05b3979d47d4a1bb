//! Request and response shapes exchanged with the attendance backend.
//!
//! Field names are camelCase on the wire.

use crate::saga::VerificationOutcome;
use rollcall_core::{EnrolledEmbedding, ImageInput, Student};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Display;
use thiserror::Error;

/// Request-level failures. Anything narrower is reported per image.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("no images supplied")]
    NoImages,
    #[error("malformed roster: {0}")]
    MalformedRoster(String),
    #[error("roster is not valid JSON: {0}")]
    RosterJson(#[from] serde_json::Error),
    #[error("worker failed: {0}")]
    Worker(String),
}

/// One student in the roster payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: String,
    #[serde(default)]
    pub embeddings: Vec<EnrolledEmbedding>,
}

/// Parse a roster payload: a JSON array of [`RosterEntry`].
pub fn parse_roster(json: &str) -> Result<Vec<RosterEntry>, RequestError> {
    Ok(serde_json::from_str(json)?)
}

/// Validate roster entries and convert them to students.
///
/// Rejects empty or duplicate ids, empty or non-finite vectors, and vectors
/// whose length differs from the first one seen.
pub fn roster_students(entries: &[RosterEntry]) -> Result<Vec<Student>, RequestError> {
    let mut seen = HashSet::with_capacity(entries.len());
    let mut dimension: Option<usize> = None;
    let mut students = Vec::with_capacity(entries.len());

    for entry in entries {
        if entry.id.trim().is_empty() {
            return Err(RequestError::MalformedRoster("student with empty id".into()));
        }
        if !seen.insert(entry.id.as_str()) {
            return Err(RequestError::MalformedRoster(format!("duplicate student id {}", entry.id)));
        }
        for enrolled in &entry.embeddings {
            enrolled.embedding.validate(dimension).map_err(|defect| {
                let location = format!("{} / {}", entry.id, enrolled.image);
                RequestError::MalformedRoster(format!("{location}: {defect}"))
            })?;
            dimension.get_or_insert(enrolled.embedding.dimension());
        }
        students.push(Student::new(
            entry.id.clone(),
            entry.embeddings.iter().map(|e| e.embedding.clone()).collect(),
        ));
    }

    Ok(students)
}

/// Storage path helpers.
pub struct StoragePath;

impl StoragePath {
    /// Prefix for a lecture's annotated images.
    pub fn lecture(subject_id: &str, lecture_id: &str) -> String {
        format!("lectures/{subject_id}/{lecture_id}/annotated_images")
    }
}

/// A batch of classroom photos to verify against a roster.
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub images: Vec<ImageInput>,
    pub roster: Vec<RosterEntry>,
    /// Prefix under which annotated images are stored.
    pub storage_path: String,
}

/// Per-image entry of a verification response.
///
/// A failed image carries `error` and never a `url`/`key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageReport {
    pub file_name: String,
    /// Size of the stored annotated image, or of the received image on failure.
    pub file_size: usize,
    pub matched_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImageReport {
    pub fn succeeded(outcome: &VerificationOutcome) -> Self {
        Self {
            file_name: outcome.image_identifier.clone(),
            file_size: outcome.rendered_image_bytes.len(),
            matched_ids: outcome.matched_ids.clone(),
            url: Some(outcome.storage_url.clone()),
            key: Some(outcome.storage_key.clone()),
            warnings: outcome.warnings.clone(),
            error: None,
        }
    }

    pub fn failed(file_name: impl Into<String>, file_size: usize, error: impl Display) -> Self {
        Self {
            file_name: file_name.into(),
            file_size,
            matched_ids: Vec::new(),
            url: None,
            key: None,
            warnings: Vec::new(),
            error: Some(error.to_string()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyResponse {
    /// One entry per input image, in input order.
    pub results: Vec<ImageReport>,
}

impl VerifyResponse {
    /// Storage keys referenced by successful results.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.results.iter().filter_map(|r| r.key.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub embeddings: Vec<EnrolledEmbedding>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::Embedding;

    fn entry(id: &str, vectors: &[&[f32]]) -> RosterEntry {
        RosterEntry {
            id: id.into(),
            embeddings: vectors
                .iter()
                .enumerate()
                .map(|(i, v)| EnrolledEmbedding {
                    image: format!("{id}-{i}.jpg"),
                    embedding: Embedding::new(v.to_vec()),
                })
                .collect(),
        }
    }

    #[test]
    fn test_parse_roster_payload() {
        let json = r#"[
            { "id": "21CS001", "embeddings": [ { "image": "a.jpg", "embedding": [0.1, 0.2] } ] },
            { "id": "21CS002", "embeddings": [] },
            { "id": "21CS003" }
        ]"#;
        let entries = parse_roster(json).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[2].embeddings.is_empty());

        let students = roster_students(&entries).unwrap();
        assert_eq!(students[0].reference_embeddings[0].values, vec![0.1, 0.2]);
        assert!(students[1].reference_embeddings.is_empty());
    }

    #[test]
    fn test_parse_roster_rejects_non_json() {
        assert!(matches!(parse_roster("{not json"), Err(RequestError::RosterJson(_))));
        assert!(matches!(parse_roster(r#"{"id": "x"}"#), Err(RequestError::RosterJson(_))));
    }

    #[test]
    fn test_duplicate_id_is_malformed() {
        let err = roster_students(&[entry("S1", &[&[0.1]]), entry("S1", &[&[0.2]])]).unwrap_err();
        assert!(matches!(err, RequestError::MalformedRoster(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn test_empty_id_is_malformed() {
        assert!(matches!(
            roster_students(&[entry("  ", &[])]),
            Err(RequestError::MalformedRoster(_))
        ));
    }

    #[test]
    fn test_mixed_dimensions_are_malformed() {
        let err = roster_students(&[entry("S1", &[&[0.1, 0.2]]), entry("S2", &[&[0.1, 0.2, 0.3]])]);
        assert!(matches!(err, Err(RequestError::MalformedRoster(_))));
    }

    #[test]
    fn test_non_finite_roster_embedding_is_malformed() {
        let err = roster_students(&[entry("S1", &[&[f32::NAN, 0.2]])]);
        assert!(matches!(err, Err(RequestError::MalformedRoster(msg)) if msg.contains("S1")));
    }

    #[test]
    fn test_empty_roster_is_valid() {
        assert!(roster_students(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_lecture_path() {
        assert_eq!(StoragePath::lecture("CS101", "L7"), "lectures/CS101/L7/annotated_images");
    }

    #[test]
    fn test_report_wire_shape() {
        let outcome = VerificationOutcome {
            image_identifier: "class.jpg".into(),
            matched_ids: vec!["S1".into()],
            rendered_image_bytes: vec![0; 12],
            storage_url: "https://b.s3.r.amazonaws.com/k.jpg".into(),
            storage_key: "k.jpg".into(),
            warnings: vec![],
        };
        let json = serde_json::to_value(ImageReport::succeeded(&outcome)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "fileName": "class.jpg",
                "fileSize": 12,
                "matchedIds": ["S1"],
                "url": "https://b.s3.r.amazonaws.com/k.jpg",
                "key": "k.jpg",
            })
        );

        let failed =
            serde_json::to_value(ImageReport::failed("bad.jpg", 3, "upload failed")).unwrap();
        assert_eq!(failed["error"], "upload failed");
        assert!(failed.get("key").is_none());
        assert!(failed.get("url").is_none());
    }
}
