//! Enrollment embedding builder.
//!
//! Turns a student's photos into reference embeddings: one per photo, taken
//! from the first detected face. Photos without a usable face are skipped.

use crate::extract::{EmbeddingExtractor, ExtractError};
use crate::types::{EmbeddingDefect, EnrolledEmbedding, ImageInput, Student};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no face detected")]
    DetectionFailure,
    #[error("extracted embedding is invalid: {0}")]
    InvalidEmbedding(#[from] EmbeddingDefect),
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

pub struct EnrollmentBuilder<'a, E: EmbeddingExtractor + ?Sized> {
    extractor: &'a E,
}

impl<'a, E: EmbeddingExtractor + ?Sized> EnrollmentBuilder<'a, E> {
    pub fn new(extractor: &'a E) -> Self {
        Self { extractor }
    }

    /// Primary embedding of a single photo.
    pub fn embed_one(&self, image: &ImageInput) -> Result<EnrolledEmbedding, EnrollError> {
        let embedding = self
            .extractor
            .extract_primary_embedding(image)?
            .ok_or(EnrollError::DetectionFailure)?;
        embedding.validate(None)?;
        Ok(EnrolledEmbedding {
            image: image.file_name.clone(),
            embedding,
        })
    }

    /// Embeddings for every photo that has a face, in input order.
    pub fn build(&self, images: &[ImageInput]) -> Vec<EnrolledEmbedding> {
        let mut out = Vec::with_capacity(images.len());
        for image in images {
            match self.embed_one(image) {
                Ok(enrolled) => out.push(enrolled),
                Err(EnrollError::DetectionFailure) => {
                    tracing::info!(image = %image.file_name, "enroll: no face detected, skipped");
                }
                Err(err) => {
                    tracing::warn!(image = %image.file_name, error = %err, "enroll: image skipped");
                }
            }
        }
        tracing::debug!(images = images.len(), embeddings = out.len(), "enroll: embeddings built");
        out
    }

    /// Build a roster entry from a student's photos. The result may carry no embeddings.
    pub fn build_student(&self, id: impl Into<String>, images: &[ImageInput]) -> Student {
        let reference_embeddings = self.build(images).into_iter().map(|e| e.embedding).collect();
        Student::new(id, reference_embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::DetectionTable;
    use crate::types::{BoundingBox, Embedding, FaceObservation};

    fn face(values: &[f32]) -> FaceObservation {
        FaceObservation {
            bounding_box: BoundingBox::new(0, 10, 10, 0),
            embedding: Embedding::new(values.to_vec()),
        }
    }

    fn table() -> DetectionTable {
        let mut t = DetectionTable::new();
        t.insert("solo.jpg", vec![face(&[0.1, 0.2, 0.3])]);
        t.insert("group.jpg", vec![face(&[0.9, 0.9, 0.9]), face(&[0.0, 0.0, 0.0])]);
        t.insert("empty.jpg", vec![]);
        t.insert("broken.jpg", vec![face(&[f32::NAN, 0.0, 0.0])]);
        t
    }

    fn img(name: &str) -> ImageInput {
        ImageInput::new(name, vec![1, 2, 3])
    }

    #[test]
    fn test_build_skips_faceless_images() {
        let t = table();
        let images = [img("solo.jpg"), img("empty.jpg"), img("missing.jpg")];
        let out = EnrollmentBuilder::new(&t).build(&images);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].image, "solo.jpg");
    }

    #[test]
    fn test_first_face_is_authoritative() {
        let t = table();
        let out = EnrollmentBuilder::new(&t).embed_one(&img("group.jpg")).unwrap();
        assert_eq!(out.embedding.values, vec![0.9, 0.9, 0.9]);
    }

    #[test]
    fn test_no_face_is_detection_failure() {
        let t = table();
        let err = EnrollmentBuilder::new(&t).embed_one(&img("empty.jpg")).unwrap_err();
        assert!(matches!(err, EnrollError::DetectionFailure));
    }

    #[test]
    fn test_invalid_embedding_is_skipped() {
        let t = table();
        let builder = EnrollmentBuilder::new(&t);
        assert!(matches!(
            builder.embed_one(&img("broken.jpg")),
            Err(EnrollError::InvalidEmbedding(_))
        ));
        assert!(builder.build(&[img("broken.jpg")]).is_empty());
    }

    #[test]
    fn test_enrollment_is_idempotent() {
        let t = table();
        let builder = EnrollmentBuilder::new(&t);
        let a = builder.build(&[img("solo.jpg")]);
        let b = builder.build(&[img("solo.jpg")]);
        assert_eq!(a[0].embedding.euclidean_distance(&b[0].embedding), 0.0);
    }

    #[test]
    fn test_build_student_without_faces_has_no_embeddings() {
        let t = table();
        let student = EnrollmentBuilder::new(&t).build_student("S9", &[img("empty.jpg")]);
        assert_eq!(student.id, "S9");
        assert!(student.reference_embeddings.is_empty());
    }
}
