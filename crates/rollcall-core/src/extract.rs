//! Embedding extraction seam.
//!
//! Detection and embedding happen in an external face model. This module
//! defines the interface the pipeline consumes and a table-backed
//! implementation fed by the model's precomputed output.

use crate::types::{Embedding, FaceObservation, ImageInput};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("extraction failed for {image}: {reason}")]
    Failed { image: String, reason: String },
    #[error("detection table is malformed: {0}")]
    Table(#[from] serde_json::Error),
    #[error("cannot read detection table: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of face observations for an image.
///
/// Implementations must be deterministic for a fixed model version.
pub trait EmbeddingExtractor: Send + Sync {
    /// Every detected face in `image`, in detection order.
    fn extract_embeddings(&self, image: &ImageInput) -> Result<Vec<FaceObservation>, ExtractError>;

    /// Embedding of the first detected face, or `None` when there is no face.
    fn extract_primary_embedding(
        &self,
        image: &ImageInput,
    ) -> Result<Option<Embedding>, ExtractError> {
        Ok(self
            .extract_embeddings(image)?
            .into_iter()
            .next()
            .map(|face| face.embedding))
    }
}

/// Precomputed detections keyed by image file name.
///
/// JSON shape: `{ "photo.jpg": [{ "bounding_box": {..}, "embedding": [..] }, ..] }`.
/// Images absent from the table have no detected faces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectionTable {
    faces: BTreeMap<String, Vec<FaceObservation>>,
}

impl DetectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, file_name: impl Into<String>, faces: Vec<FaceObservation>) {
        self.faces.insert(file_name.into(), faces);
    }

    pub fn from_json(json: &str) -> Result<Self, ExtractError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, ExtractError> {
        let table = Self::from_json(&std::fs::read_to_string(path)?)?;
        tracing::info!(path = %path.display(), images = table.len(), "loaded detection table");
        Ok(table)
    }

    /// Number of images with recorded detections.
    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }
}

impl EmbeddingExtractor for DetectionTable {
    fn extract_embeddings(&self, image: &ImageInput) -> Result<Vec<FaceObservation>, ExtractError> {
        Ok(self.faces.get(&image.file_name).cloned().unwrap_or_default())
    }
}
