//! rollcall-store — Blob storage for annotated attendance photos.
//!
//! The pipeline only needs put/delete/get on an object store. Backends are
//! constructed from an explicit [`StoreConfig`]; nothing here reads the
//! process environment.

pub mod config;
pub mod fs;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub use config::{StoreBackend, StoreConfig};
pub use fs::FsStore;
pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Location of an uploaded blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub url: String,
    pub key: String,
    pub size: usize,
    pub stored_at: DateTime<Utc>,
}

/// External object store.
///
/// Assumed strongly consistent: a `get` after a successful `put` returns the
/// same bytes. `delete` on a missing key is a no-op.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `{path}/{file_name}`.
    async fn put(
        &self,
        bytes: Vec<u8>,
        path: &str,
        file_name: &str,
    ) -> Result<StoredObject, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Keys under `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Open the backend selected by `config`.
pub fn open(config: &StoreConfig) -> Arc<dyn BlobStore> {
    match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new(config.clone())),
        StoreBackend::Fs => Arc::new(FsStore::new(config.clone())),
    }
}

/// Join a storage path and file name into an object key.
///
/// Rejects empty file names and `.`/`..` segments so a key can never
/// escape its bucket on a filesystem backend.
pub fn object_key(path: &str, file_name: &str) -> Result<String, StoreError> {
    if file_name.is_empty() || file_name.contains('/') {
        return Err(StoreError::InvalidKey(format!("bad file name {file_name:?}")));
    }
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    segments.push(file_name);
    if segments.iter().any(|s| *s == "." || *s == "..") {
        return Err(StoreError::InvalidKey(format!("{path}/{file_name}")));
    }
    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_joins_segments() {
        assert_eq!(
            object_key("lectures/CS101/L1/annotated_images", "0.jpg").unwrap(),
            "lectures/CS101/L1/annotated_images/0.jpg"
        );
        assert_eq!(object_key("/a//b/", "c.jpg").unwrap(), "a/b/c.jpg");
        assert_eq!(object_key("", "c.jpg").unwrap(), "c.jpg");
    }

    #[test]
    fn test_object_key_rejects_traversal() {
        assert!(matches!(object_key("a/../b", "c.jpg"), Err(StoreError::InvalidKey(_))));
        assert!(matches!(object_key("a", ".."), Err(StoreError::InvalidKey(_))));
        assert!(matches!(object_key("a", ""), Err(StoreError::InvalidKey(_))));
        assert!(matches!(object_key("a", "x/y.jpg"), Err(StoreError::InvalidKey(_))));
    }
}
