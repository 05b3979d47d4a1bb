//! In-memory blob store for tests and dry runs.

use crate::{object_key, BlobStore, StoreConfig, StoreError, StoredObject};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Blob store backed by a shared `BTreeMap`. Clones share contents.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    config: StoreConfig,
    data: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            data: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.data.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>, StoreError> {
        self.data
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn put(
        &self,
        bytes: Vec<u8>,
        path: &str,
        file_name: &str,
    ) -> Result<StoredObject, StoreError> {
        let key = object_key(path, file_name)?;
        let size = bytes.len();
        self.lock()?.insert(key.clone(), bytes);
        Ok(StoredObject {
            url: self.config.url_for(&key),
            key,
            size,
            stored_at: chrono::Utc::now(),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.lock()?
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
