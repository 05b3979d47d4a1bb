//! Filesystem blob store: one directory per bucket, keys map to relative paths.

use crate::{object_key, BlobStore, StoreConfig, StoreError, StoredObject};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Suffix of in-progress writes; never visible as keys.
const PARTIAL_SUFFIX: &str = ".partial";

/// In-progress write, removed on drop unless it was renamed into place.
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn keep(mut self) {
        self.committed = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "fs store: partial write removed");
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "fs store: partial write left behind"
                );
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FsStore {
    config: StoreConfig,
    bucket_dir: PathBuf,
}

impl FsStore {
    pub fn new(config: StoreConfig) -> Self {
        let bucket_dir = config.root.join(&config.bucket);
        Self { config, bucket_dir }
    }

    pub fn bucket_dir(&self) -> &Path {
        &self.bucket_dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let (dir, file) = key.rsplit_once('/').unwrap_or(("", key));
        // Re-validate: keys handed to delete/get come from callers.
        let checked = object_key(dir, file)?;
        Ok(self.bucket_dir.join(checked))
    }
}

#[async_trait]
impl BlobStore for FsStore {
    async fn put(
        &self,
        bytes: Vec<u8>,
        path: &str,
        file_name: &str,
    ) -> Result<StoredObject, StoreError> {
        let key = object_key(path, file_name)?;
        let target = self.path_for(&key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never observe a half-written object.
        let partial_name = format!(".{file_name}{PARTIAL_SUFFIX}");
        let partial = PartialFile::new(target.with_file_name(partial_name));
        let size = bytes.len();
        tokio::fs::write(&partial.path, bytes).await?;
        tokio::fs::rename(&partial.path, &target).await?;
        partial.keep();

        tracing::debug!(key = %key, size, "fs store: object written");
        Ok(StoredObject {
            url: self.config.url_for(&key),
            key,
            size,
            stored_at: chrono::Utc::now(),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(key)?).await {
            Ok(()) => {
                tracing::debug!(key, "fs store: object deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match tokio::fs::read(self.path_for(key)?).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut pending = vec![self.bucket_dir.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.to_string_lossy().ends_with(PARTIAL_SUFFIX) {
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&self.bucket_dir) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> FsStore {
        FsStore::new(StoreConfig {
            root: dir.path().to_path_buf(),
            bucket: "bucket".into(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let stored = store.put(b"abc".to_vec(), "lectures/s/l", "0.jpg").await.unwrap();
        assert_eq!(stored.key, "lectures/s/l/0.jpg");
        assert!(dir.path().join("bucket/lectures/s/l/0.jpg").exists());
        assert_eq!(store.get(&stored.key).await.unwrap(), b"abc".to_vec());

        store.delete(&stored.key).await.unwrap();
        assert!(matches!(store.get(&stored.key).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_missing_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        store(&dir).delete("nothing/here.jpg").await.unwrap();
    }

    #[tokio::test]
    async fn test_keys_lists_nested_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.put(vec![1], "a/b", "2.jpg").await.unwrap();
        store.put(vec![1], "a", "1.jpg").await.unwrap();
        store.put(vec![1], "c", "3.jpg").await.unwrap();

        assert_eq!(store.keys("a/").await.unwrap(), vec!["a/1.jpg", "a/b/2.jpg"]);
        assert_eq!(store.keys("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_keys_on_fresh_bucket_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(&dir).keys("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_rename_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        // A directory squatting on the target name makes the rename fail.
        let target = dir.path().join("bucket/a/0.jpg");
        std::fs::create_dir_all(target.join("occupied")).unwrap();

        assert!(matches!(store.put(vec![1, 2, 3], "a", "0.jpg").await, Err(StoreError::Io(_))));

        let names: Vec<String> = std::fs::read_dir(dir.path().join("bucket/a"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["0.jpg".to_string()]);
    }

    #[tokio::test]
    async fn test_traversal_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(matches!(store.get("../escape.jpg").await, Err(StoreError::InvalidKey(_))));
        assert!(matches!(store.put(vec![1], "..", "x.jpg").await, Err(StoreError::InvalidKey(_))));
    }
}
