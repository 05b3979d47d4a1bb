//! Batch result assembler: upload, record the outcome, delete the upload if recording fails.
//!
//! Each image goes through a two-step saga: the annotated JPEG is uploaded,
//! then its outcome is recorded. If recording fails the upload is deleted
//! again, so the store never holds a blob without a reported outcome and no
//! reported outcome points at a missing blob.
//!
//! ```text
//!            record ok
//! Uploaded ───────────────▶ Committed
//!     │      record failed, delete ok
//!     ├───────────────────▶ RolledBack
//!     │      record failed, delete failed
//!     └───────────────────▶ Orphaned
//! ```

use rollcall_store::{BlobStore, StoreError, StoredObject};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Pause between compensating delete attempts.
const DELETE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Terminal artifact for one successfully processed image.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationOutcome {
    pub image_identifier: String,
    /// Matched student ids in detection order.
    pub matched_ids: Vec<String>,
    pub rendered_image_bytes: Vec<u8>,
    pub storage_url: String,
    pub storage_key: String,
    /// Faces degraded to "Unknown" because their embedding was unusable.
    pub warnings: Vec<String>,
}

/// An annotated image ready to be stored.
#[derive(Debug, Clone)]
pub struct PendingOutcome {
    /// Position of the image in the request.
    pub slot: usize,
    pub image_identifier: String,
    pub matched_ids: Vec<String>,
    pub rendered: Vec<u8>,
    pub warnings: Vec<String>,
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("report serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("result slot {0} is unavailable")]
    Slot(usize),
    #[error("{0}")]
    Rejected(String),
}

/// Persists the outcome of one image once its upload succeeded.
pub trait OutcomeRecorder: Send + Sync {
    fn record(&self, slot: usize, outcome: &VerificationOutcome) -> Result<(), RecordError>;
}

/// Why a store call did not succeed.
#[derive(Error, Debug)]
pub enum StoreFailure {
    #[error(transparent)]
    Store(StoreError),
    #[error("timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
    /// The detached task running the call died.
    #[error("store task aborted: {0}")]
    Aborted(String),
}

#[derive(Error, Debug)]
pub enum AssembleError {
    #[error("upload failed: {0}")]
    Upload(StoreFailure),
    #[error("outcome not recorded ({0}); upload rolled back")]
    Record(RecordError),
    #[error("outcome not recorded ({record}); compensating delete of {key} failed: {delete}")]
    Delete {
        record: RecordError,
        key: String,
        delete: StoreFailure,
    },
}

impl AssembleError {
    /// Final saga state, or `None` when nothing was uploaded.
    pub fn saga_state(&self) -> Option<SagaState> {
        match self {
            AssembleError::Upload(_) => None,
            AssembleError::Record(_) => Some(SagaState::RolledBack),
            AssembleError::Delete { .. } => Some(SagaState::Orphaned),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaState {
    Uploaded,
    Committed,
    RolledBack,
    /// Rollback failed; the blob is still in the store with no outcome.
    Orphaned,
}

/// State of one upload within the saga. Only `Uploaded` may transition.
#[derive(Debug)]
pub struct UploadSaga {
    stored: StoredObject,
    state: SagaState,
}

impl UploadSaga {
    fn begin(stored: StoredObject) -> Self {
        tracing::debug!(key = %stored.key, "saga: uploaded");
        Self {
            stored,
            state: SagaState::Uploaded,
        }
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    pub fn stored(&self) -> &StoredObject {
        &self.stored
    }

    fn transition(&mut self, next: SagaState) {
        debug_assert_eq!(self.state, SagaState::Uploaded, "saga already settled");
        tracing::debug!(key = %self.stored.key, from = ?self.state, to = ?next, "saga transition");
        self.state = next;
    }
}

/// Uploads annotated images and records their outcomes, rolling back on failure.
#[derive(Clone)]
pub struct Assembler {
    store: Arc<dyn BlobStore>,
    timeout: Duration,
    delete_attempts: u32,
}

impl Assembler {
    pub fn new(store: Arc<dyn BlobStore>, timeout: Duration, delete_attempts: u32) -> Self {
        Self {
            store,
            timeout,
            delete_attempts: delete_attempts.max(1),
        }
    }

    /// Upload `pending` under `storage_path/file_name`, then record its outcome.
    pub async fn assemble(
        &self,
        pending: PendingOutcome,
        storage_path: &str,
        file_name: &str,
        recorder: &dyn OutcomeRecorder,
    ) -> Result<VerificationOutcome, AssembleError> {
        let PendingOutcome {
            slot,
            image_identifier,
            matched_ids,
            rendered,
            warnings,
        } = pending;

        // The put runs on its own task so a write that lands after the
        // timeout can still be found and removed.
        let store = Arc::clone(&self.store);
        let (path, name, bytes) =
            (storage_path.to_string(), file_name.to_string(), rendered.clone());
        let mut upload = tokio::spawn(async move { store.put(bytes, &path, &name).await });

        let stored = match tokio::time::timeout(self.timeout, &mut upload).await {
            Ok(Ok(Ok(stored))) => stored,
            Ok(Ok(Err(e))) => return Err(AssembleError::Upload(StoreFailure::Store(e))),
            Ok(Err(join)) => {
                return Err(AssembleError::Upload(StoreFailure::Aborted(join.to_string())));
            }
            Err(_) => {
                tracing::warn!(
                    path = storage_path,
                    file = file_name,
                    "upload timed out; late write will be removed"
                );
                self.remove_late_upload(upload);
                return Err(AssembleError::Upload(StoreFailure::TimedOut(self.timeout)));
            }
        };

        let mut saga = UploadSaga::begin(stored);
        let outcome = VerificationOutcome {
            image_identifier,
            matched_ids,
            rendered_image_bytes: rendered,
            storage_url: saga.stored().url.clone(),
            storage_key: saga.stored().key.clone(),
            warnings,
        };

        match recorder.record(slot, &outcome) {
            Ok(()) => {
                saga.transition(SagaState::Committed);
                tracing::info!(
                    image = %outcome.image_identifier,
                    key = %outcome.storage_key,
                    matched = outcome.matched_ids.len(),
                    "outcome committed"
                );
                Ok(outcome)
            }
            Err(record) => {
                let key = saga.stored().key.clone();
                tracing::warn!(
                    key = %key,
                    error = %record,
                    "outcome not recorded; rolling back upload"
                );
                match self.compensate(key.clone()).await {
                    Ok(Ok(())) => {
                        saga.transition(SagaState::RolledBack);
                        Err(AssembleError::Record(record))
                    }
                    Ok(Err(delete)) => {
                        saga.transition(SagaState::Orphaned);
                        tracing::error!(
                            key = %key,
                            error = %delete,
                            "compensating delete failed; blob orphaned"
                        );
                        Err(AssembleError::Delete { record, key, delete })
                    }
                    Err(join) => {
                        saga.transition(SagaState::Orphaned);
                        tracing::error!(
                            key = %key,
                            error = %join,
                            "compensating delete task died; blob orphaned"
                        );
                        Err(AssembleError::Delete {
                            record,
                            key,
                            delete: StoreFailure::Aborted(join.to_string()),
                        })
                    }
                }
            }
        }
    }

    /// Wait for an abandoned upload on a detached task and delete whatever it wrote.
    fn remove_late_upload(&self, upload: JoinHandle<Result<StoredObject, StoreError>>) {
        let assembler = self.clone();
        tokio::spawn(async move {
            let stored = match upload.await {
                Ok(Ok(stored)) => stored,
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "abandoned upload failed; nothing to remove");
                    return;
                }
                Err(join) => {
                    tracing::debug!(error = %join, "abandoned upload task died; nothing to remove");
                    return;
                }
            };
            tracing::warn!(key = %stored.key, "upload landed after timeout; deleting it");
            match assembler.compensate(stored.key.clone()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(
                        key = %stored.key,
                        error = %e,
                        "late upload not removed; blob orphaned"
                    );
                }
                Err(join) => {
                    tracing::error!(
                        key = %stored.key,
                        error = %join,
                        "late upload cleanup died; blob orphaned"
                    );
                }
            }
        });
    }

    /// Delete `key` on a detached task, retrying up to `delete_attempts` times.
    ///
    /// Runs to completion even if the caller is dropped.
    fn compensate(&self, key: String) -> JoinHandle<Result<(), StoreFailure>> {
        let store = Arc::clone(&self.store);
        let timeout = self.timeout;
        let attempts = self.delete_attempts;

        tokio::spawn(async move {
            let mut last = StoreFailure::Aborted("no delete attempted".into());
            for attempt in 1..=attempts {
                match tokio::time::timeout(timeout, store.delete(&key)).await {
                    Ok(Ok(())) => {
                        tracing::info!(key = %key, attempt, "compensating delete done");
                        return Ok(());
                    }
                    Ok(Err(e)) => last = StoreFailure::Store(e),
                    Err(_) => last = StoreFailure::TimedOut(timeout),
                }
                tracing::warn!(
                    key = %key,
                    attempt,
                    error = %last,
                    "compensating delete attempt failed"
                );
                if attempt < attempts {
                    tokio::time::sleep(DELETE_RETRY_DELAY).await;
                }
            }
            Err(last)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rollcall_store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Records outcomes in memory, or refuses every one.
    #[derive(Default)]
    struct TestRecorder {
        refuse: bool,
        recorded: Mutex<Vec<(usize, String)>>,
    }

    impl OutcomeRecorder for TestRecorder {
        fn record(&self, slot: usize, outcome: &VerificationOutcome) -> Result<(), RecordError> {
            if self.refuse {
                return Err(RecordError::Rejected("simulated late failure".into()));
            }
            self.recorded
                .lock()
                .unwrap()
                .push((slot, outcome.storage_key.clone()));
            Ok(())
        }
    }

    /// Store wrapper with injectable failures.
    struct FlakyStore {
        inner: MemoryStore,
        fail_put: bool,
        slow_put: bool,
        failing_deletes: AtomicU32,
        delete_calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(inner: MemoryStore) -> Self {
            Self {
                inner,
                fail_put: false,
                slow_put: false,
                failing_deletes: AtomicU32::new(0),
                delete_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl BlobStore for FlakyStore {
        async fn put(
            &self,
            bytes: Vec<u8>,
            path: &str,
            file_name: &str,
        ) -> Result<StoredObject, StoreError> {
            if self.fail_put {
                return Err(StoreError::Unavailable("bucket offline".into()));
            }
            if self.slow_put {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            self.inner.put(bytes, path, file_name).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failing_deletes.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_deletes.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("delete refused".into()));
            }
            self.inner.delete(key).await
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
            self.inner.get(key).await
        }

        async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.keys(prefix).await
        }
    }

    fn pending() -> PendingOutcome {
        PendingOutcome {
            slot: 0,
            image_identifier: "class.jpg".into(),
            matched_ids: vec!["S1".into()],
            rendered: vec![0xFF, 0xD8, 0xFF, 0xD9],
            warnings: vec![],
        }
    }

    fn assembler(store: Arc<dyn BlobStore>) -> Assembler {
        Assembler::new(store, Duration::from_secs(2), 3)
    }

    #[tokio::test]
    async fn test_commit_path() {
        let store = MemoryStore::default();
        let recorder = TestRecorder::default();
        let outcome = assembler(Arc::new(store.clone()))
            .assemble(pending(), "lectures/c/l", "0-a.jpg", &recorder)
            .await
            .unwrap();

        assert_eq!(outcome.storage_key, "lectures/c/l/0-a.jpg");
        assert_eq!(outcome.matched_ids, vec!["S1".to_string()]);
        assert_eq!(store.get(&outcome.storage_key).await.unwrap(), outcome.rendered_image_bytes);
        let recorded = recorder.recorded.lock().unwrap().clone();
        assert_eq!(recorded, vec![(0, outcome.storage_key.clone())]);
    }

    #[tokio::test]
    async fn test_record_failure_rolls_back_upload() {
        let store = MemoryStore::default();
        let recorder = TestRecorder {
            refuse: true,
            ..Default::default()
        };
        let err = assembler(Arc::new(store.clone()))
            .assemble(pending(), "p", "0-a.jpg", &recorder)
            .await
            .unwrap_err();

        assert!(matches!(err, AssembleError::Record(_)));
        assert_eq!(err.saga_state(), Some(SagaState::RolledBack));
        assert!(store.is_empty(), "rolled-back blob must be gone");
    }

    #[tokio::test]
    async fn test_compensating_delete_retries() {
        let inner = MemoryStore::default();
        let flaky = Arc::new(FlakyStore::new(inner.clone()));
        flaky.failing_deletes.store(2, Ordering::SeqCst);
        let recorder = TestRecorder {
            refuse: true,
            ..Default::default()
        };

        let err = assembler(flaky.clone())
            .assemble(pending(), "p", "0-a.jpg", &recorder)
            .await
            .unwrap_err();

        assert_eq!(err.saga_state(), Some(SagaState::RolledBack));
        assert_eq!(flaky.delete_calls.load(Ordering::SeqCst), 3);
        assert!(inner.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_delete_reports_orphan() {
        let inner = MemoryStore::default();
        let flaky = Arc::new(FlakyStore::new(inner.clone()));
        flaky.failing_deletes.store(10, Ordering::SeqCst);
        let recorder = TestRecorder {
            refuse: true,
            ..Default::default()
        };

        let err = assembler(flaky.clone())
            .assemble(pending(), "p", "0-a.jpg", &recorder)
            .await
            .unwrap_err();

        assert_eq!(err.saga_state(), Some(SagaState::Orphaned));
        match err {
            AssembleError::Delete { key, .. } => assert_eq!(key, "p/0-a.jpg"),
            other => panic!("expected delete error, got {other}"),
        }
        assert_eq!(flaky.delete_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_upload_failure_stores_nothing() {
        let inner = MemoryStore::default();
        let mut flaky = FlakyStore::new(inner.clone());
        flaky.fail_put = true;
        let recorder = TestRecorder::default();

        let err = assembler(Arc::new(flaky))
            .assemble(pending(), "p", "0-a.jpg", &recorder)
            .await
            .unwrap_err();

        assert!(matches!(err, AssembleError::Upload(StoreFailure::Store(_))));
        assert_eq!(err.saga_state(), None);
        assert!(recorder.recorded.lock().unwrap().is_empty());
        assert!(inner.is_empty());
    }

    #[tokio::test]
    async fn test_upload_timeout_is_upload_error() {
        let inner = MemoryStore::default();
        let mut flaky = FlakyStore::new(inner.clone());
        flaky.slow_put = true;
        let recorder = TestRecorder::default();

        let err = Assembler::new(Arc::new(flaky), Duration::from_millis(20), 1)
            .assemble(pending(), "p", "0-a.jpg", &recorder)
            .await
            .unwrap_err();

        assert!(matches!(err, AssembleError::Upload(StoreFailure::TimedOut(_))));
        assert!(recorder.recorded.lock().unwrap().is_empty());
        assert!(inner.is_empty());
    }

    /// Store whose writes land some time after the caller stops waiting.
    struct LateStore {
        inner: MemoryStore,
        delay: Duration,
        landed: Arc<AtomicU32>,
    }

    #[async_trait]
    impl BlobStore for LateStore {
        async fn put(
            &self,
            bytes: Vec<u8>,
            path: &str,
            file_name: &str,
        ) -> Result<StoredObject, StoreError> {
            tokio::time::sleep(self.delay).await;
            let stored = self.inner.put(bytes, path, file_name).await?;
            self.landed.fetch_add(1, Ordering::SeqCst);
            Ok(stored)
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
            self.inner.get(key).await
        }

        async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.keys(prefix).await
        }
    }

    #[tokio::test]
    async fn test_write_landing_after_timeout_is_removed() {
        let inner = MemoryStore::default();
        let landed = Arc::new(AtomicU32::new(0));
        let store = LateStore {
            inner: inner.clone(),
            delay: Duration::from_millis(100),
            landed: Arc::clone(&landed),
        };
        let recorder = TestRecorder::default();

        let err = Assembler::new(Arc::new(store), Duration::from_millis(20), 3)
            .assemble(pending(), "p", "0-a.jpg", &recorder)
            .await
            .unwrap_err();
        assert!(matches!(err, AssembleError::Upload(StoreFailure::TimedOut(_))));
        assert!(recorder.recorded.lock().unwrap().is_empty());

        for _ in 0..100 {
            if landed.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(landed.load(Ordering::SeqCst), 1, "write never landed");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(inner.is_empty(), "late blob left behind: {:?}", inner.keys("").await.unwrap());
    }

    #[test]
    fn test_store_failure_messages() {
        assert_eq!(
            StoreFailure::TimedOut(Duration::from_millis(1500)).to_string(),
            "timed out after 1500ms"
        );
        assert_eq!(
            StoreFailure::Store(StoreError::Unavailable("down".into())).to_string(),
            "store unavailable: down"
        );
    }

    #[tokio::test]
    async fn test_saga_transitions() {
        let stored = MemoryStore::default().put(vec![1], "p", "k.jpg").await.unwrap();
        let mut saga = UploadSaga::begin(stored);
        assert_eq!(saga.state(), SagaState::Uploaded);
        saga.transition(SagaState::Committed);
        assert_eq!(saga.state(), SagaState::Committed);
        assert_eq!(saga.stored().key, "p/k.jpg");
    }
}
