//! Object storage interface for result artifacts.
//!
//! Artifacts are keyed deterministically by run id so any actor (worker,
//! reconciler) can locate a run's artifact without coordination. Uploads
//! always carry [`ArtifactMetadata`]; `actual_cost` in that metadata is
//! what lets the reconciler recover a settled amount when the run log was
//! never committed.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use packflow_core::{Money, RunId};

/// Deterministic artifact key for a run's result envelope.
pub fn artifact_key(run_id: RunId) -> String {
    format!("runs/{run_id}/envelope.json")
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObjectStoreError {
    #[error("object storage error: {0}")]
    Storage(String),
}

/// Metadata stored alongside every artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMetadata {
    /// Cost the executor reported for producing this artifact. Written at
    /// upload time, before finalize; the reconciler reads it back when the
    /// run log is missing the settled amount.
    pub actual_cost: Money,
    /// SHA-256 of the artifact bytes, hex-encoded.
    pub sha256: String,
    pub size_bytes: u64,
}

/// Narrow object-storage surface used by the core.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload an artifact, overwriting any previous object at `key`.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: ArtifactMetadata,
    ) -> Result<(), ObjectStoreError>;

    /// Read an artifact's metadata without fetching the body.
    async fn head(&self, key: &str) -> Result<Option<ArtifactMetadata>, ObjectStoreError>;

    /// Produce a time-limited download URL for an existing artifact.
    async fn presign_get(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<Option<String>, ObjectStoreError>;
}

#[async_trait]
impl<O> ObjectStore for std::sync::Arc<O>
where
    O: ObjectStore + ?Sized,
{
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: ArtifactMetadata,
    ) -> Result<(), ObjectStoreError> {
        (**self).put(key, bytes, metadata).await
    }

    async fn head(&self, key: &str) -> Result<Option<ArtifactMetadata>, ObjectStoreError> {
        (**self).head(key).await
    }

    async fn presign_get(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<Option<String>, ObjectStoreError> {
        (**self).presign_get(key, expires_in).await
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    metadata: ArtifactMetadata,
}

/// In-memory object store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the stored bytes (test observability; production reads go
    /// through presigned URLs).
    pub fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .read()
            .ok()?
            .get(key)
            .map(|o| o.bytes.clone())
    }

    /// Remove an object (used by tests to simulate lifecycle expiry).
    pub fn remove(&self, key: &str) {
        if let Ok(mut objects) = self.objects.write() {
            objects.remove(key);
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: ArtifactMetadata,
    ) -> Result<(), ObjectStoreError> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| ObjectStoreError::Storage("lock poisoned".to_string()))?;
        objects.insert(key.to_string(), StoredObject { bytes, metadata });
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<ArtifactMetadata>, ObjectStoreError> {
        let objects = self
            .objects
            .read()
            .map_err(|_| ObjectStoreError::Storage("lock poisoned".to_string()))?;
        Ok(objects.get(key).map(|o| o.metadata.clone()))
    }

    async fn presign_get(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<Option<String>, ObjectStoreError> {
        let objects = self
            .objects
            .read()
            .map_err(|_| ObjectStoreError::Storage("lock poisoned".to_string()))?;
        Ok(objects
            .get(key)
            .map(|_| format!("memory://{key}?expires_in={}", expires_in.as_secs())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_head_returns_metadata() {
        let store = InMemoryObjectStore::new();
        let key = artifact_key(RunId::new());

        store
            .put(
                &key,
                b"{\"data\":{}}".to_vec(),
                ArtifactMetadata {
                    actual_cost: Money::from_micros(750_000),
                    sha256: "abc".to_string(),
                    size_bytes: 11,
                },
            )
            .await
            .unwrap();

        let meta = store.head(&key).await.unwrap().unwrap();
        assert_eq!(meta.actual_cost, Money::from_micros(750_000));
        assert_eq!(meta.size_bytes, 11);
    }

    #[tokio::test]
    async fn head_of_missing_key_is_none() {
        let store = InMemoryObjectStore::new();
        assert!(store.head("runs/none/envelope.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn presign_only_works_for_existing_objects() {
        let store = InMemoryObjectStore::new();
        let key = artifact_key(RunId::new());

        assert!(store
            .presign_get(&key, Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());

        store
            .put(
                &key,
                vec![1, 2, 3],
                ArtifactMetadata {
                    actual_cost: Money::ZERO,
                    sha256: "d".to_string(),
                    size_bytes: 3,
                },
            )
            .await
            .unwrap();

        let url = store
            .presign_get(&key, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(url.contains(&key));
    }
}
