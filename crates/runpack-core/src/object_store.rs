use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::money::Money;

#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("artifact not found for run {0}")]
    NotFound(String),
    #[error("object store error: {0}")]
    Backend(String),
}

/// Metadata recorded alongside an uploaded artifact. `actual_cost_micros`
/// MUST be set by the worker before/at upload (spec.md §6) — the
/// Reconciler's Case B cost-recovery path depends on it being present.
#[derive(Debug, Clone)]
pub struct ArtifactMetadata {
    pub result_key: String,
    pub result_hash: String,
    pub actual_cost: Money,
    pub size_bytes: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(
        &self,
        run_id: &str,
        payload: &[u8],
        actual_cost: Money,
        content_hash: &str,
    ) -> Result<ArtifactMetadata, ObjectStoreError>;

    async fn get_metadata(
        &self,
        run_id: &str,
    ) -> Result<Option<ArtifactMetadata>, ObjectStoreError>;
}

#[must_use]
pub fn memory() -> MemoryObjectStore {
    MemoryObjectStore::default()
}

#[derive(Default)]
pub struct MemoryObjectStore {
    artifacts: Mutex<HashMap<String, ArtifactMetadata>>,
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(
        &self,
        run_id: &str,
        payload: &[u8],
        actual_cost: Money,
        content_hash: &str,
    ) -> Result<ArtifactMetadata, ObjectStoreError> {
        let metadata = ArtifactMetadata {
            result_key: format!("runs/{run_id}/result"),
            result_hash: content_hash.to_string(),
            actual_cost,
            size_bytes: payload.len() as u64,
        };
        self.artifacts
            .lock()
            .await
            .insert(run_id.to_string(), metadata.clone());
        Ok(metadata)
    }

    async fn get_metadata(
        &self,
        run_id: &str,
    ) -> Result<Option<ArtifactMetadata>, ObjectStoreError> {
        Ok(self.artifacts.lock().await.get(run_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_records_retrievable_metadata() {
        let store = memory();
        let metadata = store
            .upload("run-1", b"payload", Money::parse_fixed4("1.0000").unwrap(), "deadbeef")
            .await
            .unwrap();
        assert_eq!(metadata.result_key, "runs/run-1/result");

        let fetched = store.get_metadata("run-1").await.unwrap().expect("present");
        assert_eq!(fetched.actual_cost, Money::parse_fixed4("1.0000").unwrap());
    }

    #[tokio::test]
    async fn missing_metadata_returns_none() {
        let store = memory();
        assert!(store.get_metadata("nonexistent").await.unwrap().is_none());
    }
}
