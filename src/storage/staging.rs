use std::sync::Arc;
use std::time::Duration;

use crate::errors::{StoreError, StoreOperation};
use crate::storage::object_store::ObjectStore;

/// Stages inbound images in one bucket of the injected object store.
///
/// Every call is a fresh round-trip bounded by `timeout`; nothing is cached.
pub struct StagingStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    timeout: Duration,
}

impl StagingStore {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: String, timeout: Duration) -> Self {
        Self {
            store,
            bucket,
            timeout,
        }
    }

    /// Re-staging an existing key overwrites it.
    pub async fn stage(&self, bytes: Vec<u8>, key: &str) -> Result<(), StoreError> {
        let len = bytes.len();
        match tokio::time::timeout(self.timeout, self.store.put(&self.bucket, key, bytes)).await {
            Ok(Ok(())) => {
                tracing::info!(bucket = %self.bucket, key, len, "image staged");
                Ok(())
            }
            Ok(Err(e)) => Err(StoreError::new(StoreOperation::Stage, key, e)),
            Err(_) => Err(self.timed_out(StoreOperation::Stage, key)),
        }
    }

    pub async fn fetch(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match tokio::time::timeout(self.timeout, self.store.get(&self.bucket, key)).await {
            Ok(Ok(bytes)) => {
                tracing::debug!(bucket = %self.bucket, key, len = bytes.len(), "object fetched");
                Ok(bytes)
            }
            Ok(Err(e)) => Err(StoreError::new(StoreOperation::Fetch, key, e)),
            Err(_) => Err(self.timed_out(StoreOperation::Fetch, key)),
        }
    }

    fn timed_out(&self, operation: StoreOperation, key: &str) -> StoreError {
        StoreError::new(
            operation,
            key,
            format!("timed out after {}ms", self.timeout.as_millis()),
        )
    }
}
