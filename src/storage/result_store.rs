use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::detection::types::PredictionRecord;
use crate::errors::ResultStoreError;

/// Durable structured storage for prediction history.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn insert(&self, record: &PredictionRecord) -> Result<(), ResultStoreError>;
}

/// Appends one JSON object per line.
pub struct JsonlResultStore {
    path: PathBuf,
    /// Serializes appends so lines from concurrent requests never interleave.
    write_lock: Mutex<()>,
}

impl JsonlResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn append(&self, line: String) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await
    }
}

#[async_trait]
impl ResultStore for JsonlResultStore {
    async fn insert(&self, record: &PredictionRecord) -> Result<(), ResultStoreError> {
        let fail = |cause: String| ResultStoreError {
            id: record.id.to_string(),
            cause,
        };
        let line = serde_json::to_string(record).map_err(|e| fail(e.to_string()))?;
        self.append(line).await.map_err(|e| fail(e.to_string()))?;
        tracing::debug!(path = %self.path.display(), prediction_id = %record.id, "prediction record appended");
        Ok(())
    }
}

/// Keeps records in memory; used for dry runs and tests.
#[derive(Default)]
pub struct MemoryResultStore {
    records: Mutex<Vec<PredictionRecord>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<PredictionRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn insert(&self, record: &PredictionRecord) -> Result<(), ResultStoreError> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::Detection;

    fn record(key: &str) -> PredictionRecord {
        PredictionRecord {
            id: uuid::Uuid::new_v4(),
            source_image_key: key.to_string(),
            result_image_key: format!("predicted/{key}"),
            detections: vec![Detection {
                class_name: "dog".into(),
                center_x: 0.5,
                center_y: 0.5,
                width: 0.2,
                height: 0.3,
            }],
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn jsonl_store_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlResultStore::new(dir.path().join("nested/predictions.jsonl"));

        let first = record("a.jpg");
        let second = record("b.jpg");
        store.insert(&first).await.unwrap();
        store.insert(&second).await.unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        let lines: Vec<PredictionRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, vec![first, second]);
    }

    #[tokio::test]
    async fn jsonl_store_reports_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending.
        let store = JsonlResultStore::new(dir.path());
        let rec = record("a.jpg");
        let err = store.insert(&rec).await.unwrap_err();
        assert_eq!(err.id, rec.id.to_string());
    }
}
