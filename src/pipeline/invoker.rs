/// Drives one detection request end to end.
///
/// Only staging and the backend call can fail the request. A body the label
/// parser cannot read degrades to zero detections, and persistence of the
/// resulting record is best-effort.
use std::sync::Arc;
use std::time::Duration;

use crate::backend::client::DetectionBackend;
use crate::detection::aggregator;
use crate::detection::label_parser;
use crate::detection::types::{PredictionRecord, PredictionResult};
use crate::errors::{InvocationError, InvocationStage};
use crate::storage::result_store::ResultStore;
use crate::storage::staging::StagingStore;

const PREDICTED_IMG_FIELD: &str = "predicted_img_path";

#[derive(Debug, Clone, Copy)]
pub struct InvokerTimeouts {
    pub backend: Duration,
    pub persist: Duration,
}

pub struct DetectionInvoker {
    staging: Arc<StagingStore>,
    backend: Arc<dyn DetectionBackend>,
    results: Arc<dyn ResultStore>,
    timeouts: InvokerTimeouts,
}

impl DetectionInvoker {
    pub fn new(
        staging: Arc<StagingStore>,
        backend: Arc<dyn DetectionBackend>,
        results: Arc<dyn ResultStore>,
        timeouts: InvokerTimeouts,
    ) -> Self {
        Self {
            staging,
            backend,
            results,
            timeouts,
        }
    }

    pub async fn invoke(
        &self,
        image_bytes: Vec<u8>,
        image_key: &str,
    ) -> Result<PredictionResult, InvocationError> {
        self.staging
            .stage(image_bytes, image_key)
            .await
            .map_err(InvocationError::Upload)?;

        let response = match tokio::time::timeout(self.timeouts.backend, self.backend.predict(image_key)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(InvocationError::BackendUnavailable { cause: e.to_string() });
            }
            Err(_) => {
                return Err(InvocationError::BackendUnavailable {
                    cause: format!("timed out after {}s", self.timeouts.backend.as_secs()),
                });
            }
        };
        if !response.is_success() {
            tracing::warn!(image_key, status = response.status, "backend returned non-success status");
            return Err(InvocationError::BackendStatus {
                status: response.status,
                body: response.body,
            });
        }

        let (detections, malformed) = match label_parser::parse(&response.body) {
            Ok(parsed) => (parsed.detections, None),
            Err(e) => {
                tracing::warn!(
                    image_key,
                    stage = %InvocationStage::Parse,
                    error = %e,
                    "backend output malformed, replying with zero detections"
                );
                (Vec::new(), Some(e))
            }
        };

        let summary_text = aggregator::format(&aggregator::aggregate(&detections));

        let id = uuid::Uuid::new_v4();
        let result_image_key = label_parser::extract_string_field(&response.body, PREDICTED_IMG_FIELD)
            .unwrap_or_else(|| format!("predicted/{id}/{image_key}"));
        let record = PredictionRecord {
            id,
            source_image_key: image_key.to_string(),
            result_image_key,
            detections,
            created_at: chrono::Utc::now(),
        };

        self.persist(&record).await;

        Ok(PredictionResult {
            record,
            summary_text,
            malformed,
        })
    }

    async fn persist(&self, record: &PredictionRecord) {
        match tokio::time::timeout(self.timeouts.persist, self.results.insert(record)).await {
            Ok(Ok(())) => {
                tracing::info!(prediction_id = %record.id, detections = record.detections.len(), "prediction record stored");
            }
            Ok(Err(e)) => {
                tracing::error!(prediction_id = %record.id, error = %e, "failed to store prediction record");
            }
            Err(_) => {
                tracing::error!(prediction_id = %record.id, "storing prediction record timed out");
            }
        }
    }
}
