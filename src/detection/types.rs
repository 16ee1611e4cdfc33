use serde::{Deserialize, Serialize};

use crate::errors::MalformedOutput;

/// One recognized object instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_name: String,
    /// Normalized box centre, 0.0–1.0
    pub center_x: f64,
    pub center_y: f64,
    /// Normalized box size, (0.0, 1.0]
    pub width: f64,
    pub height: f64,
}

/// Per-class counts in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionSummary {
    counts: Vec<(String, usize)>,
}

impl DetectionSummary {
    pub fn record(&mut self, class_name: &str) {
        match self.counts.iter_mut().find(|(name, _)| name == class_name) {
            Some((_, count)) => *count += 1,
            None => self.counts.push((class_name.to_string(), 1)),
        }
    }

    pub fn get(&self, class_name: &str) -> Option<usize> {
        self.counts
            .iter()
            .find(|(name, _)| name == class_name)
            .map(|(_, count)| *count)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.counts.iter().map(|(name, count)| (name.as_str(), *count))
    }

    pub fn total(&self) -> usize {
        self.counts.iter().map(|(_, count)| count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Durable history entry for one detection invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: uuid::Uuid,
    pub source_image_key: String,
    pub result_image_key: String,
    pub detections: Vec<Detection>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct PredictionResult {
    pub record: PredictionRecord,
    pub summary_text: String,
    /// Set when the backend body could not be parsed and the result was
    /// degraded to zero detections.
    pub malformed: Option<MalformedOutput>,
}
