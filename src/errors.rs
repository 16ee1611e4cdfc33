use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectBotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chat transport error: {0}")]
    Transport(String),

    #[error("Detection backend error: {0}")]
    Backend(String),

    #[error("Model runner error: {0}")]
    Model(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

pub type DetectBotResult<T> = Result<T, DetectBotError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Stage,
    Fetch,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreOperation::Stage => f.write_str("stage"),
            StoreOperation::Fetch => f.write_str("fetch"),
        }
    }
}

/// Object-store failure, tagged with the operation and key that caused it.
#[derive(Debug, Error)]
#[error("object store {operation} of '{key}' failed: {cause}")]
pub struct StoreError {
    pub operation: StoreOperation,
    pub key: String,
    pub cause: String,
}

impl StoreError {
    pub fn new(operation: StoreOperation, key: impl Into<String>, cause: impl ToString) -> Self {
        Self {
            operation,
            key: key.into(),
            cause: cause.to_string(),
        }
    }
}

/// The backend body did not contain a usable `labels` list.
///
/// Never fatal: the invoker treats it as zero detections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedOutput {
    #[error("no 'labels' marker in backend output")]
    MissingMarker,

    #[error("no '[' after the 'labels' marker")]
    MissingArray,

    #[error("labels array opened at byte {0} is never closed")]
    UnterminatedArray(usize),

    #[error("labels array is not a valid literal at byte {offset}: {reason}")]
    InvalidLiteral { offset: usize, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStage {
    Upload,
    Backend,
    Parse,
}

impl fmt::Display for InvocationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationStage::Upload => f.write_str("upload"),
            InvocationStage::Backend => f.write_str("backend"),
            InvocationStage::Parse => f.write_str("parse"),
        }
    }
}

/// Fatal to a single detection request only.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("upload failed: {0}")]
    Upload(#[source] StoreError),

    #[error("backend responded with status {status}")]
    BackendStatus { status: u16, body: String },

    #[error("backend unavailable: {cause}")]
    BackendUnavailable { cause: String },
}

impl InvocationError {
    pub fn stage(&self) -> InvocationStage {
        match self {
            InvocationError::Upload(_) => InvocationStage::Upload,
            InvocationError::BackendStatus { .. } | InvocationError::BackendUnavailable { .. } => {
                InvocationStage::Backend
            }
        }
    }
}

#[derive(Debug, Error)]
#[error("result store insert of prediction {id} failed: {cause}")]
pub struct ResultStoreError {
    pub id: String,
    pub cause: String,
}
