/// `POST /predict?imgName=<key>`, the detection backend's own endpoint.
///
/// Downloads the staged image, runs the model, uploads the annotated image
/// under `predicted/<prediction_id>/<key>` and answers with a Python-literal
/// summary whose `labels` list the bot's label parser reads.
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use regex::Regex;
use serde::Deserialize;

use crate::backend::model::{parse_label_rows, LabelRow, ModelRunner};
use crate::storage::staging::StagingStore;

#[derive(Clone)]
pub struct PredictState {
    pub staging: Arc<StagingStore>,
    pub runner: Arc<dyn ModelRunner>,
    pub work_dir: PathBuf,
    pub class_names: Arc<Vec<String>>,
    pub model_timeout: Duration,
}

#[derive(Debug, Deserialize)]
pub struct PredictParams {
    #[serde(rename = "imgName")]
    pub img_name: Option<String>,
}

pub fn router(state: PredictState) -> Router {
    Router::new()
        .route("/predict", post(predict))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

const KEY_PATTERN: &str = r"^[A-Za-z0-9._-]+(/[A-Za-z0-9._-]+)*$";

fn valid_key(key: &str) -> bool {
    static KEY_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = KEY_RE.get_or_init(|| match Regex::new(KEY_PATTERN) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::error!(error = %e, "object key pattern does not compile, rejecting all keys");
            None
        }
    });
    re.as_ref().is_some_and(|re| re.is_match(key))
        && !key.split('/').any(|part| part == "." || part == "..")
}

async fn predict(
    State(state): State<PredictState>,
    Query(params): Query<PredictParams>,
) -> (StatusCode, String) {
    let prediction_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(prediction_id = %prediction_id, "prediction: start processing");

    let Some(img_name) = params.img_name.filter(|k| valid_key(k)) else {
        tracing::warn!(prediction_id = %prediction_id, "missing or invalid imgName");
        return (StatusCode::BAD_REQUEST, "imgName must be a relative object key".into());
    };

    let input_dir = state.work_dir.join("inputs").join(&prediction_id);
    let outcome = run_prediction(&state, &prediction_id, &img_name, &input_dir).await;

    for dir in [input_dir, state.work_dir.join(&prediction_id)] {
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            tracing::debug!(error = %e, dir = %dir.display(), "work dir cleanup skipped");
        }
    }
    outcome
}

async fn run_prediction(
    state: &PredictState,
    prediction_id: &str,
    img_name: &str,
    input_dir: &Path,
) -> (StatusCode, String) {
    let source = match download(state, img_name, input_dir).await {
        Ok(path) => path,
        Err(cause) => {
            tracing::error!(prediction_id, error = %cause, "error downloading image from storage");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error downloading image from storage: {cause}"),
            );
        }
    };
    tracing::info!(prediction_id, path = %source.display(), "download img completed");

    let run = tokio::time::timeout(
        state.model_timeout,
        state.runner.run(&source, &state.work_dir, prediction_id),
    )
    .await;
    let output = match run {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            tracing::error!(prediction_id, error = %e, "model run failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("Error running detection: {e}"));
        }
        Err(_) => {
            tracing::error!(prediction_id, "model run timed out");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error running detection: timed out after {}s", state.model_timeout.as_secs()),
            );
        }
    };
    tracing::info!(prediction_id, "prediction done");

    let predicted_img_path = format!("predicted/{prediction_id}/{img_name}");
    let upload_from = output.annotated_image.as_deref().unwrap_or(source.as_path());
    if let Err(cause) = upload(state, upload_from, &predicted_img_path).await {
        tracing::error!(prediction_id, error = %cause, "error uploading predicted image");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error uploading predicted image: {cause}"),
        );
    }

    let Some(label_file) = output.label_file else {
        return (
            StatusCode::NOT_FOUND,
            format!("prediction: {prediction_id}/{img_name}. prediction result not found"),
        );
    };

    let rows = match tokio::fs::read_to_string(&label_file).await {
        Ok(content) => parse_label_rows(&content),
        Err(e) => {
            tracing::error!(prediction_id, error = %e, "error reading prediction labels");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error reading prediction labels: {e}"),
            );
        }
    };
    tracing::info!(prediction_id, labels = rows.len(), "prediction summary ready");

    let time = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
    (
        StatusCode::OK,
        render_summary(prediction_id, img_name, &predicted_img_path, &rows, &state.class_names, time),
    )
}

async fn download(state: &PredictState, key: &str, input_dir: &Path) -> Result<PathBuf, String> {
    let bytes = state.staging.fetch(key).await.map_err(|e| e.to_string())?;

    let file_name = Path::new(key)
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| format!("key '{key}' has no file name"))?;
    tokio::fs::create_dir_all(input_dir)
        .await
        .map_err(|e| e.to_string())?;
    let path = input_dir.join(file_name);
    tokio::fs::write(&path, bytes).await.map_err(|e| e.to_string())?;
    Ok(path)
}

async fn upload(state: &PredictState, from: &Path, key: &str) -> Result<(), String> {
    let bytes = tokio::fs::read(from).await.map_err(|e| e.to_string())?;
    state.staging.stage(bytes, key).await.map_err(|e| e.to_string())
}

fn py_str(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('\'', "\\'").replace('\n', "\\n");
    format!("'{escaped}'")
}

fn class_name(class_names: &[String], index: usize) -> String {
    class_names
        .get(index)
        .cloned()
        .unwrap_or_else(|| format!("class_{index}"))
}

pub fn render_summary(
    prediction_id: &str,
    img_name: &str,
    predicted_img_path: &str,
    rows: &[LabelRow],
    class_names: &[String],
    time: f64,
) -> String {
    let labels = rows
        .iter()
        .map(|r| {
            format!(
                "{{'class': {}, 'cx': {:?}, 'cy': {:?}, 'width': {:?}, 'height': {:?}}}",
                py_str(&class_name(class_names, r.class_index)),
                r.cx,
                r.cy,
                r.width,
                r.height
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{{'prediction_id': {}, 'original_img_path': {}, 'predicted_img_path': {}, 'labels': [{}], 'time': {:?}}}",
        py_str(prediction_id),
        py_str(img_name),
        py_str(predicted_img_path),
        labels,
        time
    )
}
