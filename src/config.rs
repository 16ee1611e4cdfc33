use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{DetectBotError, DetectBotResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub results: ResultsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Falls back to env var DETECTBOT_TELEGRAM_TOKEN.
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_base: default_telegram_api(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".into()
}

fn default_poll_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreBackend {
    /// Buckets are directories under `root`.
    Fs { root: PathBuf },
    /// Path-style HTTP bucket endpoint (MinIO, S3 gateway, ...).
    Http {
        endpoint: String,
        #[serde(default)]
        token: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Overridden by env var BUCKET_NAME.
    pub bucket: String,
    pub store: StoreBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    pub url: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
        }
    }
}

fn default_backend_url() -> String {
    "http://yolo:8081".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResultsConfig {
    /// JSON Lines file; defaults to the user data dir.
    pub path: Option<PathBuf>,
}

impl ResultsConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("detectbot")
                .join("predictions.jsonl")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_fetch_secs")]
    pub fetch_secs: u64,
    #[serde(default = "default_stage_secs")]
    pub stage_secs: u64,
    #[serde(default = "default_backend_secs")]
    pub backend_secs: u64,
    #[serde(default = "default_persist_secs")]
    pub persist_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            fetch_secs: default_fetch_secs(),
            stage_secs: default_stage_secs(),
            backend_secs: default_backend_secs(),
            persist_secs: default_persist_secs(),
        }
    }
}

impl TimeoutsConfig {
    pub fn fetch(&self) -> Duration {
        Duration::from_secs(self.fetch_secs)
    }

    pub fn stage(&self) -> Duration {
        Duration::from_secs(self.stage_secs)
    }

    pub fn backend(&self) -> Duration {
        Duration::from_secs(self.backend_secs)
    }

    pub fn persist(&self) -> Duration {
        Duration::from_secs(self.persist_secs)
    }
}

fn default_fetch_secs() -> u64 {
    15
}

fn default_stage_secs() -> u64 {
    15
}

fn default_backend_secs() -> u64 {
    120
}

fn default_persist_secs() -> u64 {
    5
}

/// Settings for the predict server binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Detector command; `{source}`, `{project}` and `{name}` are substituted.
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Class index → name, in model order.
    #[serde(default)]
    pub class_names: Vec<String>,
    #[serde(default = "default_model_secs")]
    pub model_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            work_dir: default_work_dir(),
            command: default_command(),
            args: default_args(),
            class_names: Vec::new(),
            model_timeout_secs: default_model_secs(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8081".into()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("static/data")
}

fn default_command() -> String {
    "python".into()
}

fn default_args() -> Vec<String> {
    [
        "detect.py",
        "--weights",
        "yolov5s.pt",
        "--source",
        "{source}",
        "--project",
        "{project}",
        "--name",
        "{name}",
        "--save-txt",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_model_secs() -> u64 {
    300
}

impl AppConfig {
    /// Applies environment overrides on top of the file values.
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("DETECTBOT_TELEGRAM_TOKEN") {
            if !token.is_empty() {
                self.telegram.token = token;
            }
        }
        if let Ok(bucket) = std::env::var("BUCKET_NAME") {
            if !bucket.is_empty() {
                self.storage.bucket = bucket;
            }
        }
    }

    pub fn validate_common(&self) -> DetectBotResult<()> {
        if self.storage.bucket.trim().is_empty() {
            return Err(DetectBotError::Config("storage.bucket must not be empty".into()));
        }
        let t = &self.timeouts;
        if [t.fetch_secs, t.stage_secs, t.backend_secs, t.persist_secs].contains(&0) {
            return Err(DetectBotError::Config("timeouts must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn validate_bot(&self) -> DetectBotResult<()> {
        self.validate_common()?;
        if self.telegram.token.trim().is_empty() {
            return Err(DetectBotError::Config(
                "telegram.token is empty and DETECTBOT_TELEGRAM_TOKEN is not set".into(),
            ));
        }
        Ok(())
    }

    pub fn validate_server(&self) -> DetectBotResult<()> {
        self.validate_common()?;
        if self.server.model_timeout_secs == 0 {
            return Err(DetectBotError::Config("server.model_timeout_secs must be greater than zero".into()));
        }
        Ok(())
    }
}

fn resolve_config_path() -> DetectBotResult<PathBuf> {
    if let Ok(explicit) = std::env::var("DETECTBOT_CONFIG") {
        let candidate = PathBuf::from(explicit);
        if candidate.exists() {
            return Ok(candidate);
        }
        return Err(DetectBotError::Config(format!(
            "DETECTBOT_CONFIG points to missing file {}",
            candidate.display()
        )));
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    Err(DetectBotError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

pub fn parse_config(content: &str) -> DetectBotResult<AppConfig> {
    let mut config: AppConfig = toml::from_str(content)?;
    config.apply_env();
    Ok(config)
}

pub fn load_config() -> DetectBotResult<AppConfig> {
    let path = resolve_config_path()?;
    let content = std::fs::read_to_string(&path)?;
    let config = parse_config(&content)?;
    tracing::info!(path = %path.display(), bucket = %config.storage.bucket, "config loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [telegram]
        token = "123:abc"

        [storage]
        bucket = "images"
        store = { kind = "fs", root = "/var/lib/detectbot" }
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: AppConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.backend.url, "http://yolo:8081");
        assert_eq!(config.timeouts.backend(), Duration::from_secs(120));
        assert_eq!(config.telegram.poll_timeout_secs, 30);
        assert!(matches!(config.storage.store, StoreBackend::Fs { .. }));
        assert!(config.server.args.contains(&"{source}".to_string()));
        config.validate_bot().unwrap();
    }

    #[test]
    fn http_store_and_explicit_sections_parse() {
        let config: AppConfig = toml::from_str(
            r#"
            [storage]
            bucket = "images"
            store = { kind = "http", endpoint = "http://minio:9000", token = "s3cr3t" }

            [timeouts]
            backend_secs = 30

            [results]
            path = "/tmp/preds.jsonl"

            [server]
            class_names = ["person", "bicycle"]
            "#,
        )
        .unwrap();
        assert!(matches!(config.storage.store, StoreBackend::Http { ref token, .. } if token.as_deref() == Some("s3cr3t")));
        assert_eq!(config.timeouts.backend_secs, 30);
        assert_eq!(config.timeouts.persist_secs, 5);
        assert_eq!(config.results.resolved_path(), PathBuf::from("/tmp/preds.jsonl"));
        assert_eq!(config.server.class_names.len(), 2);
    }

    #[test]
    fn validation_rejects_missing_token_and_zero_timeouts() {
        let mut config: AppConfig = toml::from_str(MINIMAL).unwrap();
        config.telegram.token.clear();
        assert!(matches!(config.validate_bot(), Err(DetectBotError::Config(_))));
        config.validate_server().unwrap();

        config.timeouts.stage_secs = 0;
        assert!(config.validate_common().is_err());
    }

    #[test]
    fn default_results_path_is_under_data_dir() {
        let path = ResultsConfig::default().resolved_path();
        assert!(path.ends_with("detectbot/predictions.jsonl"));
    }
}
