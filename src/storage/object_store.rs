use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::errors::{DetectBotError, DetectBotResult};

/// Durable bytes storage addressed by bucket and key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes `bytes` under `key`, replacing any existing object.
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> DetectBotResult<()>;

    async fn get(&self, bucket: &str, key: &str) -> DetectBotResult<Vec<u8>>;
}

/// Buckets are directories under `root`; keys are relative paths inside them.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> DetectBotResult<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe || bucket.is_empty() || bucket.contains(['/', '\\']) {
            return Err(DetectBotError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid object path '{bucket}/{key}'"),
            )));
        }
        Ok(self.root.join(bucket).join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> DetectBotResult<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(path = %path.display(), "object written");
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> DetectBotResult<Vec<u8>> {
        let path = self.object_path(bucket, key)?;
        Ok(tokio::fs::read(&path).await?)
    }
}

/// Path-style HTTP bucket: `PUT/GET {endpoint}/{bucket}/{key}`.
pub struct HttpObjectStore {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(endpoint: String, token: Option<String>) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, bucket, key.trim_start_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> DetectBotResult<()> {
        let url = self.url(bucket, key);
        tracing::debug!(url = %url, len = bytes.len(), "uploading object");
        self.authorize(self.client.put(&url))
            .body(bytes)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> DetectBotResult<Vec<u8>> {
        let url = self.url(bucket, key);
        tracing::debug!(url = %url, "downloading object");
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}
