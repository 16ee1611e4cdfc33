use async_trait::async_trait;

use crate::errors::DetectBotResult;

/// Status and raw text body returned by the detection backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendResponse {
    pub status: u16,
    pub body: String,
}

impl BackendResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Black-box model runner reached by staged image key.
///
/// Non-success statuses are returned as `Ok`; `Err` means the backend could
/// not be reached at all.
#[async_trait]
pub trait DetectionBackend: Send + Sync {
    async fn predict(&self, image_key: &str) -> DetectBotResult<BackendResponse>;
}

pub struct HttpDetectionBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDetectionBackend {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DetectionBackend for HttpDetectionBackend {
    async fn predict(&self, image_key: &str) -> DetectBotResult<BackendResponse> {
        let url = format!("{}/predict", self.base_url);
        tracing::debug!(url = %url, image_key, "sending predict request");

        let response = self
            .client
            .post(&url)
            .query(&[("imgName", image_key)])
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        tracing::debug!(status, body_len = body.len(), "predict response received");
        Ok(BackendResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use std::collections::HashMap;

    async fn echo(Query(params): Query<HashMap<String, String>>) -> (StatusCode, String) {
        match params.get("imgName") {
            Some(name) if name == "missing.jpg" => (StatusCode::NOT_FOUND, "not found".into()),
            Some(name) => (StatusCode::OK, format!("{{'labels': [], 'img': '{name}'}}")),
            None => (StatusCode::BAD_REQUEST, "imgName required".into()),
        }
    }

    async fn spawn_backend() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/predict", post(echo));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn passes_image_key_as_query_parameter() {
        let backend = HttpDetectionBackend::new(spawn_backend().await);
        let response = backend.predict("photos/a b.jpg").await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.body, "{'labels': [], 'img': 'photos/a b.jpg'}");
    }

    #[tokio::test]
    async fn non_success_status_is_not_an_error() {
        let backend = HttpDetectionBackend::new(spawn_backend().await);
        let response = backend.predict("missing.jpg").await.unwrap();
        assert_eq!(response.status, 404);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn unreachable_backend_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let backend = HttpDetectionBackend::new(format!("http://{addr}"));
        assert!(backend.predict("a.jpg").await.is_err());
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 500\r\n\r\n{'labels': [{'class': 'dog'")
                .await
                .unwrap();
        });

        let backend = HttpDetectionBackend::new(format!("http://{addr}"));
        assert!(backend.predict("a.jpg").await.is_err());
    }
}
