/// Minimal Telegram Bot API client: long polling, text replies, file download.
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde::Deserialize;

use crate::bot::transport::{
    AttachmentRef, ChatTransport, FetchedAttachment, IncomingMessage, MessageSource,
};
use crate::errors::{DetectBotError, DetectBotResult};

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
    chat: Chat,
    text: Option<String>,
    #[serde(default)]
    photo: Vec<PhotoSize>,
    document: Option<Document>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct PhotoSize {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct Document {
    file_id: String,
    file_name: Option<String>,
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct File {
    file_path: Option<String>,
}

impl Message {
    fn into_incoming(self) -> IncomingMessage {
        // Telegram lists photo sizes smallest first.
        let attachment = match (self.photo.into_iter().last(), self.document) {
            (Some(photo), _) => Some(AttachmentRef {
                file_id: photo.file_id,
                file_name: None,
            }),
            (None, Some(doc)) if doc.mime_type.as_deref().is_some_and(|m| m.starts_with("image/")) => {
                Some(AttachmentRef {
                    file_id: doc.file_id,
                    file_name: doc.file_name,
                })
            }
            _ => None,
        };
        IncomingMessage {
            chat_id: self.chat.id,
            message_id: self.message_id,
            text: self.text,
            attachment,
        }
    }
}

pub struct TelegramTransport {
    api_base: String,
    token: String,
    poll_timeout_secs: u64,
    next_offset: AtomicI64,
    client: reqwest::Client,
}

impl TelegramTransport {
    pub fn new(api_base: String, token: String, poll_timeout_secs: u64) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
            poll_timeout_secs,
            next_offset: AtomicI64::new(0),
            client: reqwest::Client::new(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.api_base, self.token, file_path)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        method: &str,
    ) -> DetectBotResult<T> {
        let response: ApiResponse<T> = request.send().await?.json().await?;
        match (response.ok, response.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(DetectBotError::Transport(format!(
                "{method}: {}",
                response.description.unwrap_or_else(|| "request rejected".into())
            ))),
        }
    }

    /// Fetches bot identity; used at startup to fail fast on a bad token.
    pub async fn get_me(&self) -> DetectBotResult<serde_json::Value> {
        self.call(self.client.get(self.method_url("getMe")), "getMe").await
    }
}

#[async_trait]
impl MessageSource for TelegramTransport {
    async fn receive_messages(&self) -> DetectBotResult<Vec<IncomingMessage>> {
        let offset = self.next_offset.load(Ordering::SeqCst);
        let request = self
            .client
            .get(self.method_url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", self.poll_timeout_secs.to_string()),
                ("allowed_updates", "[\"message\"]".to_string()),
            ])
            .timeout(std::time::Duration::from_secs(self.poll_timeout_secs + 10));
        let updates: Vec<Update> = self.call(request, "getUpdates").await?;

        if let Some(last) = updates.iter().map(|u| u.update_id).max() {
            self.next_offset.store(last + 1, Ordering::SeqCst);
        }
        Ok(updates
            .into_iter()
            .filter_map(|u| u.message)
            .map(Message::into_incoming)
            .collect())
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_text(&self, chat_id: i64, text: &str) -> DetectBotResult<()> {
        let request = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }));
        let _: serde_json::Value = self.call(request, "sendMessage").await?;
        Ok(())
    }

    async fn fetch_attachment(&self, attachment: &AttachmentRef) -> DetectBotResult<FetchedAttachment> {
        let request = self
            .client
            .get(self.method_url("getFile"))
            .query(&[("file_id", attachment.file_id.as_str())]);
        let file: File = self.call(request, "getFile").await?;
        let file_path = file
            .file_path
            .ok_or_else(|| DetectBotError::Transport("getFile: no file_path in response".into()))?;

        let bytes = self
            .client
            .get(self.file_url(&file_path))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?
            .to_vec();
        tracing::debug!(file_path = %file_path, len = bytes.len(), "attachment downloaded");
        Ok(FetchedAttachment {
            bytes,
            file_path: Some(file_path),
        })
    }
}
