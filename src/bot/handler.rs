use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::bot::transport::{AttachmentRef, ChatTransport, IncomingMessage};
use crate::errors::InvocationError;
use crate::pipeline::invoker::DetectionInvoker;

const USAGE: &str = "Please send a photo to start object detection";
const STAGED_PREFIX: &str = "photos";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Command(Command),
    Photo(AttachmentRef),
    PlainText(String),
    Unsupported,
}

/// Photos win over captions; commands are matched on the first word so
/// `/start@my_bot` and `/start now` both count.
pub fn classify(msg: &IncomingMessage) -> MessageKind {
    if let Some(attachment) = &msg.attachment {
        return MessageKind::Photo(attachment.clone());
    }
    let Some(text) = msg.text.as_deref() else {
        return MessageKind::Unsupported;
    };
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix('/') {
        let word = rest.split_whitespace().next().unwrap_or("");
        let name = word.split('@').next().unwrap_or("");
        let command = match name {
            "start" => Command::Start,
            "help" => Command::Help,
            _ => Command::Unknown(format!("/{name}")),
        };
        return MessageKind::Command(command);
    }
    MessageKind::PlainText(text.to_string())
}

pub fn welcome_text() -> String {
    format!("Welcome!!\n{USAGE}")
}

pub fn error_text(err: &InvocationError) -> String {
    match err {
        InvocationError::Upload(_) => "Error: failed to upload photo".to_string(),
        InvocationError::BackendStatus { status, .. } => format!("Error: {status}"),
        InvocationError::BackendUnavailable { .. } => "Error: detection service unavailable".to_string(),
    }
}

/// Picks the extension for a staged photo: sniffed format, then the
/// transport's file name, then `jpg`.
fn image_extension(bytes: &[u8], file_name: Option<&str>) -> String {
    if let Ok(format) = image::guess_format(bytes) {
        if let Some(ext) = format.extensions_str().first() {
            return (*ext).to_string();
        }
    }
    file_name
        .and_then(|name| Path::new(name).extension())
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "jpg".to_string())
}

/// Chat-facing state machine; every handled message gets at most one reply.
pub struct ConversationHandler {
    transport: Arc<dyn ChatTransport>,
    invoker: Arc<DetectionInvoker>,
    fetch_timeout: Duration,
    /// Last staged key, kept for diagnostics only.
    last_seen_path: Mutex<Option<String>>,
}

impl ConversationHandler {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        invoker: Arc<DetectionInvoker>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            invoker,
            fetch_timeout,
            last_seen_path: Mutex::new(None),
        }
    }

    pub async fn last_seen_path(&self) -> Option<String> {
        self.last_seen_path.lock().await.clone()
    }

    pub async fn handle(&self, msg: &IncomingMessage) {
        let kind = classify(msg);
        tracing::info!(chat_id = msg.chat_id, message_id = msg.message_id, kind = ?kind, "incoming message");

        let reply = match kind {
            MessageKind::Command(Command::Start) => welcome_text(),
            MessageKind::Command(Command::Help) => USAGE.to_string(),
            MessageKind::Command(Command::Unknown(name)) => format!("Unknown command: {name}\n{USAGE}"),
            MessageKind::PlainText(text) => format!("Your original message: {text}"),
            MessageKind::Photo(attachment) => self.handle_photo(msg.chat_id, &attachment).await,
            MessageKind::Unsupported => {
                tracing::debug!(chat_id = msg.chat_id, "message without text or photo ignored");
                return;
            }
        };

        if let Err(e) = self.transport.send_text(msg.chat_id, &reply).await {
            tracing::error!(chat_id = msg.chat_id, error = %e, "failed to send reply");
        }
    }

    async fn handle_photo(&self, chat_id: i64, attachment: &AttachmentRef) -> String {
        let fetched = match tokio::time::timeout(self.fetch_timeout, self.transport.fetch_attachment(attachment)).await {
            Ok(Ok(fetched)) => fetched,
            Ok(Err(e)) => {
                tracing::error!(chat_id, file_id = %attachment.file_id, error = %e, "attachment download failed");
                return "Error: could not download photo".to_string();
            }
            Err(_) => {
                tracing::error!(chat_id, file_id = %attachment.file_id, "attachment download timed out");
                return "Error: could not download photo".to_string();
            }
        };

        let name_hint = attachment
            .file_name
            .as_deref()
            .or(fetched.file_path.as_deref());
        let ext = image_extension(&fetched.bytes, name_hint);
        let key = format!("{STAGED_PREFIX}/{}.{ext}", uuid::Uuid::new_v4());
        *self.last_seen_path.lock().await = Some(key.clone());

        match self.invoker.invoke(fetched.bytes, &key).await {
            Ok(result) => {
                tracing::info!(
                    chat_id,
                    prediction_id = %result.record.id,
                    detections = result.record.detections.len(),
                    degraded = result.malformed.is_some(),
                    "detection finished"
                );
                format!("Detected objects:\n{}", result.summary_text)
            }
            Err(e) => {
                tracing::error!(chat_id, key = %key, stage = %e.stage(), error = %e, "detection failed");
                error_text(&e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{StoreError, StoreOperation};

    fn text(t: &str) -> IncomingMessage {
        IncomingMessage {
            chat_id: 1,
            message_id: 1,
            text: Some(t.to_string()),
            attachment: None,
        }
    }

    #[test]
    fn classifies_commands() {
        assert_eq!(classify(&text("/start")), MessageKind::Command(Command::Start));
        assert_eq!(classify(&text("/start@detect_bot")), MessageKind::Command(Command::Start));
        assert_eq!(classify(&text(" /help me")), MessageKind::Command(Command::Help));
        assert_eq!(
            classify(&text("/stop")),
            MessageKind::Command(Command::Unknown("/stop".into()))
        );
    }

    #[test]
    fn classifies_text_photo_and_empty() {
        assert_eq!(classify(&text("hello")), MessageKind::PlainText("hello".into()));

        let attachment = AttachmentRef {
            file_id: "f".into(),
            file_name: None,
        };
        let mut photo = text("/start");
        photo.attachment = Some(attachment.clone());
        assert_eq!(classify(&photo), MessageKind::Photo(attachment));

        let empty = IncomingMessage {
            text: None,
            ..text("")
        };
        assert_eq!(classify(&empty), MessageKind::Unsupported);
    }

    #[test]
    fn error_lines_name_the_failing_stage() {
        let upload = InvocationError::Upload(StoreError::new(StoreOperation::Stage, "k", "denied"));
        assert_eq!(error_text(&upload), "Error: failed to upload photo");

        let status = InvocationError::BackendStatus {
            status: 500,
            body: String::new(),
        };
        assert_eq!(error_text(&status), "Error: 500");

        let down = InvocationError::BackendUnavailable { cause: "refused".into() };
        assert_eq!(error_text(&down), "Error: detection service unavailable");
    }

    #[test]
    fn extension_prefers_sniffed_format() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(image_extension(&png, Some("photo.jpg")), "png");
        assert_eq!(image_extension(b"????", Some("photos/file_7.JPEG")), "jpeg");
        assert_eq!(image_extension(b"????", Some("weird.j/p")), "jpg");
        assert_eq!(image_extension(b"????", None), "jpg");
    }
}
