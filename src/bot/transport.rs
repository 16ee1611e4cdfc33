use async_trait::async_trait;

use crate::errors::DetectBotResult;

/// Reference to an inbound image that still has to be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub file_id: String,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub text: Option<String>,
    pub attachment: Option<AttachmentRef>,
}

#[derive(Debug, Clone)]
pub struct FetchedAttachment {
    pub bytes: Vec<u8>,
    /// Server-side path of the file, when the transport reports one.
    pub file_path: Option<String>,
}

/// What the conversation handler needs from the chat platform.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> DetectBotResult<()>;

    async fn fetch_attachment(&self, attachment: &AttachmentRef) -> DetectBotResult<FetchedAttachment>;
}

/// Source of inbound messages for the runner.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Waits for the next batch; an empty batch is a normal poll timeout.
    async fn receive_messages(&self) -> DetectBotResult<Vec<IncomingMessage>>;
}
