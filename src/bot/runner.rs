use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bot::handler::ConversationHandler;
use crate::bot::transport::{IncomingMessage, MessageSource};

const CHAT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
const POLL_BACKOFF: Duration = Duration::from_secs(2);

struct ChatWorker {
    tx: mpsc::UnboundedSender<IncomingMessage>,
    handle: JoinHandle<()>,
}

/// Routes messages to one sequential worker per chat.
///
/// Replies within a chat follow message order; different chats are handled
/// concurrently. Queues are unbounded so a slow chat never holds up the poll
/// loop, and a worker exits once its chat has been quiet for `idle_timeout`.
pub struct Dispatcher {
    handler: Arc<ConversationHandler>,
    idle_timeout: Duration,
    workers: HashMap<i64, ChatWorker>,
}

impl Dispatcher {
    pub fn new(handler: Arc<ConversationHandler>) -> Self {
        Self::with_idle_timeout(handler, CHAT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(handler: Arc<ConversationHandler>, idle_timeout: Duration) -> Self {
        Self {
            handler,
            idle_timeout,
            workers: HashMap::new(),
        }
    }

    /// Queues `msg` for its chat without waiting on the chat's worker.
    pub fn dispatch(&mut self, msg: IncomingMessage) {
        let chat_id = msg.chat_id;
        let mut pending = msg;
        let mut previous = None;
        loop {
            if !self.workers.contains_key(&chat_id) {
                self.reap_finished();
                let worker = spawn_worker(chat_id, self.handler.clone(), self.idle_timeout, previous.take());
                self.workers.insert(chat_id, worker);
            }
            let Some(worker) = self.workers.get(&chat_id) else {
                return;
            };
            match worker.tx.send(pending) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    tracing::debug!(chat_id, "chat worker closed, starting a new one");
                    // The old worker may still be draining; the new one waits for it.
                    previous = self.workers.remove(&chat_id).map(|w| w.handle);
                    pending = returned;
                }
            }
        }
    }

    fn reap_finished(&mut self) {
        self.workers.retain(|_, worker| !worker.handle.is_finished());
    }

    pub fn active_chats(&self) -> usize {
        self.workers.values().filter(|w| !w.handle.is_finished()).count()
    }

    /// Lets every worker finish its queue, then waits for all of them.
    pub async fn shutdown(self) {
        let handles: Vec<_> = self
            .workers
            .into_values()
            .map(|ChatWorker { tx, handle }| {
                drop(tx);
                handle
            })
            .collect();
        for result in futures_util::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "chat worker panicked");
            }
        }
    }
}

fn spawn_worker(
    chat_id: i64,
    handler: Arc<ConversationHandler>,
    idle_timeout: Duration,
    previous: Option<JoinHandle<()>>,
) -> ChatWorker {
    let (tx, mut rx) = mpsc::unbounded_channel::<IncomingMessage>();
    let handle = tokio::spawn(async move {
        if let Some(previous) = previous {
            if let Err(e) = previous.await {
                tracing::error!(chat_id, error = %e, "previous chat worker panicked");
            }
        }
        tracing::debug!(chat_id, "chat worker started");
        loop {
            match tokio::time::timeout(idle_timeout, rx.recv()).await {
                Ok(Some(msg)) => handler.handle(&msg).await,
                Ok(None) => break,
                Err(_) => {
                    // Refuse new sends, then finish whatever slipped in.
                    rx.close();
                    while let Some(msg) = rx.recv().await {
                        handler.handle(&msg).await;
                    }
                    tracing::debug!(chat_id, "chat worker idle, exiting");
                    break;
                }
            }
        }
        tracing::debug!(chat_id, "chat worker exited");
    });
    ChatWorker { tx, handle }
}

/// Polls `source` until `shutdown` resolves.
pub async fn run(
    source: Arc<dyn MessageSource>,
    handler: Arc<ConversationHandler>,
    shutdown: impl Future<Output = ()>,
) {
    let mut dispatcher = Dispatcher::new(handler);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown requested, draining chat workers");
                break;
            }
            batch = source.receive_messages() => match batch {
                Ok(messages) => {
                    for msg in messages {
                        dispatcher.dispatch(msg);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "polling for messages failed, backing off");
                    tokio::time::sleep(POLL_BACKOFF).await;
                }
            }
        }
    }

    dispatcher.shutdown().await;
    tracing::info!("bot runner stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::client::{BackendResponse, DetectionBackend};
    use crate::bot::transport::{AttachmentRef, ChatTransport, FetchedAttachment};
    use crate::errors::{DetectBotError, DetectBotResult};
    use crate::pipeline::invoker::{DetectionInvoker, InvokerTimeouts};
    use crate::storage::object_store::FsObjectStore;
    use crate::storage::result_store::MemoryResultStore;
    use crate::storage::staging::StagingStore;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    /// Slower sends for earlier messages, so unordered handling would show.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn send_text(&self, chat_id: i64, text: &str) -> DetectBotResult<()> {
            let delay = text.strip_prefix("Your original message: ").and_then(|n| n.parse::<u64>().ok()).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(50 - delay * 10)).await;
            self.sent.lock().await.push((chat_id, text.to_string()));
            Ok(())
        }

        async fn fetch_attachment(&self, _: &AttachmentRef) -> DetectBotResult<FetchedAttachment> {
            Err(DetectBotError::Transport("no attachments here".into()))
        }
    }

    struct NoBackend;

    #[async_trait]
    impl DetectionBackend for NoBackend {
        async fn predict(&self, _: &str) -> DetectBotResult<BackendResponse> {
            Err(DetectBotError::Backend("unused".into()))
        }
    }

    fn handler(transport: Arc<dyn ChatTransport>, dir: &tempfile::TempDir) -> Arc<ConversationHandler> {
        let staging = Arc::new(StagingStore::new(
            Arc::new(FsObjectStore::new(dir.path())),
            "images".into(),
            Duration::from_secs(1),
        ));
        let invoker = Arc::new(DetectionInvoker::new(
            staging,
            Arc::new(NoBackend),
            Arc::new(MemoryResultStore::new()),
            InvokerTimeouts {
                backend: Duration::from_secs(1),
                persist: Duration::from_secs(1),
            },
        ));
        Arc::new(ConversationHandler::new(transport, invoker, Duration::from_secs(1)))
    }

    fn text(chat_id: i64, n: u64) -> IncomingMessage {
        IncomingMessage {
            chat_id,
            message_id: n as i64,
            text: Some(n.to_string()),
            attachment: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn replies_within_a_chat_keep_message_order() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let mut dispatcher = Dispatcher::new(handler(transport.clone(), &dir));

        for n in 0..4 {
            dispatcher.dispatch(text(7, n));
        }
        dispatcher.dispatch(text(8, 0));
        assert_eq!(dispatcher.active_chats(), 2);
        dispatcher.shutdown().await;

        let sent = transport.sent.lock().await.clone();
        let chat7: Vec<_> = sent.iter().filter(|(c, _)| *c == 7).map(|(_, t)| t.clone()).collect();
        let expected: Vec<_> = (0..4).map(|n| format!("Your original message: {n}")).collect();
        assert_eq!(chat7, expected);
        assert_eq!(sent.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn chats_are_handled_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let mut dispatcher = Dispatcher::new(handler(transport.clone(), &dir));

        // Chat 1 gets the slowest reply, chat 2 the fastest.
        dispatcher.dispatch(text(1, 0));
        dispatcher.dispatch(text(2, 4));
        dispatcher.shutdown().await;

        let sent = transport.sent.lock().await.clone();
        assert_eq!(sent[0].0, 2);
        assert_eq!(sent[1].0, 1);
    }

    /// Never finishes a reply to chat 1.
    #[derive(Default)]
    struct StuckChatTransport {
        sent: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl ChatTransport for StuckChatTransport {
        async fn send_text(&self, chat_id: i64, text: &str) -> DetectBotResult<()> {
            if chat_id == 1 {
                std::future::pending::<()>().await;
            }
            self.sent.lock().await.push((chat_id, text.to_string()));
            Ok(())
        }

        async fn fetch_attachment(&self, _: &AttachmentRef) -> DetectBotResult<FetchedAttachment> {
            Err(DetectBotError::Transport("no attachments here".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backlog_in_one_chat_does_not_hold_up_others() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(StuckChatTransport::default());
        let mut dispatcher = Dispatcher::new(handler(transport.clone(), &dir));

        for n in 0..100 {
            dispatcher.dispatch(text(1, n));
        }
        dispatcher.dispatch(text(2, 0));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let sent = transport.sent.lock().await.clone();
        assert_eq!(sent, vec![(2, "Your original message: 0".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_workers_exit_and_restart_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let mut dispatcher = Dispatcher::with_idle_timeout(handler(transport.clone(), &dir), Duration::from_secs(1));

        dispatcher.dispatch(text(7, 1));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(dispatcher.active_chats(), 0);

        dispatcher.dispatch(text(8, 1));
        assert_eq!(dispatcher.workers.len(), 1);
        dispatcher.dispatch(text(7, 2));
        dispatcher.dispatch(text(7, 3));
        dispatcher.shutdown().await;

        let sent = transport.sent.lock().await.clone();
        let chat7: Vec<_> = sent.iter().filter(|(c, _)| *c == 7).map(|(_, t)| t.clone()).collect();
        assert_eq!(
            chat7,
            vec![
                "Your original message: 1".to_string(),
                "Your original message: 2".to_string(),
                "Your original message: 3".to_string(),
            ]
        );
        assert_eq!(sent.len(), 4);
    }

    struct ScriptedSource {
        batches: Mutex<Vec<DetectBotResult<Vec<IncomingMessage>>>>,
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        async fn receive_messages(&self) -> DetectBotResult<Vec<IncomingMessage>> {
            let next = self.batches.lock().await.pop();
            match next {
                Some(batch) => batch,
                None => std::future::pending().await,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_survives_poll_errors_and_drains_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(RecordingTransport::default());
        // Popped from the back: error first, then a batch.
        let source = Arc::new(ScriptedSource {
            batches: Mutex::new(vec![
                Ok(vec![text(5, 1), text(5, 2)]),
                Err(DetectBotError::Transport("bad gateway".into())),
            ]),
        });

        run(source, handler(transport.clone(), &dir), tokio::time::sleep(Duration::from_secs(10))).await;

        let sent = transport.sent.lock().await.clone();
        assert_eq!(
            sent,
            vec![
                (5, "Your original message: 1".to_string()),
                (5, "Your original message: 2".to_string()),
            ]
        );
    }
}
