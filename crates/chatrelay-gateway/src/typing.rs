use std::sync::Arc;
use std::time::Duration;

use chatrelay_channels::Transport;
use chatrelay_common::ChatId;
use tokio::task::JoinHandle;
use tracing::debug;

/// Telegram shows "typing…" for about five seconds per request.
pub const TYPING_INTERVAL: Duration = Duration::from_secs(5);

/// Keeps the typing indicator visible until dropped.
pub struct TypingIndicator {
    task: JoinHandle<()>,
}

impl TypingIndicator {
    pub fn start(transport: Arc<dyn Transport>, chat_id: ChatId, every: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = transport.send_typing(chat_id).await {
                    debug!("typing notification for chat {chat_id} failed: {e}");
                }
            }
        });
        Self { task }
    }
}

impl Drop for TypingIndicator {
    fn drop(&mut self) {
        self.task.abort();
    }
}
