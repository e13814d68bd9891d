use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chatrelay_channels::{Button, MediaRef, MessageRef, TextFormat, Transport};
use chatrelay_common::{ChatId, Error, Result};

#[derive(Default)]
struct Recorded {
    sent: Vec<(ChatId, String, Option<Button>)>,
    edits: Vec<(String, TextFormat)>,
    deleted: Vec<MessageRef>,
    typing: usize,
    reject_markdown: bool,
    plain_edit_delay: Option<Duration>,
}

/// Transport that records every call and never touches the network.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    recorded: Mutex<Recorded>,
}

impl RecordingTransport {
    pub fn reject_markdown(&self) {
        self.recorded.lock().unwrap().reject_markdown = true;
    }

    /// Make every plain-text edit take `delay` before it is recorded.
    pub fn slow_plain_edits(&self, delay: Duration) {
        self.recorded.lock().unwrap().plain_edit_delay = Some(delay);
    }

    pub fn edits(&self) -> Vec<(String, TextFormat)> {
        self.recorded.lock().unwrap().edits.clone()
    }

    pub fn sent(&self) -> Vec<(ChatId, String, Option<Button>)> {
        self.recorded.lock().unwrap().sent.clone()
    }

    pub fn typing(&self) -> usize {
        self.recorded.lock().unwrap().typing
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        _format: TextFormat,
        button: Option<Button>,
    ) -> Result<MessageRef> {
        let mut recorded = self.recorded.lock().unwrap();
        recorded.sent.push((chat_id, text.to_string(), button));
        Ok(MessageRef {
            chat_id,
            message_id: recorded.sent.len() as i32,
        })
    }

    async fn edit_message(&self, _target: &MessageRef, text: &str, format: TextFormat) -> Result<()> {
        let delay = self.recorded.lock().unwrap().plain_edit_delay;
        if format == TextFormat::Plain
            && let Some(delay) = delay
        {
            tokio::time::sleep(delay).await;
        }
        let mut recorded = self.recorded.lock().unwrap();
        if format == TextFormat::Markdown && recorded.reject_markdown {
            return Err(Error::Channel("can't parse entities".into()));
        }
        recorded.edits.push((text.to_string(), format));
        Ok(())
    }

    async fn delete_message(&self, target: &MessageRef) -> Result<()> {
        self.recorded.lock().unwrap().deleted.push(*target);
        Ok(())
    }

    async fn send_typing(&self, _chat_id: ChatId) -> Result<()> {
        self.recorded.lock().unwrap().typing += 1;
        Ok(())
    }

    async fn download_media(&self, _media: &MediaRef, dest: &Path) -> Result<()> {
        std::fs::write(dest, b"OggS")?;
        Ok(())
    }

    async fn invite_link(&self, code: &str) -> Result<String> {
        Ok(format!("https://t.me/test_bot?start={code}"))
    }
}
