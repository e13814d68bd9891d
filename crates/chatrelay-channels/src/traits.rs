use std::path::Path;

use async_trait::async_trait;
use chatrelay_common::{ChatId, Result, UpdateId};
use serde::{Deserialize, Serialize};

/// Lifecycle management for a messaging channel (connect, disconnect, status).
#[async_trait]
pub trait ChannelLifecycle: Send {
    /// Human-readable display name.
    fn display_name(&self) -> &str;

    /// Start receiving updates from the external service.
    async fn connect(&mut self) -> Result<()>;

    /// Stop receiving updates. Handlers already running are not interrupted.
    async fn disconnect(&mut self) -> Result<()>;

    fn status(&self) -> ChannelStatus;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connected,
    Error(String),
}

/// Outbound operations the relay performs against the chat service.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        format: TextFormat,
        button: Option<Button>,
    ) -> Result<MessageRef>;

    /// Replace the text of a message sent earlier. A rejected rich-text edit
    /// is an error; callers decide whether to fall back to plain text.
    async fn edit_message(&self, target: &MessageRef, text: &str, format: TextFormat)
    -> Result<()>;

    async fn delete_message(&self, target: &MessageRef) -> Result<()>;

    async fn send_typing(&self, chat_id: ChatId) -> Result<()>;

    async fn download_media(&self, media: &MediaRef, dest: &Path) -> Result<()>;

    /// Deep link that starts the bot with `code` as the start parameter.
    async fn invite_link(&self, code: &str) -> Result<String>;
}

/// Handle to a message the relay sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    Plain,
    Markdown,
}

/// Single inline button that answers with callback `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub text: String,
    pub data: String,
}

impl Button {
    pub fn new(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Voice,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub file_id: String,
    pub kind: MediaKind,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sender {
    pub username: String,
    pub full_name: String,
}

/// One update from the chat service, already reduced to what the relay handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub chat_id: ChatId,
    pub update_id: UpdateId,
    pub sender: Sender,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// `/name arg1 arg2`, with any `@botname` suffix removed from the name.
    Command { name: String, args: Vec<String> },
    Text(String),
    Media { media: MediaRef, forwarded: bool },
    Callback { data: String },
}

impl EventKind {
    /// Parse message text, recognising bot commands.
    pub fn from_text(text: &str) -> Self {
        let trimmed = text.trim_start();
        let Some(rest) = trimmed.strip_prefix('/') else {
            return EventKind::Text(text.to_string());
        };

        let mut parts = rest.split_whitespace();
        let head = parts.next().unwrap_or_default();
        let name = head.split('@').next().unwrap_or_default();
        if name.is_empty() {
            return EventKind::Text(text.to_string());
        }

        EventKind::Command {
            name: name.to_ascii_lowercase(),
            args: parts.map(str::to_string).collect(),
        }
    }

    /// Short label used in logs.
    pub fn label(&self) -> &str {
        match self {
            EventKind::Command { name, .. } => name,
            EventKind::Text(_) => "text",
            EventKind::Media { .. } => "media",
            EventKind::Callback { .. } => "callback",
        }
    }
}
