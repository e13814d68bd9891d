use async_trait::async_trait;
use chatrelay_common::{
    ChatId, InputState, NewMessage, NewUser, Result, StoredMessage, UsageRecord, User,
};
use chrono::{DateTime, Utc};

/// Durable storage for users, dialog messages and usage records.
///
/// Message bodies pass through sealed; the store never sees plaintext.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_user(&self, chat_id: ChatId) -> Result<Option<User>>;

    /// Return the existing user or insert a fresh, unapproved one with a new
    /// salt and dialog id.
    async fn create_or_get_user(&self, user: NewUser) -> Result<User>;

    async fn set_approval(&self, chat_id: ChatId, approved: bool) -> Result<()>;

    async fn set_system_prompt(&self, chat_id: ChatId, prompt: Option<&str>) -> Result<()>;

    async fn set_model(&self, chat_id: ChatId, model: Option<&str>) -> Result<()>;

    async fn set_input_state(&self, chat_id: ChatId, state: InputState) -> Result<()>;

    /// Return the user's invite code, generating a unique one on first use.
    async fn ensure_invite_code(&self, chat_id: ChatId) -> Result<String>;

    /// Approve `user` if `code` belongs to another user or matches the
    /// configured default code. Updates `user` in place and returns whether
    /// it was approved.
    async fn check_invite_code(&self, user: &mut User, code: &str) -> Result<bool>;

    /// All messages of the chat in creation order, or none when nothing was
    /// written at or after `not_before`. A stale dialog is deleted.
    async fn get_dialog_window(
        &self,
        chat_id: ChatId,
        not_before: DateTime<Utc>,
    ) -> Result<Vec<StoredMessage>>;

    /// Write a batch atomically: either every message lands or none does.
    async fn put_messages(&self, messages: Vec<NewMessage>) -> Result<()>;

    async fn clear_messages(&self, chat_id: ChatId) -> Result<()>;

    /// Clear the dialog and assign a new dialog id, which is returned.
    async fn reset_dialog(&self, chat_id: ChatId) -> Result<String>;

    async fn put_usage(&self, usage: UsageRecord) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
