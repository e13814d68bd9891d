use std::sync::Arc;
use std::time::Duration;

use chatrelay_agents::ChatMessage;
use chatrelay_common::{Result, ResultExt, User};
use chatrelay_db::ConversationStore;
use chatrelay_security::Cryptor;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

/// Decrypted context for one turn.
#[derive(Debug, Clone, Default)]
pub struct DialogWindow {
    pub messages: Vec<ChatMessage>,
    /// Nothing recent enough was stored, so the turn starts a new dialog.
    pub is_fresh: bool,
}

/// Loads the retention-bounded dialog of a chat and decrypts it.
///
/// A dialog with no message inside the retention interval is expired as a
/// whole, so a conversation either continues in full or starts over.
pub struct DialogWindowManager {
    store: Arc<dyn ConversationStore>,
    cryptor: Arc<Cryptor>,
    retention: Duration,
}

impl DialogWindowManager {
    pub fn new(store: Arc<dyn ConversationStore>, cryptor: Arc<Cryptor>, retention: Duration) -> Self {
        Self {
            store,
            cryptor,
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub async fn load_window(&self, user: &User, now: DateTime<Utc>) -> Result<DialogWindow> {
        let retention = TimeDelta::from_std(self.retention).unwrap_or(TimeDelta::MAX);
        let not_before = now
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let stored = self
            .store
            .get_dialog_window(user.chat_id, not_before)
            .await
            .context("load dialog")?;

        let messages = stored
            .iter()
            .map(|message| {
                let content = self
                    .cryptor
                    .decrypt(user, message)
                    .context(&format!("decrypt message {}", message.id))?;
                Ok(ChatMessage::new(message.role, content))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "loaded {} dialog messages for chat {}",
            messages.len(),
            user.chat_id
        );
        Ok(DialogWindow {
            is_fresh: messages.is_empty(),
            messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_common::{ChatId, Error, NewMessage, NewUser, Role};
    use chatrelay_db::{SqliteStore, StoreOptions};

    const HOUR: Duration = Duration::from_secs(60 * 60);

    async fn setup() -> (Arc<SqliteStore>, Arc<Cryptor>, User) {
        let store = Arc::new(SqliteStore::in_memory(StoreOptions::default()).unwrap());
        let cryptor = Arc::new(Cryptor::new("window-secret", 10).unwrap());
        let user = store
            .create_or_get_user(NewUser {
                chat_id: ChatId(42),
                username: "alice".into(),
                full_name: "Alice".into(),
            })
            .await
            .unwrap();
        (store, cryptor, user)
    }

    fn sealed(cryptor: &Cryptor, user: &User, role: Role, text: &str, at: DateTime<Utc>) -> NewMessage {
        let body = cryptor.encrypt(user, text).unwrap();
        NewMessage {
            chat_id: user.chat_id,
            role,
            body: body.body,
            version: body.version,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn recent_dialog_is_returned_decrypted_in_order() {
        let (store, cryptor, user) = setup().await;
        let now = Utc::now();
        store
            .put_messages(vec![
                sealed(&cryptor, &user, Role::System, "be brief", now - TimeDelta::minutes(90)),
                sealed(&cryptor, &user, Role::User, "hi", now - TimeDelta::minutes(90)),
                sealed(&cryptor, &user, Role::Assistant, "hello", now - TimeDelta::minutes(5)),
            ])
            .await
            .unwrap();

        let manager = DialogWindowManager::new(store.clone(), cryptor.clone(), HOUR);
        let window = manager.load_window(&user, now).await.unwrap();

        assert!(!window.is_fresh);
        assert_eq!(
            window.messages,
            vec![
                ChatMessage::new(Role::System, "be brief"),
                ChatMessage::new(Role::User, "hi"),
                ChatMessage::new(Role::Assistant, "hello"),
            ]
        );
    }

    #[tokio::test]
    async fn stale_dialog_is_expired() {
        let (store, cryptor, user) = setup().await;
        let now = Utc::now();
        let old = now - TimeDelta::hours(2);
        store
            .put_messages(vec![
                sealed(&cryptor, &user, Role::User, "old question", old),
                sealed(&cryptor, &user, Role::Assistant, "old answer", old),
            ])
            .await
            .unwrap();

        let manager = DialogWindowManager::new(store.clone(), cryptor.clone(), HOUR);
        let window = manager.load_window(&user, now).await.unwrap();
        assert!(window.is_fresh);
        assert!(window.messages.is_empty());

        // The stale rows are gone, even when looking from the past.
        let earlier = manager.load_window(&user, old).await.unwrap();
        assert!(earlier.messages.is_empty());
    }

    #[tokio::test]
    async fn corrupt_body_fails_the_load() {
        let (store, cryptor, user) = setup().await;
        let mut message = sealed(&cryptor, &user, Role::User, "hi", Utc::now());
        message.body = "garbage".into();
        store.put_messages(vec![message]).await.unwrap();

        let manager = DialogWindowManager::new(store.clone(), cryptor.clone(), HOUR);
        let err = manager.load_window(&user, Utc::now()).await.unwrap_err();
        assert!(matches!(err.root(), Error::Crypto(_)));
    }
}
