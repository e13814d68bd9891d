use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chatrelay_common::{
    ChatId, Error, InputState, NewMessage, NewUser, Result, StoredMessage, UsageRecord, User,
};
use chatrelay_security::{generate_invite_code, generate_salt};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use tracing::{debug, info, warn};

use crate::migrations;
use crate::store::ConversationStore;

const USER_COLUMNS: &str = "chat_id, approved, username, full_name, salt, model, system_prompt,
    input_state, invite_code, invited_by, invited_with, dialog_id, created_at, updated_at";

const INVITE_CODE_ATTEMPTS: usize = 10;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Invite code that approves anyone, in addition to per-user codes.
    pub default_invite_code: Option<String>,
}

/// [`ConversationStore`] backed by a single SQLite connection.
///
/// The connection sits behind a mutex and is never held across an await, so
/// each call is one short critical section.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    options: StoreOptions,
}

impl SqliteStore {
    pub fn open(db_path: &Path, options: StoreOptions) -> Result<Self> {
        info!("opening conversation store at {}", db_path.display());
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Database(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;",
        )
        .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;

        Self::with_connection(conn, options)
    }

    pub fn in_memory(options: StoreOptions) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;
        Self::with_connection(conn, options)
    }

    fn with_connection(mut conn: Connection, options: StoreOptions) -> Result<Self> {
        migrations::run(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            options,
        })
    }

    fn with_conn<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| Error::Database("connection mutex poisoned".into()))?;
        op(&mut conn)
    }

    fn approve_with(
        &self,
        user: &mut User,
        invited_by: Option<ChatId>,
        code: &str,
    ) -> Result<()> {
        let now = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET approved = 1, invited_by = ?1, invited_with = ?2, updated_at = ?3
                 WHERE chat_id = ?4",
                params![invited_by.map(|c| c.0), code, format_ts(now), user.chat_id.0],
            )
            .map_err(|e| Error::Database(format!("failed to approve user: {e}")))
        })?;

        user.approved = true;
        user.invited_by = invited_by;
        user.invited_with = Some(code.to_string());
        user.updated_at = now;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn get_user(&self, chat_id: ChatId) -> Result<Option<User>> {
        self.with_conn(|conn| load_user(conn, chat_id))
    }

    async fn create_or_get_user(&self, user: NewUser) -> Result<User> {
        self.with_conn(|conn| {
            if let Some(existing) = load_user(conn, user.chat_id)? {
                return Ok(existing);
            }

            let now = format_ts(Utc::now());
            conn.execute(
                "INSERT INTO users (chat_id, approved, username, full_name, salt, input_state,
                                    dialog_id, created_at, updated_at)
                 VALUES (?1, 0, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(chat_id) DO NOTHING",
                params![
                    user.chat_id.0,
                    user.username,
                    user.full_name,
                    generate_salt(),
                    InputState::Empty.as_str(),
                    uuid::Uuid::new_v4().to_string(),
                    now,
                ],
            )
            .map_err(|e| Error::Database(format!("failed to create user: {e}")))?;
            info!("registered new user {}", user.chat_id);

            load_user(conn, user.chat_id)?.ok_or(Error::MissingUser(user.chat_id))
        })
    }

    async fn set_approval(&self, chat_id: ChatId, approved: bool) -> Result<()> {
        self.with_conn(|conn| {
            update_user(
                conn,
                chat_id,
                "UPDATE users SET approved = ?1, updated_at = ?2 WHERE chat_id = ?3",
                params![approved, format_ts(Utc::now()), chat_id.0],
            )
        })
    }

    async fn set_system_prompt(&self, chat_id: ChatId, prompt: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            update_user(
                conn,
                chat_id,
                "UPDATE users SET system_prompt = ?1, updated_at = ?2 WHERE chat_id = ?3",
                params![prompt, format_ts(Utc::now()), chat_id.0],
            )
        })
    }

    async fn set_model(&self, chat_id: ChatId, model: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            update_user(
                conn,
                chat_id,
                "UPDATE users SET model = ?1, updated_at = ?2 WHERE chat_id = ?3",
                params![model, format_ts(Utc::now()), chat_id.0],
            )
        })
    }

    async fn set_input_state(&self, chat_id: ChatId, state: InputState) -> Result<()> {
        self.with_conn(|conn| {
            update_user(
                conn,
                chat_id,
                "UPDATE users SET input_state = ?1, updated_at = ?2 WHERE chat_id = ?3",
                params![state.as_str(), format_ts(Utc::now()), chat_id.0],
            )
        })
    }

    async fn ensure_invite_code(&self, chat_id: ChatId) -> Result<String> {
        self.with_conn(|conn| {
            let user = load_user(conn, chat_id)?.ok_or(Error::MissingUser(chat_id))?;
            if let Some(code) = user.invite_code {
                return Ok(code);
            }

            for _ in 0..INVITE_CODE_ATTEMPTS {
                let code = generate_invite_code();
                let result = conn.execute(
                    "UPDATE users SET invite_code = ?1, updated_at = ?2
                     WHERE chat_id = ?3 AND invite_code IS NULL",
                    params![code, format_ts(Utc::now()), chat_id.0],
                );
                match result {
                    Ok(_) => break,
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == ErrorCode::ConstraintViolation =>
                    {
                        debug!("invite code collision for {chat_id}, regenerating");
                    }
                    Err(e) => {
                        return Err(Error::Database(format!("failed to set invite code: {e}")));
                    }
                }
            }

            load_user(conn, chat_id)?
                .and_then(|u| u.invite_code)
                .ok_or_else(|| Error::Database("could not allocate a unique invite code".into()))
        })
    }

    async fn check_invite_code(&self, user: &mut User, code: &str) -> Result<bool> {
        if user.approved {
            return Ok(true);
        }
        let code = code.trim();
        if code.is_empty() {
            return Ok(false);
        }

        let inviter: Option<i64> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT chat_id FROM users
                 WHERE invite_code = ?1 AND approved = 1 AND chat_id != ?2",
                params![code, user.chat_id.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to look up invite code: {e}")))
        })?;

        if let Some(inviter) = inviter {
            self.approve_with(user, Some(ChatId(inviter)), code)?;
            info!("user {} approved via invite from {inviter}", user.chat_id);
            return Ok(true);
        }

        if self.options.default_invite_code.as_deref() == Some(code) {
            self.approve_with(user, None, code)?;
            info!("user {} approved via default invite code", user.chat_id);
            return Ok(true);
        }

        debug!("user {} presented an unknown invite code", user.chat_id);
        Ok(false)
    }

    async fn get_dialog_window(
        &self,
        chat_id: ChatId,
        not_before: DateTime<Utc>,
    ) -> Result<Vec<StoredMessage>> {
        self.with_conn(|conn| {
            let recent: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM messages WHERE chat_id = ?1 AND created_at >= ?2",
                    params![chat_id.0, format_ts(not_before)],
                    |row| row.get(0),
                )
                .map_err(|e| Error::Database(format!("failed to count recent messages: {e}")))?;

            if recent == 0 {
                let deleted = delete_messages(conn, chat_id)?;
                if deleted > 0 {
                    debug!("expired {deleted} messages for chat {chat_id}");
                }
                return Ok(Vec::new());
            }

            let mut stmt = conn
                .prepare(
                    "SELECT id, chat_id, role, message, version, created_at
                     FROM messages
                     WHERE chat_id = ?1
                     ORDER BY id ASC",
                )
                .map_err(|e| Error::Database(format!("failed to prepare dialog query: {e}")))?;

            let rows = stmt
                .query_map(params![chat_id.0], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .map_err(|e| Error::Database(format!("failed to load dialog: {e}")))?;

            let mut messages = Vec::new();
            for row in rows {
                let (id, chat, role, body, version, created_at) = row
                    .map_err(|e| Error::Database(format!("failed to read message row: {e}")))?;
                messages.push(StoredMessage {
                    id,
                    chat_id: ChatId(chat),
                    role: role.parse()?,
                    body,
                    version,
                    created_at: parse_timestamp(&created_at),
                });
            }
            Ok(messages)
        })
    }

    async fn put_messages(&self, messages: Vec<NewMessage>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        self.with_conn(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;
            {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO messages (chat_id, role, message, version, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )
                    .map_err(|e| Error::Database(format!("failed to prepare insert: {e}")))?;
                for msg in &messages {
                    stmt.execute(params![
                        msg.chat_id.0,
                        msg.role.as_str(),
                        msg.body,
                        msg.version.tag(),
                        format_ts(msg.created_at),
                    ])
                    .map_err(|e| Error::Database(format!("failed to insert message: {e}")))?;
                }
            }
            tx.commit()
                .map_err(|e| Error::Database(format!("failed to commit messages: {e}")))?;
            debug!("stored {} messages", messages.len());
            Ok(())
        })
    }

    async fn clear_messages(&self, chat_id: ChatId) -> Result<()> {
        self.with_conn(|conn| delete_messages(conn, chat_id).map(|_| ()))
    }

    async fn reset_dialog(&self, chat_id: ChatId) -> Result<String> {
        let dialog_id = uuid::Uuid::new_v4().to_string();
        self.with_conn(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;
            tx.execute("DELETE FROM messages WHERE chat_id = ?1", params![chat_id.0])
                .map_err(|e| Error::Database(format!("failed to clear messages: {e}")))?;
            let updated = tx
                .execute(
                    "UPDATE users SET dialog_id = ?1, updated_at = ?2 WHERE chat_id = ?3",
                    params![dialog_id, format_ts(Utc::now()), chat_id.0],
                )
                .map_err(|e| Error::Database(format!("failed to reset dialog: {e}")))?;
            if updated == 0 {
                return Err(Error::MissingUser(chat_id));
            }
            tx.commit()
                .map_err(|e| Error::Database(format!("failed to commit dialog reset: {e}")))
        })?;
        info!("reset dialog for chat {chat_id}");
        Ok(dialog_id)
    }

    async fn put_usage(&self, usage: UsageRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO usage (chat_id, update_id, dialog_id, model, prompt_tokens,
                                    completion_tokens, total_tokens, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    usage.chat_id.0,
                    usage.update_id.0,
                    usage.dialog_id,
                    usage.model,
                    usage.prompt_tokens,
                    usage.completion_tokens,
                    usage.total_tokens,
                    format_ts(Utc::now()),
                ],
            )
            .map_err(|e| Error::Database(format!("failed to record usage: {e}")))?;
            Ok(())
        })
    }

    async fn close(&self) -> Result<()> {
        self.with_conn(|conn| {
            if let Err(e) = conn.execute_batch("VACUUM;") {
                warn!("vacuum on close failed: {e}");
            }
            Ok(())
        })?;
        info!("conversation store closed");
        Ok(())
    }
}

fn load_user(conn: &Connection, chat_id: ChatId) -> Result<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE chat_id = ?1");
    let raw = conn
        .query_row(&sql, params![chat_id.0], RawUser::from_row)
        .optional()
        .map_err(|e| Error::Database(format!("failed to load user: {e}")))?;
    raw.map(RawUser::into_user).transpose()
}

fn update_user(
    conn: &Connection,
    chat_id: ChatId,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<()> {
    let updated = conn
        .execute(sql, params)
        .map_err(|e| Error::Database(format!("failed to update user: {e}")))?;
    if updated == 0 {
        return Err(Error::MissingUser(chat_id));
    }
    Ok(())
}

fn delete_messages(conn: &Connection, chat_id: ChatId) -> Result<usize> {
    conn.execute("DELETE FROM messages WHERE chat_id = ?1", params![chat_id.0])
        .map_err(|e| Error::Database(format!("failed to clear messages: {e}")))
}

/// Column values as read; enum parsing happens outside the rusqlite closure.
struct RawUser {
    chat_id: i64,
    approved: bool,
    username: String,
    full_name: String,
    salt: String,
    model: Option<String>,
    system_prompt: Option<String>,
    input_state: String,
    invite_code: Option<String>,
    invited_by: Option<i64>,
    invited_with: Option<String>,
    dialog_id: String,
    created_at: String,
    updated_at: String,
}

impl RawUser {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            chat_id: row.get(0)?,
            approved: row.get(1)?,
            username: row.get(2)?,
            full_name: row.get(3)?,
            salt: row.get(4)?,
            model: row.get(5)?,
            system_prompt: row.get(6)?,
            input_state: row.get(7)?,
            invite_code: row.get(8)?,
            invited_by: row.get(9)?,
            invited_with: row.get(10)?,
            dialog_id: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_user(self) -> Result<User> {
        Ok(User {
            chat_id: ChatId(self.chat_id),
            approved: self.approved,
            username: self.username,
            full_name: self.full_name,
            salt: self.salt,
            model: self.model.filter(|m| !m.is_empty()),
            system_prompt: self.system_prompt.filter(|p| !p.is_empty()),
            input_state: self.input_state.parse()?,
            invite_code: self.invite_code,
            invited_by: self.invited_by.map(ChatId),
            invited_with: self.invited_with,
            dialog_id: self.dialog_id,
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
        })
    }
}

/// Fixed-width UTC timestamps so that text comparison matches time order.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!("failed to parse timestamp '{value}': {e}, falling back to now");
            Utc::now()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_common::{MessageVersion, Role, UpdateId};
    use chrono::Duration as ChronoDuration;

    fn store() -> SqliteStore {
        SqliteStore::in_memory(StoreOptions::default()).expect("in-memory store should open")
    }

    fn new_user(id: i64) -> NewUser {
        NewUser {
            chat_id: ChatId(id),
            username: format!("user{id}"),
            full_name: format!("User {id}"),
        }
    }

    fn message(chat: i64, role: Role, body: &str, at: DateTime<Utc>) -> NewMessage {
        NewMessage {
            chat_id: ChatId(chat),
            role,
            body: body.to_string(),
            version: MessageVersion::CURRENT,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn create_or_get_user_is_stable() {
        let store = store();
        let first = store.create_or_get_user(new_user(1)).await.unwrap();
        assert!(!first.approved);
        assert_eq!(first.salt.len(), chatrelay_security::SALT_LEN);
        assert!(!first.dialog_id.is_empty());
        assert_eq!(first.input_state, InputState::Empty);

        let again = store.create_or_get_user(new_user(1)).await.unwrap();
        assert_eq!(again.salt, first.salt);
        assert_eq!(again.dialog_id, first.dialog_id);
    }

    #[tokio::test]
    async fn user_settings_round_trip() {
        let store = store();
        let id = ChatId(7);
        store.create_or_get_user(new_user(7)).await.unwrap();

        store.set_approval(id, true).await.unwrap();
        store.set_system_prompt(id, Some("be brief")).await.unwrap();
        store.set_model(id, Some("gpt-4o")).await.unwrap();
        store
            .set_input_state(id, InputState::AwaitingSystemPrompt)
            .await
            .unwrap();

        let user = store.get_user(id).await.unwrap().unwrap();
        assert!(user.approved);
        assert_eq!(user.system_prompt.as_deref(), Some("be brief"));
        assert_eq!(user.model.as_deref(), Some("gpt-4o"));
        assert_eq!(user.input_state, InputState::AwaitingSystemPrompt);

        store.set_system_prompt(id, None).await.unwrap();
        let user = store.get_user(id).await.unwrap().unwrap();
        assert!(user.system_prompt.is_none());
    }

    #[tokio::test]
    async fn updates_on_missing_user_fail() {
        let store = store();
        let err = store.set_approval(ChatId(404), true).await.unwrap_err();
        assert!(matches!(err, Error::MissingUser(ChatId(404))));
        assert!(store.get_user(ChatId(404)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dialog_window_returns_messages_in_order() {
        let store = store();
        store.create_or_get_user(new_user(1)).await.unwrap();
        let now = Utc::now();
        store
            .put_messages(vec![
                message(1, Role::System, "sys", now),
                message(1, Role::User, "hi", now),
                message(1, Role::Assistant, "hello", now),
            ])
            .await
            .unwrap();

        let window = store
            .get_dialog_window(ChatId(1), now - ChronoDuration::hours(1))
            .await
            .unwrap();
        let roles: Vec<Role> = window.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert!(window.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(window[1].body, "hi");
        assert_eq!(window[1].version, 2);
    }

    #[tokio::test]
    async fn stale_dialog_is_deleted() {
        let store = store();
        store.create_or_get_user(new_user(1)).await.unwrap();
        let old = Utc::now() - ChronoDuration::hours(2);
        store
            .put_messages(vec![message(1, Role::User, "old", old)])
            .await
            .unwrap();

        let cutoff = Utc::now() - ChronoDuration::hours(1);
        assert!(store.get_dialog_window(ChatId(1), cutoff).await.unwrap().is_empty());

        // Even with an older cutoff, the rows are gone.
        let window = store
            .get_dialog_window(ChatId(1), old - ChronoDuration::hours(1))
            .await
            .unwrap();
        assert!(window.is_empty());
    }

    #[tokio::test]
    async fn one_recent_message_keeps_whole_dialog() {
        let store = store();
        store.create_or_get_user(new_user(1)).await.unwrap();
        let old = Utc::now() - ChronoDuration::hours(3);
        let now = Utc::now();
        store
            .put_messages(vec![
                message(1, Role::User, "old", old),
                message(1, Role::User, "new", now),
            ])
            .await
            .unwrap();

        let window = store
            .get_dialog_window(ChatId(1), now - ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(window.len(), 2);
    }

    #[tokio::test]
    async fn put_messages_is_atomic() {
        let store = store();
        store.create_or_get_user(new_user(1)).await.unwrap();
        let now = Utc::now();

        // Chat 2 has no user row, so the foreign key rejects the second insert.
        let err = store
            .put_messages(vec![
                message(1, Role::User, "hi", now),
                message(2, Role::Assistant, "orphan", now),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Database(_)));

        let window = store
            .get_dialog_window(ChatId(1), now - ChronoDuration::hours(1))
            .await
            .unwrap();
        assert!(window.is_empty());
    }

    #[tokio::test]
    async fn reset_dialog_clears_and_rotates_id() {
        let store = store();
        let user = store.create_or_get_user(new_user(1)).await.unwrap();
        let now = Utc::now();
        store
            .put_messages(vec![message(1, Role::User, "hi", now)])
            .await
            .unwrap();

        let new_id = store.reset_dialog(ChatId(1)).await.unwrap();
        assert_ne!(new_id, user.dialog_id);

        let reloaded = store.get_user(ChatId(1)).await.unwrap().unwrap();
        assert_eq!(reloaded.dialog_id, new_id);
        assert!(
            store
                .get_dialog_window(ChatId(1), now - ChronoDuration::hours(1))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn invite_codes_are_unique_and_stable() {
        let store = store();
        let mut codes = std::collections::HashSet::new();
        for id in 1..=20 {
            store.create_or_get_user(new_user(id)).await.unwrap();
            let code = store.ensure_invite_code(ChatId(id)).await.unwrap();
            assert_eq!(code.len(), chatrelay_security::INVITE_CODE_LEN);
            assert_eq!(store.ensure_invite_code(ChatId(id)).await.unwrap(), code);
            assert!(codes.insert(code));
        }
    }

    #[tokio::test]
    async fn invite_code_from_approved_user_approves() {
        let store = store();
        store.create_or_get_user(new_user(1)).await.unwrap();
        store.set_approval(ChatId(1), true).await.unwrap();
        let code = store.ensure_invite_code(ChatId(1)).await.unwrap();

        let mut guest = store.create_or_get_user(new_user(2)).await.unwrap();
        assert!(!store.check_invite_code(&mut guest, "nope").await.unwrap());
        assert!(!guest.approved);

        assert!(store.check_invite_code(&mut guest, &code).await.unwrap());
        assert!(guest.approved);
        assert_eq!(guest.invited_by, Some(ChatId(1)));
        assert_eq!(guest.invited_with.as_deref(), Some(code.as_str()));

        let stored = store.get_user(ChatId(2)).await.unwrap().unwrap();
        assert!(stored.approved);
        assert_eq!(stored.invited_by, Some(ChatId(1)));
    }

    #[tokio::test]
    async fn own_invite_code_does_not_approve() {
        let store = store();
        store.create_or_get_user(new_user(1)).await.unwrap();
        let code = store.ensure_invite_code(ChatId(1)).await.unwrap();
        let mut user = store.get_user(ChatId(1)).await.unwrap().unwrap();
        assert!(!store.check_invite_code(&mut user, &code).await.unwrap());
    }

    #[tokio::test]
    async fn default_invite_code_approves() {
        let store = SqliteStore::in_memory(StoreOptions {
            default_invite_code: Some("letmein".into()),
        })
        .unwrap();
        let mut user = store.create_or_get_user(new_user(3)).await.unwrap();
        assert!(store.check_invite_code(&mut user, "letmein").await.unwrap());
        assert!(user.approved);
        assert!(user.invited_by.is_none());
        assert_eq!(user.invited_with.as_deref(), Some("letmein"));
    }

    #[tokio::test]
    async fn usage_is_recorded() {
        let store = store();
        store
            .put_usage(UsageRecord {
                chat_id: ChatId(1),
                update_id: UpdateId(10),
                dialog_id: "d".into(),
                model: "gpt-4o".into(),
                prompt_tokens: 12,
                completion_tokens: 3,
                total_tokens: 15,
            })
            .await
            .unwrap();

        let total: i64 = store
            .with_conn(|conn| {
                conn.query_row("SELECT total_tokens FROM usage WHERE chat_id = 1", [], |r| {
                    r.get(0)
                })
                .map_err(|e| Error::Database(e.to_string()))
            })
            .unwrap();
        assert_eq!(total, 15);
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let a = Utc::now();
        let b = a + ChronoDuration::microseconds(1);
        assert!(format_ts(a) < format_ts(b));

        let parsed = parse_timestamp(&format_ts(a));
        assert_eq!((a - parsed).num_microseconds(), Some(0));
    }
}
