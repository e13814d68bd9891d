use chatrelay_common::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// One schema step. Versions are applied in order and recorded in
/// `PRAGMA user_version`.
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial",
        sql: "CREATE TABLE users (
                chat_id INTEGER PRIMARY KEY,
                approved INTEGER NOT NULL DEFAULT 0,
                username TEXT NOT NULL DEFAULT '',
                full_name TEXT NOT NULL DEFAULT '',
                salt TEXT NOT NULL,
                model TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL REFERENCES users(chat_id),
                role TEXT NOT NULL,
                message TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX idx_messages_chat ON messages(chat_id, created_at);

            CREATE TABLE usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                update_id INTEGER NOT NULL,
                model TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );",
    },
    Migration {
        version: 2,
        name: "prompts_and_invites",
        sql: "ALTER TABLE users ADD COLUMN system_prompt TEXT;
            ALTER TABLE users ADD COLUMN input_state TEXT NOT NULL DEFAULT 'empty';
            ALTER TABLE users ADD COLUMN invite_code TEXT;
            ALTER TABLE users ADD COLUMN invited_by INTEGER;
            ALTER TABLE users ADD COLUMN invited_with TEXT;
            ALTER TABLE users ADD COLUMN dialog_id TEXT NOT NULL DEFAULT '';

            CREATE UNIQUE INDEX idx_users_invite_code
                ON users(invite_code) WHERE invite_code IS NOT NULL;

            ALTER TABLE usage ADD COLUMN dialog_id TEXT NOT NULL DEFAULT '';",
    },
];

pub fn current_version(conn: &Connection) -> Result<u32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| Error::Database(format!("failed to read schema version: {e}")))
}

/// Apply every migration newer than the stored schema version in one transaction.
pub fn run(conn: &mut Connection) -> Result<()> {
    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    let Some(last) = pending.last().map(|m| m.version) else {
        debug!("schema is up to date at version {current}");
        return Ok(());
    };

    let tx = conn
        .transaction()
        .map_err(|e| Error::Database(format!("failed to begin migration: {e}")))?;
    for migration in &pending {
        tx.execute_batch(migration.sql).map_err(|e| {
            Error::Database(format!(
                "migration {} ({}) failed: {e}",
                migration.version, migration.name
            ))
        })?;
        debug!("applied migration {} ({})", migration.version, migration.name);
    }
    tx.pragma_update(None, "user_version", last)
        .map_err(|e| Error::Database(format!("failed to record schema version: {e}")))?;
    tx.commit()
        .map_err(|e| Error::Database(format!("failed to commit migration: {e}")))?;

    info!("migrated schema from version {current} to {last}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_strictly_increasing() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn run_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        let version = current_version(&conn).unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().version);

        run(&mut conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), version);
    }

    #[test]
    fn upgrades_from_first_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATIONS[0].sql).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
        conn.execute(
            "INSERT INTO users (chat_id, salt, created_at, updated_at) VALUES (1, 's', 'x', 'x')",
            [],
        )
        .unwrap();

        run(&mut conn).unwrap();

        let state: String = conn
            .query_row("SELECT input_state FROM users WHERE chat_id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(state, "empty");
    }
}
