use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY,
            username        TEXT NOT NULL UNIQUE,
            password        TEXT NOT NULL,
            display_name    TEXT NOT NULL,
            email           TEXT NOT NULL DEFAULT '',
            is_online       INTEGER NOT NULL DEFAULT 0,
            last_seen       TEXT,
            created_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id              TEXT PRIMARY KEY,
            user_id         TEXT NOT NULL REFERENCES users(id),
            token           TEXT NOT NULL UNIQUE,
            device          TEXT NOT NULL DEFAULT 'unknown',
            created_at      TEXT NOT NULL,
            expires_at      TEXT NOT NULL,
            last_activity   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_user
            ON sessions(user_id);

        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            name            TEXT NOT NULL,
            is_group        INTEGER NOT NULL,
            created_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS participants (
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            user_id         TEXT NOT NULL REFERENCES users(id),
            joined_at       TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (conversation_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON participants(user_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
