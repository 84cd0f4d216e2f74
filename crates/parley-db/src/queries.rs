use crate::Database;
use crate::models::{ConversationRow, SessionRow, UserRow};
use anyhow::Result;
use rusqlite::Connection;

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: &str,
        username: &str,
        password_hash: &str,
        display_name: &str,
        email: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, display_name, email)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (id, username, password_hash, display_name, email),
            )?;
            Ok(())
        })
    }

    pub fn user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    /// Flip the online flag. Going offline also stamps last_seen.
    pub fn set_online(&self, user_id: &str, online: bool) -> Result<()> {
        self.with_conn(|conn| {
            if online {
                conn.execute("UPDATE users SET is_online = 1 WHERE id = ?1", [user_id])?;
            } else {
                conn.execute(
                    "UPDATE users SET is_online = 0, last_seen = ?1 WHERE id = ?2",
                    (chrono::Utc::now().to_rfc3339(), user_id),
                )?;
            }
            Ok(())
        })
    }

    // -- Sessions --

    pub fn create_session(&self, session: &SessionRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, user_id, token, device, created_at, expires_at, last_activity)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                (
                    &session.id,
                    &session.user_id,
                    &session.token,
                    &session.device,
                    &session.created_at,
                    &session.expires_at,
                    &session.last_activity,
                ),
            )?;
            Ok(())
        })
    }

    pub fn session_by_token(&self, token: &str) -> Result<Option<SessionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, token, device, created_at, expires_at, last_activity
                 FROM sessions WHERE token = ?1",
            )?;
            stmt.query_row([token], session_from_row).optional()
        })
    }

    /// Returns true when a row was actually deleted.
    pub fn delete_session(&self, token: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM sessions WHERE token = ?1", [token])?;
            Ok(n > 0)
        })
    }

    pub fn touch_session_activity(&self, token: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET last_activity = ?1 WHERE token = ?2",
                (chrono::Utc::now().to_rfc3339(), token),
            )?;
            Ok(())
        })
    }

    pub fn session_count(&self, user_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let n = conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }

    pub fn sessions_for_user(&self, user_id: &str) -> Result<Vec<SessionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, token, device, created_at, expires_at, last_activity
                 FROM sessions WHERE user_id = ?1",
            )?;
            let rows = stmt
                .query_map([user_id], session_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Conversations --

    pub fn create_conversation(&self, id: &str, name: &str, is_group: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, name, is_group, created_at) VALUES (?1, ?2, ?3, ?4)",
                (id, name, is_group, chrono::Utc::now().to_rfc3339()),
            )?;
            Ok(())
        })
    }

    pub fn conversation_by_id(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, is_group, created_at FROM conversations WHERE id = ?1",
            )?;
            stmt.query_row([id], conversation_from_row).optional()
        })
    }

    pub fn conversations_for_user(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.name, c.is_group, c.created_at
                 FROM conversations c
                 JOIN participants p ON c.id = p.conversation_id
                 WHERE p.user_id = ?1",
            )?;
            let rows = stmt
                .query_map([user_id], conversation_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Find the non-group conversation both users participate in, if any.
    /// The join is symmetric, so the argument order does not matter.
    pub fn one_on_one_between(&self, user_a: &str, user_b: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.name, c.is_group, c.created_at
                 FROM conversations c
                 JOIN participants p1 ON c.id = p1.conversation_id
                 JOIN participants p2 ON c.id = p2.conversation_id
                 WHERE c.is_group = 0 AND p1.user_id = ?1 AND p2.user_id = ?2",
            )?;
            stmt.query_row((user_a, user_b), conversation_from_row)
                .optional()
        })
    }

    // -- Participants --

    pub fn add_participant(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO participants (conversation_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                (conversation_id, user_id, chrono::Utc::now().to_rfc3339()),
            )?;
            Ok(())
        })
    }

    /// Returns true when the edge existed and was removed.
    pub fn remove_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
                (conversation_id, user_id),
            )?;
            Ok(n > 0)
        })
    }

    pub fn is_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
                (conversation_id, user_id),
                |row| row.get(0),
            )?;
            Ok(n > 0)
        })
    }

    pub fn participants_of(&self, conversation_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT user_id FROM participants WHERE conversation_id = ?1")?;
            let rows = stmt
                .query_map([conversation_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn participant_count(&self, conversation_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let n = conn.query_row(
                "SELECT COUNT(*) FROM participants WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    // column is one of two fixed strings, never user input
    let sql = format!(
        "SELECT id, username, password, display_name, email, is_online, last_seen, created_at
         FROM users WHERE {} = ?1",
        column
    );
    let mut stmt = conn.prepare(&sql)?;
    stmt.query_row([value], |row| {
        Ok(UserRow {
            id: row.get(0)?,
            username: row.get(1)?,
            password: row.get(2)?,
            display_name: row.get(3)?,
            email: row.get(4)?,
            is_online: row.get(5)?,
            last_seen: row.get(6)?,
            created_at: row.get(7)?,
        })
    })
    .optional()
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        token: row.get(2)?,
        device: row.get(3)?,
        created_at: row.get(4)?,
        expires_at: row.get(5)?,
        last_activity: row.get(6)?,
    })
}

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        name: row.get(1)?,
        is_group: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
