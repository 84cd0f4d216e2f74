use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use rand::RngCore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_db::models::SessionRow;

use crate::error::Result;

/// Session lifetime. Expiry is lazy: an expired session is deleted the next
/// time its token is validated, not by a background sweep.
const SESSION_TTL_HOURS: i64 = 24;

pub enum RegisterOutcome {
    Created { user_id: String },
    Rejected { message: String },
}

pub enum AuthOutcome {
    Granted { user_id: String, token: String },
    Rejected { message: String },
}

/// Issues, validates, and revokes session tokens, and keeps the user
/// online flag derived from session existence.
#[derive(Clone)]
pub struct SessionManager {
    db: Arc<Database>,
}

impl SessionManager {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create a user account. Registration never logs the user in.
    pub fn register(
        &self,
        username: &str,
        password: &str,
        display_name: &str,
        email: &str,
    ) -> Result<RegisterOutcome> {
        if username.len() < 3 || username.len() > 32 {
            return Ok(RegisterOutcome::Rejected {
                message: "username must be 3-32 characters".into(),
            });
        }
        if password.len() < 8 {
            return Ok(RegisterOutcome::Rejected {
                message: "password must be at least 8 characters".into(),
            });
        }
        if self.db.user_by_username(username)?.is_some() {
            return Ok(RegisterOutcome::Rejected {
                message: "username already taken".into(),
            });
        }

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))?
            .to_string();

        let user_id = Uuid::new_v4().to_string();
        self.db
            .create_user(&user_id, username, &password_hash, display_name, email)?;

        info!("registered user {} ({})", username, user_id);
        Ok(RegisterOutcome::Created { user_id })
    }

    /// Verify credentials and open a new session. A user may hold several
    /// sessions at once (one per device).
    pub fn authenticate(
        &self,
        username: &str,
        password: &str,
        device: Option<&str>,
    ) -> Result<AuthOutcome> {
        let Some(user) = self.db.user_by_username(username)? else {
            return Ok(AuthOutcome::Rejected {
                message: "invalid username or password".into(),
            });
        };

        let parsed_hash = PasswordHash::new(&user.password)
            .map_err(|e| anyhow::anyhow!("corrupt password hash: {e}"))?;
        if Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_err()
        {
            return Ok(AuthOutcome::Rejected {
                message: "invalid username or password".into(),
            });
        }

        let token = generate_token();
        let now = Utc::now();
        self.db.create_session(&SessionRow {
            id: Uuid::new_v4().to_string(),
            user_id: user.id.clone(),
            token: token.clone(),
            device: device.unwrap_or("unknown").to_string(),
            created_at: now.to_rfc3339(),
            expires_at: (now + chrono::Duration::hours(SESSION_TTL_HOURS)).to_rfc3339(),
            last_activity: now.to_rfc3339(),
        })?;
        self.db.set_online(&user.id, true)?;

        info!("session opened for {} ({})", username, user.id);
        Ok(AuthOutcome::Granted {
            user_id: user.id,
            token,
        })
    }

    /// Resolve a token to its owning user id, refreshing last_activity.
    /// An expired session is deleted on sight and `None` is returned.
    pub fn validate(&self, token: &str) -> Result<Option<String>> {
        let Some(session) = self.db.session_by_token(token)? else {
            return Ok(None);
        };

        if is_expired(&session.expires_at) {
            debug!("session for {} expired, deleting", session.user_id);
            self.db.delete_session(token)?;
            self.mark_offline_if_last(&session.user_id)?;
            return Ok(None);
        }

        self.db.touch_session_activity(token)?;
        Ok(Some(session.user_id))
    }

    /// Delete the session for `token`. Idempotent: returns true even when
    /// the token was already gone.
    pub fn end_session(&self, token: &str) -> Result<bool> {
        let Some(session) = self.db.session_by_token(token)? else {
            return Ok(true);
        };

        self.db.delete_session(token)?;
        self.mark_offline_if_last(&session.user_id)?;
        info!("session closed for {}", session.user_id);
        Ok(true)
    }

    /// End every session the named user holds. Returns false only when the
    /// user does not exist.
    pub fn end_sessions_for_username(&self, username: &str) -> Result<bool> {
        let Some(user) = self.db.user_by_username(username)? else {
            return Ok(false);
        };

        for session in self.db.sessions_for_user(&user.id)? {
            self.db.delete_session(&session.token)?;
        }
        self.mark_offline_if_last(&user.id)?;
        Ok(true)
    }

    /// The user is online exactly while they hold at least one session.
    fn mark_offline_if_last(&self, user_id: &str) -> Result<()> {
        if self.db.session_count(user_id)? == 0 {
            self.db.set_online(user_id, false)?;
        }
        Ok(())
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn is_expired(expires_at: &str) -> bool {
    match DateTime::parse_from_rfc3339(expires_at) {
        Ok(t) => t <= Utc::now(),
        Err(e) => {
            warn!("unparseable expires_at {:?}: {}", expires_at, e);
            true
        }
    }
}
