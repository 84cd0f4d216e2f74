//! Row types mapped straight from SQLite, distinct from the wire types.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub display_name: String,
    pub email: String,
    pub is_online: bool,
    pub last_seen: Option<String>,
    pub created_at: String,
}

pub struct SessionRow {
    pub id: String,
    pub user_id: String,
    pub token: String,
    pub device: String,
    pub created_at: String,
    pub expires_at: String,
    pub last_activity: String,
}

pub struct ConversationRow {
    pub id: String,
    pub name: String,
    pub is_group: bool,
    pub created_at: String,
}
