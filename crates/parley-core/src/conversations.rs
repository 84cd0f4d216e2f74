use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use parley_db::Database;
use parley_db::models::ConversationRow;

use crate::error::{ChatError, Result};

/// Enforces conversation membership invariants on top of the store:
/// a 1:1 conversation has exactly two participants for its whole lifetime,
/// a group has at least one and is created with at least two.
#[derive(Clone)]
pub struct Conversations {
    db: Arc<Database>,
}

impl Conversations {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn for_user(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        Ok(self.db.conversations_for_user(user_id)?)
    }

    pub fn participants_of(&self, conversation_id: &str) -> Result<Vec<String>> {
        Ok(self.db.participants_of(conversation_id)?)
    }

    /// Create a 1:1 conversation, or return the existing one. Idempotent in
    /// either argument order.
    pub fn create_one_on_one(&self, user_a: &str, user_b: &str) -> Result<ConversationRow> {
        let a = self
            .db
            .user_by_id(user_a)?
            .ok_or_else(|| ChatError::invalid(format!("user does not exist: {user_a}")))?;
        let b = self
            .db
            .user_by_id(user_b)?
            .ok_or_else(|| ChatError::invalid(format!("user does not exist: {user_b}")))?;

        if let Some(existing) = self.db.one_on_one_between(user_a, user_b)? {
            return Ok(existing);
        }

        let id = Uuid::new_v4().to_string();
        let name = format!("{} & {}", a.display_name, b.display_name);
        self.db.create_conversation(&id, &name, false)?;
        self.db.add_participant(&id, user_a)?;
        self.db.add_participant(&id, user_b)?;

        info!("created 1:1 conversation {} ({})", id, name);
        Ok(ConversationRow {
            id,
            name,
            is_group: false,
            created_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Create a group conversation with at least two distinct existing users.
    pub fn create_group(&self, name: &str, user_ids: &[String]) -> Result<ConversationRow> {
        let mut distinct: Vec<&String> = Vec::new();
        for user_id in user_ids {
            if !distinct.contains(&user_id) {
                distinct.push(user_id);
            }
        }
        if distinct.len() < 2 {
            return Err(ChatError::invalid(
                "group conversation needs at least 2 distinct participants",
            ));
        }
        for user_id in &distinct {
            if self.db.user_by_id(user_id)?.is_none() {
                return Err(ChatError::invalid(format!("user does not exist: {user_id}")));
            }
        }

        let id = Uuid::new_v4().to_string();
        self.db.create_conversation(&id, name, true)?;
        for user_id in &distinct {
            self.db.add_participant(&id, user_id)?;
        }

        info!(
            "created group conversation {} ({}) with {} members",
            id,
            name,
            distinct.len()
        );
        Ok(ConversationRow {
            id,
            name: name.to_string(),
            is_group: true,
            created_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    pub fn add_participant(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        let conversation = self
            .db
            .conversation_by_id(conversation_id)?
            .ok_or_else(|| ChatError::invalid("conversation does not exist"))?;
        if !conversation.is_group {
            return Err(ChatError::invalid(
                "cannot add participants to a 1:1 conversation",
            ));
        }
        if self.db.user_by_id(user_id)?.is_none() {
            return Err(ChatError::invalid(format!("user does not exist: {user_id}")));
        }
        if self.db.is_participant(conversation_id, user_id)? {
            return Err(ChatError::invalid("user is already a participant"));
        }

        // A concurrent add can slip between the check and the insert; the
        // participants primary key catches it, and that counts as
        // already-a-participant rather than a storage failure.
        if let Err(e) = self.db.add_participant(conversation_id, user_id) {
            if self.db.is_participant(conversation_id, user_id)? {
                return Err(ChatError::invalid("user is already a participant"));
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub fn remove_participant(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        let conversation = self
            .db
            .conversation_by_id(conversation_id)?
            .ok_or_else(|| ChatError::invalid("conversation does not exist"))?;
        if !conversation.is_group {
            return Err(ChatError::invalid(
                "cannot remove participants from a 1:1 conversation",
            ));
        }
        if !self.db.is_participant(conversation_id, user_id)? {
            return Err(ChatError::invalid("user is not a participant"));
        }
        if self.db.participant_count(conversation_id)? <= 1 {
            return Err(ChatError::invalid(
                "cannot remove the last participant from a group conversation",
            ));
        }

        self.db.remove_participant(conversation_id, user_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(usernames: &[&str]) -> (Conversations, Vec<String>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut ids = Vec::new();
        for name in usernames {
            let id = format!("id-{name}");
            db.create_user(&id, name, "hash", name, "").unwrap();
            ids.push(id);
        }
        (Conversations::new(db), ids)
    }

    #[test]
    fn one_on_one_is_idempotent_in_either_order() {
        let (convs, ids) = fixture(&["alice", "bob"]);
        let first = convs.create_one_on_one(&ids[0], &ids[1]).unwrap();
        let second = convs.create_one_on_one(&ids[1], &ids[0]).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.name, "alice & bob");
        assert!(!first.is_group);
        assert_eq!(convs.participants_of(&first.id).unwrap().len(), 2);
    }

    #[test]
    fn one_on_one_requires_both_users() {
        let (convs, ids) = fixture(&["alice"]);
        assert!(matches!(
            convs.create_one_on_one(&ids[0], "id-ghost"),
            Err(ChatError::Invalid(_))
        ));
    }

    #[test]
    fn group_requires_two_distinct_members() {
        let (convs, ids) = fixture(&["alice", "bob"]);
        let dup = vec![ids[0].clone(), ids[0].clone()];
        assert!(matches!(
            convs.create_group("team", &dup),
            Err(ChatError::Invalid(_))
        ));

        let both = vec![ids[0].clone(), ids[1].clone()];
        let group = convs.create_group("team", &both).unwrap();
        assert!(group.is_group);
        assert_eq!(convs.participants_of(&group.id).unwrap().len(), 2);
    }

    #[test]
    fn group_creation_rejects_unknown_users() {
        let (convs, ids) = fixture(&["alice"]);
        let members = vec![ids[0].clone(), "id-ghost".to_string()];
        assert!(matches!(
            convs.create_group("team", &members),
            Err(ChatError::Invalid(_))
        ));
    }

    #[test]
    fn membership_rules_for_one_on_one() {
        let (convs, ids) = fixture(&["alice", "bob", "carol"]);
        let dm = convs.create_one_on_one(&ids[0], &ids[1]).unwrap();
        assert!(matches!(
            convs.add_participant(&dm.id, &ids[2]),
            Err(ChatError::Invalid(_))
        ));
        assert!(matches!(
            convs.remove_participant(&dm.id, &ids[0]),
            Err(ChatError::Invalid(_))
        ));
    }

    #[test]
    fn add_and_remove_group_participants() {
        let (convs, ids) = fixture(&["alice", "bob", "carol"]);
        let members = vec![ids[0].clone(), ids[1].clone()];
        let group = convs.create_group("team", &members).unwrap();

        convs.add_participant(&group.id, &ids[2]).unwrap();
        assert!(matches!(
            convs.add_participant(&group.id, &ids[2]),
            Err(ChatError::Invalid(_))
        ));

        convs.remove_participant(&group.id, &ids[2]).unwrap();
        assert!(matches!(
            convs.remove_participant(&group.id, &ids[2]),
            Err(ChatError::Invalid(_))
        ));
    }

    #[test]
    fn never_drops_below_one_member() {
        let (convs, ids) = fixture(&["alice", "bob"]);
        let members = vec![ids[0].clone(), ids[1].clone()];
        let group = convs.create_group("team", &members).unwrap();

        convs.remove_participant(&group.id, &ids[1]).unwrap();
        let err = convs.remove_participant(&group.id, &ids[0]);
        assert!(matches!(err, Err(ChatError::Invalid(_))));

        // the failed removal left the membership alone
        assert_eq!(convs.participants_of(&group.id).unwrap(), vec![ids[0].clone()]);
    }

    #[test]
    fn unknown_conversation_is_invalid() {
        let (convs, ids) = fixture(&["alice"]);
        assert!(matches!(
            convs.add_participant("no-such-conversation", &ids[0]),
            Err(ChatError::Invalid(_))
        ));
    }
}
