use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use parley_core::Conversations;
use parley_core::error::Result;
use parley_types::wire::ServerFrame;

use crate::registry::Registry;

/// Outcome of one routed send. `delivered` counts connections, not users:
/// a recipient with two live connections contributes two.
pub struct Delivery {
    pub delivered: usize,
    /// The exact frame every target connection received, for the sender echo.
    pub frame: Arc<str>,
}

/// Delivers direct and group messages to every live connection of the
/// recipient(s), exactly once per send.
#[derive(Clone)]
pub struct Router {
    registry: Registry,
    conversations: Conversations,
}

impl Router {
    pub fn new(registry: Registry, conversations: Conversations) -> Self {
        Self {
            registry,
            conversations,
        }
    }

    /// Deliver to one recipient. A recipient with no live connections is a
    /// zero-delivery send, not an error.
    pub async fn route_direct(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        recipient_id: &str,
    ) -> Delivery {
        let frame = build_message_frame(conversation_id, sender_id, content);
        let delivered = self.registry.send_to_user(recipient_id, frame.clone()).await;
        debug!(
            "dm {} -> {}: delivered to {} connection(s)",
            sender_id, recipient_id, delivered
        );
        Delivery { delivered, frame }
    }

    /// Deliver to every participant of the conversation except the sender.
    /// The participant list comes from the store before any registry lock is
    /// taken, so routing never blocks other connections on disk I/O.
    pub async fn route_group(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<Delivery> {
        let conversations = self.conversations.clone();
        let id = conversation_id.to_string();
        let participants =
            tokio::task::spawn_blocking(move || conversations.participants_of(&id))
                .await
                .map_err(|e| anyhow::anyhow!("participant lookup task failed: {e}"))??;
        let frame = build_message_frame(conversation_id, sender_id, content);

        let mut delivered = 0;
        for user_id in participants.iter().filter(|p| *p != sender_id) {
            delivered += self.registry.send_to_user(user_id, frame.clone()).await;
        }
        debug!(
            "group {} from {}: delivered to {} connection(s)",
            conversation_id, sender_id, delivered
        );
        Ok(Delivery { delivered, frame })
    }
}

/// Build the wire frame once per send; every target gets identical bytes.
fn build_message_frame(conversation_id: &str, sender_id: &str, content: &str) -> Arc<str> {
    let frame = ServerFrame::Message {
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        content: content.to_string(),
        timestamp: Utc::now(),
    };
    // serializing our own wire types cannot fail
    Arc::from(serde_json::to_string(&frame).unwrap().as_str())
}
