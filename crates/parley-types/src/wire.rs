use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error codes carried in the `{"type":"error"}` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidProtocol,
    UnknownCommand,
    InvalidArgs,
    NotAuthenticated,
    ServerError,
}

/// One conversation entry in a `conversations_response` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub name: String,
    #[serde(rename = "isGroup")]
    pub is_group: bool,
}

/// Frames sent from server to client. Every frame is one newline-delimited
/// JSON object tagged by its `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    RegisterResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    LoginResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    LogoutResponse {
        success: bool,
    },
    ConversationsResponse {
        conversations: Vec<ConversationSummary>,
    },
    CreateConversationResponse {
        success: bool,
        conversation_id: String,
    },
    AddParticipantResponse {
        success: bool,
    },
    RemoveParticipantResponse {
        success: bool,
    },
    /// A routed chat message, delivered to every live connection of the
    /// recipient(s) and echoed to the sender.
    Message {
        conversation_id: String,
        sender_id: String,
        content: String,
        timestamp: DateTime<Utc>,
    },
    /// Emitted in place of the echo when a send reached zero connections.
    MessageResponse {
        success: bool,
        message: String,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    /// Answer to the `7ekey` liveness ping.
    Mekey,
    ExitResponse {
        success: bool,
    },
    /// Pushed to every connection when the server shuts down.
    ServerClosed,
}

impl ServerFrame {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

// -- Request payloads --
//
// Inbound frames are dispatched on their `type` string first, then the
// remaining fields are decoded into one of these per-command structs. A
// decode failure means a required field is missing (`invalid_args`), which
// keeps it distinct from an unknown `type` (`unknown_command`).

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterArgs {
    pub username: String,
    pub password: String,
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginArgs {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub device: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogoutArgs {
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationArgs {
    /// 1:1 form: the other user's username.
    #[serde(default)]
    pub other_username: Option<String>,
    /// Group form: conversation name plus comma-separated usernames.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub participants: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantArgs {
    pub conversation_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendDmArgs {
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub recipient_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendGroupArgs {
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
}
