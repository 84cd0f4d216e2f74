use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use parley_core::{AuthOutcome, ChatError, RegisterOutcome};
use parley_types::wire::{
    ConversationSummary, CreateConversationArgs, ErrorCode, LoginArgs, LogoutArgs,
    ParticipantArgs, RegisterArgs, SendDmArgs, SendGroupArgs, ServerFrame,
};

use crate::context::Context;
use crate::framing::{FrameReader, FrameWriter};
use crate::registry::{ConnectionHandle, Outbound};

enum Flow {
    Continue,
    Terminate,
}

/// Drive one client connection: read frames, dispatch commands, tear down
/// exactly once on exit, error, or peer disconnect. A failure here never
/// reaches the listener or any other connection's handler.
pub async fn handle_connection<S>(stream: S, ctx: Context)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    let (handle, mut rx) = ctx.registry.new_handle();
    let conn_id = handle.id();
    ctx.registry.track(handle.clone()).await;

    // Single writer task per connection: everything queued on the handle
    // goes out in queue order, so a routed message and a command response
    // can never interleave their bytes.
    let writer_task = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Frame(frame) => {
                    if writer.write_frame(&frame).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => break,
            }
        }
        let _ = writer.close().await;
    });

    let mut conn = Connection {
        ctx,
        handle,
        user_id: None,
        token: None,
    };

    loop {
        let frame = match reader.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!("connection {}: read failed: {}", conn_id, e);
                break;
            }
        };
        if frame.is_empty() {
            continue;
        }
        match conn.dispatch(&frame).await {
            Flow::Continue => {}
            Flow::Terminate => break,
        }
    }

    conn.teardown().await;
    let _ = writer_task.await;
    debug!("connection {} closed", conn_id);
}

/// Per-connection protocol state. `user_id` doubles as the state flag:
/// `None` is Unauthenticated, `Some` is Authenticated.
struct Connection {
    ctx: Context,
    handle: ConnectionHandle,
    user_id: Option<String>,
    token: Option<String>,
}

impl Connection {
    async fn dispatch(&mut self, raw: &str) -> Flow {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(_) => {
                self.send_error(ErrorCode::InvalidProtocol, "frame is not valid JSON");
                return Flow::Continue;
            }
        };
        let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_owned) else {
            self.send_error(ErrorCode::InvalidProtocol, "missing 'type' field");
            return Flow::Continue;
        };

        match kind.as_str() {
            "register" => self.handle_register(value).await,
            "login" => self.handle_login(value).await,
            "logout" => return self.handle_logout(value).await,
            "7ekey" => self.send(&ServerFrame::Mekey),
            "get_conversations" => self.handle_get_conversations().await,
            "create_conversation" => self.handle_create_conversation(value).await,
            "add_participant" => self.handle_add_participant(value).await,
            "remove_participant" => self.handle_remove_participant(value).await,
            "send_dm" => self.handle_send_dm(value).await,
            "send_group" => self.handle_send_group(value).await,
            "exit" => {
                self.send(&ServerFrame::ExitResponse { success: true });
                return Flow::Terminate;
            }
            other => {
                self.send_error(
                    ErrorCode::UnknownCommand,
                    format!("unknown command type: {other}"),
                );
            }
        }
        Flow::Continue
    }

    async fn handle_register(&mut self, value: Value) {
        let Some(args) = self.decode::<RegisterArgs>(value) else {
            return;
        };
        let sessions = self.ctx.sessions.clone();
        // argon2 hashing is CPU-heavy; keep it off the async runtime
        let outcome = tokio::task::spawn_blocking(move || {
            sessions.register(
                &args.username,
                &args.password,
                &args.display_name,
                args.email.as_deref().unwrap_or(""),
            )
        })
        .await;

        match outcome {
            Ok(Ok(RegisterOutcome::Created { user_id })) => {
                self.send(&ServerFrame::RegisterResponse {
                    success: true,
                    user_id: Some(user_id),
                    message: None,
                });
            }
            Ok(Ok(RegisterOutcome::Rejected { message })) => {
                self.send(&ServerFrame::RegisterResponse {
                    success: false,
                    user_id: None,
                    message: Some(message),
                });
            }
            Ok(Err(e)) => self.send_chat_error(e),
            Err(e) => {
                error!("register task failed: {e}");
                self.send_error(ErrorCode::ServerError, "internal failure");
            }
        }
    }

    async fn handle_login(&mut self, value: Value) {
        let Some(args) = self.decode::<LoginArgs>(value) else {
            return;
        };
        let sessions = self.ctx.sessions.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            sessions.authenticate(&args.username, &args.password, args.device.as_deref())
        })
        .await;

        match outcome {
            Ok(Ok(AuthOutcome::Granted { user_id, token })) => {
                // A re-login on an already authenticated connection swaps
                // its registry entry to the new identity.
                if let Some(previous) = self.user_id.replace(user_id.clone()) {
                    self.ctx.registry.unregister(&previous, self.handle.id()).await;
                }
                self.ctx.registry.register(&user_id, self.handle.clone()).await;
                self.token = Some(token.clone());
                info!("connection {} authenticated as {}", self.handle.id(), user_id);

                self.send(&ServerFrame::LoginResponse {
                    success: true,
                    user_id: Some(user_id),
                    session_token: Some(token),
                    message: None,
                });
            }
            Ok(Ok(AuthOutcome::Rejected { message })) => {
                self.send(&ServerFrame::LoginResponse {
                    success: false,
                    user_id: None,
                    session_token: None,
                    message: Some(message),
                });
            }
            Ok(Err(e)) => self.send_chat_error(e),
            Err(e) => {
                error!("login task failed: {e}");
                self.send_error(ErrorCode::ServerError, "internal failure");
            }
        }
    }

    async fn handle_logout(&mut self, value: Value) -> Flow {
        let Some(args) = self.decode::<LogoutArgs>(value) else {
            return Flow::Continue;
        };

        let outcome = match (args.username, self.token.take()) {
            (Some(username), _) => {
                let sessions = self.ctx.sessions.clone();
                tokio::task::spawn_blocking(move || sessions.end_sessions_for_username(&username))
                    .await
            }
            (None, Some(token)) => {
                let sessions = self.ctx.sessions.clone();
                tokio::task::spawn_blocking(move || sessions.end_session(&token)).await
            }
            (None, None) => {
                self.send_error(ErrorCode::InvalidArgs, "'username' required");
                return Flow::Continue;
            }
        };

        match outcome {
            Ok(Ok(success)) => {
                self.send(&ServerFrame::LogoutResponse { success });
                Flow::Terminate
            }
            Ok(Err(e)) => {
                self.send_chat_error(e);
                Flow::Terminate
            }
            Err(e) => {
                error!("logout task failed: {e}");
                self.send_error(ErrorCode::ServerError, "internal failure");
                Flow::Terminate
            }
        }
    }

    async fn handle_get_conversations(&self) {
        let Some(user_id) = self.require_auth() else {
            return;
        };
        let conversations = self.ctx.conversations.clone();
        let outcome =
            tokio::task::spawn_blocking(move || conversations.for_user(&user_id)).await;
        match outcome {
            Ok(Ok(rows)) => {
                let conversations = rows
                    .into_iter()
                    .map(|row| ConversationSummary {
                        id: row.id,
                        name: row.name,
                        is_group: row.is_group,
                    })
                    .collect();
                self.send(&ServerFrame::ConversationsResponse { conversations });
            }
            Ok(Err(e)) => self.send_chat_error(e),
            Err(e) => {
                error!("conversation list task failed: {e}");
                self.send_error(ErrorCode::ServerError, "internal failure");
            }
        }
    }

    async fn handle_create_conversation(&self, value: Value) {
        let Some(creator) = self.require_auth() else {
            return;
        };
        let Some(args) = self.decode::<CreateConversationArgs>(value) else {
            return;
        };

        let db = self.ctx.db.clone();
        let conversations = self.ctx.conversations.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            if let Some(other_username) = args.other_username {
                match db.user_by_username(&other_username) {
                    Ok(Some(other)) => conversations.create_one_on_one(&creator, &other.id),
                    Ok(None) => {
                        Err(ChatError::invalid(format!("user not found: {other_username}")))
                    }
                    Err(e) => Err(e.into()),
                }
            } else if let (Some(name), Some(participants)) = (args.name, args.participants) {
                resolve_group_members(&db, &creator, &participants)
                    .and_then(|members| conversations.create_group(&name, &members))
            } else {
                Err(ChatError::invalid(
                    "provide 'otherUsername' for 1:1 or 'name' and 'participants' for group",
                ))
            }
        })
        .await;

        match outcome {
            Ok(Ok(conversation)) => self.send(&ServerFrame::CreateConversationResponse {
                success: true,
                conversation_id: conversation.id,
            }),
            Ok(Err(e)) => self.send_chat_error(e),
            Err(e) => {
                error!("create conversation task failed: {e}");
                self.send_error(ErrorCode::ServerError, "internal failure");
            }
        }
    }

    async fn handle_add_participant(&self, value: Value) {
        let Some(_) = self.require_auth() else {
            return;
        };
        let Some(args) = self.decode::<ParticipantArgs>(value) else {
            return;
        };
        let conversations = self.ctx.conversations.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            conversations.add_participant(&args.conversation_id, &args.user_id)
        })
        .await;
        match outcome {
            Ok(Ok(())) => self.send(&ServerFrame::AddParticipantResponse { success: true }),
            Ok(Err(e)) => self.send_chat_error(e),
            Err(e) => {
                error!("add participant task failed: {e}");
                self.send_error(ErrorCode::ServerError, "internal failure");
            }
        }
    }

    async fn handle_remove_participant(&self, value: Value) {
        let Some(_) = self.require_auth() else {
            return;
        };
        let Some(args) = self.decode::<ParticipantArgs>(value) else {
            return;
        };
        let conversations = self.ctx.conversations.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            conversations.remove_participant(&args.conversation_id, &args.user_id)
        })
        .await;
        match outcome {
            Ok(Ok(())) => self.send(&ServerFrame::RemoveParticipantResponse { success: true }),
            Ok(Err(e)) => self.send_chat_error(e),
            Err(e) => {
                error!("remove participant task failed: {e}");
                self.send_error(ErrorCode::ServerError, "internal failure");
            }
        }
    }

    /// send_dm carries its own senderId and is deliberately not auth-gated,
    /// matching the wire contract the existing clients rely on.
    async fn handle_send_dm(&mut self, value: Value) {
        let Some(args) = self.decode::<SendDmArgs>(value) else {
            return;
        };
        let delivery = self
            .ctx
            .router
            .route_direct(
                &args.conversation_id,
                &args.sender_id,
                &args.content,
                &args.recipient_id,
            )
            .await;

        if delivery.delivered > 0 {
            // echo the identical frame back to the sender
            self.handle.send(delivery.frame);
        } else {
            self.send(&ServerFrame::MessageResponse {
                success: false,
                message: args.content,
            });
        }
    }

    async fn handle_send_group(&mut self, value: Value) {
        let Some(_) = self.require_auth() else {
            return;
        };
        let Some(args) = self.decode::<SendGroupArgs>(value) else {
            return;
        };
        match self
            .ctx
            .router
            .route_group(&args.conversation_id, &args.sender_id, &args.content)
            .await
        {
            Ok(delivery) if delivery.delivered > 0 => {
                self.handle.send(delivery.frame);
            }
            Ok(_) => {
                self.send(&ServerFrame::MessageResponse {
                    success: false,
                    message: args.content,
                });
            }
            Err(e) => self.send_chat_error(e),
        }
    }

    /// Runs exactly once per connection, whichever way the read loop ended:
    /// detach from the registry, end the session, release the write path.
    async fn teardown(mut self) {
        let conn_id = self.handle.id();
        if let Some(user_id) = self.user_id.take() {
            self.ctx.registry.unregister(&user_id, conn_id).await;
        }
        if let Some(token) = self.token.take() {
            let sessions = self.ctx.sessions.clone();
            match tokio::task::spawn_blocking(move || sessions.end_session(&token)).await {
                Ok(Err(e)) => warn!("failed to end session during teardown: {e}"),
                Err(e) => warn!("teardown task failed: {e}"),
                Ok(Ok(_)) => {}
            }
        }
        self.ctx.registry.untrack(conn_id).await;
        self.handle.close();
    }

    fn require_auth(&self) -> Option<String> {
        if self.user_id.is_none() {
            self.send_error(ErrorCode::NotAuthenticated, "must be logged in");
        }
        self.user_id.clone()
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, value: Value) -> Option<T> {
        match serde_json::from_value(value) {
            Ok(args) => Some(args),
            Err(e) => {
                self.send_error(ErrorCode::InvalidArgs, e.to_string());
                None
            }
        }
    }

    fn send(&self, frame: &ServerFrame) {
        self.handle.send_frame(frame);
    }

    fn send_error(&self, code: ErrorCode, message: impl Into<String>) {
        self.send(&ServerFrame::error(code, message));
    }

    fn send_chat_error(&self, e: ChatError) {
        match e {
            ChatError::Invalid(message) => self.send_error(ErrorCode::InvalidArgs, message),
            ChatError::Storage(e) => {
                error!("storage failure: {e:#}");
                self.send_error(ErrorCode::ServerError, "storage failure");
            }
        }
    }
}

/// Map the comma-separated username list to user ids, creator first.
fn resolve_group_members(
    db: &parley_db::Database,
    creator: &str,
    participants: &str,
) -> Result<Vec<String>, ChatError> {
    let mut members = vec![creator.to_string()];
    for username in participants.split(',').map(str::trim).filter(|u| !u.is_empty()) {
        match db.user_by_username(username)? {
            Some(user) => members.push(user.id),
            None => return Err(ChatError::invalid(format!("user not found: {username}"))),
        }
    }
    Ok(members)
}
