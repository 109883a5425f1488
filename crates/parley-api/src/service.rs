//! Conversation and message state transitions.
//!
//! Each mutation runs as one store transaction and publishes its events while
//! the store's writer lock is still held, so events for a conversation leave
//! in commit order.

use std::sync::Arc;

use tracing::{debug, error, info};
use uuid::Uuid;

use parley_db::Database;
use parley_db::queries::{self, NewMessage, UsernameUpdate};
use parley_gateway::bus::EventBus;
use parley_types::api::{CreateUsernameResponse, SearchedUser};
use parley_types::error::{ChatError, ChatResult};
use parley_types::events::{ChatEvent, ConversationChange};
use parley_types::models::{Conversation, Message};

const MAX_USERNAME_LEN: usize = 32;

#[derive(Clone)]
pub struct ChatService {
    db: Arc<Database>,
    bus: EventBus,
}

fn require_caller(caller: Option<Uuid>) -> ChatResult<Uuid> {
    caller.ok_or_else(ChatError::unauthenticated)
}

/// Store failures are logged here; the caller only sees a generic message.
fn logged<T>(op: &str, result: ChatResult<T>) -> ChatResult<T> {
    if let Err(ChatError::Store(detail)) = &result {
        error!("{} failed and was rolled back: {}", op, detail);
    }
    result
}

impl ChatService {
    pub fn new(db: Arc<Database>, bus: EventBus) -> Self {
        Self { db, bus }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // -- Conversations --

    /// Conversations the caller participates in.
    pub fn list_conversations(&self, caller: Option<Uuid>) -> ChatResult<Vec<Conversation>> {
        let user_id = require_caller(caller)?;

        let candidates = logged(
            "list conversations",
            self.db.with_conn(|conn| Ok(queries::conversation_candidates(conn, user_id)?)),
        )?;

        // The store may hand back conversations the caller is not part of.
        Ok(candidates
            .into_iter()
            .filter(|conversation| conversation.has_participant(user_id))
            .collect())
    }

    pub fn create_conversation(&self, caller: Option<Uuid>, participant_ids: &[Uuid]) -> ChatResult<Uuid> {
        let creator_id = require_caller(caller)?;
        if participant_ids.is_empty() {
            return Err(ChatError::Validation("participantIds must not be empty".into()));
        }

        let conversation_id = Uuid::new_v4();
        logged(
            "create conversation",
            self.db.with_conn_mut(|conn| {
                let conversation =
                    queries::create_conversation(conn, conversation_id, creator_id, participant_ids)?;
                self.bus.publish(ChatEvent::ConversationCreated(conversation));
                Ok(())
            }),
        )?;

        info!("{} created conversation {}", creator_id, conversation_id);
        Ok(conversation_id)
    }

    /// Deletes the conversation with its participants and messages.
    /// Only a participant may delete.
    pub fn delete_conversation(&self, caller: Option<Uuid>, conversation_id: Uuid) -> ChatResult<bool> {
        let user_id = require_caller(caller)?;

        logged(
            "delete conversation",
            self.db.with_conn_mut(|conn| {
                let current = queries::load_conversation(conn, conversation_id)?
                    .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;
                if !current.has_participant(user_id) {
                    return Err(ChatError::Forbidden(format!(
                        "not a participant of conversation {}",
                        conversation_id
                    )));
                }

                let snapshot = queries::delete_conversation(conn, conversation_id)?;
                self.bus
                    .publish(ChatEvent::ConversationDeleted(ConversationChange { conversation: snapshot }));
                Ok(())
            }),
        )?;

        info!("{} deleted conversation {}", user_id, conversation_id);
        Ok(true)
    }

    /// Marks `user_id` as caught up. Deliberately publishes nothing.
    pub fn mark_conversation_as_read(
        &self,
        caller: Option<Uuid>,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> ChatResult<bool> {
        let caller_id = require_caller(caller)?;
        if caller_id != user_id {
            return Err(ChatError::Forbidden("cannot mark another user's read-state".into()));
        }

        logged(
            "mark conversation as read",
            self.db
                .with_conn(|conn| Ok(queries::mark_read(conn, user_id, conversation_id)?)),
        )?;

        debug!("{} read conversation {}", user_id, conversation_id);
        Ok(true)
    }

    // -- Messages --

    /// Appends a message, then publishes `MessageSent` and `ConversationUpdated`.
    pub fn send_message(
        &self,
        caller: Option<Uuid>,
        message_id: Uuid,
        sender_id: Uuid,
        conversation_id: Uuid,
        body: &str,
    ) -> ChatResult<bool> {
        let caller_id = require_caller(caller)?;
        if caller_id != sender_id {
            return Err(ChatError::Forbidden("cannot send as another user".into()));
        }
        if body.trim().is_empty() {
            return Err(ChatError::Validation("message body must not be empty".into()));
        }

        let new = NewMessage {
            id: message_id,
            sender_id,
            conversation_id,
            body,
        };

        logged(
            "send message",
            self.db.with_conn_mut(|conn| {
                let sent = queries::send_message(conn, &new)?;
                self.bus.publish(ChatEvent::MessageSent(sent.message));
                self.bus.publish(ChatEvent::ConversationUpdated(ConversationChange {
                    conversation: sent.conversation,
                }));
                Ok(())
            }),
        )?;

        debug!("{} sent {} to {}", sender_id, message_id, conversation_id);
        Ok(true)
    }

    /// Messages of a conversation the caller participates in, newest first.
    pub fn list_messages(&self, caller: Option<Uuid>, conversation_id: Uuid) -> ChatResult<Vec<Message>> {
        let user_id = require_caller(caller)?;

        logged(
            "list messages",
            self.db.with_conn(|conn| {
                let conversation = queries::load_conversation(conn, conversation_id)?
                    .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;
                if !conversation.has_participant(user_id) {
                    return Err(ChatError::Forbidden(format!(
                        "not a participant of conversation {}",
                        conversation_id
                    )));
                }
                Ok(queries::list_messages(conn, conversation_id)?)
            }),
        )
    }

    // -- Users --

    /// Sets the caller's handle. A taken handle is reported in the response
    /// rather than as an error.
    pub fn create_username(&self, caller: Option<Uuid>, username: &str) -> ChatResult<CreateUsernameResponse> {
        let user_id = require_caller(caller)?;
        let username = username.trim();
        if username.is_empty() {
            return Err(ChatError::Validation("username must not be empty".into()));
        }
        if username.chars().count() > MAX_USERNAME_LEN {
            return Err(ChatError::Validation(format!(
                "username must be at most {} characters",
                MAX_USERNAME_LEN
            )));
        }

        let outcome = logged(
            "create username",
            self.db
                .with_conn_mut(|conn| Ok(queries::set_username(conn, user_id, username)?)),
        )?;

        Ok(match outcome {
            UsernameUpdate::Updated => {
                info!("{} is now {}", user_id, username);
                CreateUsernameResponse {
                    success: Some(true),
                    error: None,
                }
            }
            UsernameUpdate::Taken => CreateUsernameResponse {
                success: None,
                error: Some("Username already taken. Please try another".into()),
            },
        })
    }

    pub fn search_users(&self, caller: Option<Uuid>, needle: &str) -> ChatResult<Vec<SearchedUser>> {
        let user_id = require_caller(caller)?;

        let users = logged(
            "search users",
            self.db
                .with_conn(|conn| Ok(queries::search_users(conn, needle, user_id)?)),
        )?;

        Ok(users
            .into_iter()
            .map(|user| SearchedUser {
                id: user.id,
                username: user.username,
            })
            .collect())
    }
}
