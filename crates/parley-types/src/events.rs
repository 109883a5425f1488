use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Conversation, Message, Participant};

/// Named event channels on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    ConversationCreated,
    ConversationUpdated,
    ConversationDeleted,
    MessageSent,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::ConversationCreated,
        Topic::ConversationUpdated,
        Topic::ConversationDeleted,
        Topic::MessageSent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConversationCreated => "ConversationCreated",
            Self::ConversationUpdated => "ConversationUpdated",
            Self::ConversationDeleted => "ConversationDeleted",
            Self::MessageSent => "MessageSent",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationChange {
    pub conversation: Conversation,
}

/// Payloads published by the chat service after a transaction commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChatEvent {
    /// A conversation and its initial participants were created
    ConversationCreated(Conversation),

    /// A new message changed the latest message and participant read-states
    ConversationUpdated(ConversationChange),

    /// Snapshot of a conversation taken just before it was deleted
    ConversationDeleted(ConversationChange),

    /// A new message was committed
    MessageSent(Message),
}

impl ChatEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::ConversationCreated(_) => Topic::ConversationCreated,
            Self::ConversationUpdated(_) => Topic::ConversationUpdated,
            Self::ConversationDeleted(_) => Topic::ConversationDeleted,
            Self::MessageSent(_) => Topic::MessageSent,
        }
    }

    /// Participants of the affected conversation.
    /// `MessageSent` carries none; it is matched by conversation id instead.
    pub fn participants(&self) -> Option<&[Participant]> {
        match self {
            Self::ConversationCreated(conversation) => Some(conversation.participants.as_slice()),
            Self::ConversationUpdated(change) | Self::ConversationDeleted(change) => {
                Some(change.conversation.participants.as_slice())
            }
            Self::MessageSent(_) => None,
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        match self {
            Self::ConversationCreated(conversation) => conversation.id,
            Self::ConversationUpdated(change) | Self::ConversationDeleted(change) => {
                change.conversation.id
            }
            Self::MessageSent(message) => message.conversation_id,
        }
    }
}

/// Commands sent FROM client TO server over the gateway WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Open a subscription session on a topic.
    /// `conversation_id` is required for `MessageSent` and ignored otherwise.
    Subscribe {
        topic: Topic,
        #[serde(default, rename = "conversationId")]
        conversation_id: Option<Uuid>,
    },

    /// Close the session on a topic
    Unsubscribe { topic: Topic },
}

/// Frames sent FROM server TO client over the gateway WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Connection accepted; `user_id` is `None` for anonymous sockets
    Ready {
        #[serde(rename = "userId")]
        user_id: Option<Uuid>,
    },

    Subscribed { topic: Topic },

    Unsubscribed { topic: Topic },

    /// An event that passed the session's authorization filter
    Event { topic: Topic, payload: ChatEvent },

    Error { message: String },
}
