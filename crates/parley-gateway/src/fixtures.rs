use chrono::Utc;
use uuid::Uuid;

use parley_types::events::{ChatEvent, ConversationChange};
use parley_types::models::{Conversation, Message, Participant, UserSummary};

pub fn user(id: Uuid) -> UserSummary {
    UserSummary {
        id,
        username: None,
    }
}

pub fn conversation(members: &[Uuid]) -> Conversation {
    let now = Utc::now();
    Conversation {
        id: Uuid::new_v4(),
        participants: members
            .iter()
            .map(|id| Participant {
                id: Uuid::new_v4(),
                user: user(*id),
                has_seen_latest_message: false,
            })
            .collect(),
        latest_message: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn message(conversation_id: Uuid, sender: Uuid, body: &str) -> Message {
    Message {
        id: Uuid::new_v4(),
        conversation_id,
        sender: user(sender),
        body: body.to_string(),
        created_at: Utc::now(),
    }
}

pub fn updated(members: &[Uuid]) -> ChatEvent {
    ChatEvent::ConversationUpdated(ConversationChange {
        conversation: conversation(members),
    })
}
