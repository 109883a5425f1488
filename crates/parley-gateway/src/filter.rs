//! Per-session authorization predicate.

use uuid::Uuid;

use parley_types::error::{ChatError, ChatResult};
use parley_types::events::{ChatEvent, Topic};
use parley_types::models::is_participant;

/// Decides whether a published event may reach one session's client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    /// Admit events whose conversation lists the caller as a participant.
    Participant { caller: Option<Uuid> },

    /// Admit events for exactly one conversation. The caller proved
    /// membership when it obtained the id.
    Conversation { conversation_id: Uuid },
}

impl EventFilter {
    /// The filter a subscription to `topic` runs with.
    pub fn for_topic(
        topic: Topic,
        caller: Option<Uuid>,
        conversation_id: Option<Uuid>,
    ) -> ChatResult<Self> {
        match topic {
            Topic::MessageSent => conversation_id
                .map(|conversation_id| Self::Conversation { conversation_id })
                .ok_or_else(|| {
                    ChatError::Validation("MessageSent subscriptions need a conversationId".into())
                }),
            Topic::ConversationCreated | Topic::ConversationUpdated | Topic::ConversationDeleted => {
                Ok(Self::Participant { caller })
            }
        }
    }

    /// `Err` only when the caller has no identity; the error concerns this
    /// one event, never the stream it arrived on.
    pub fn admits(&self, event: &ChatEvent) -> ChatResult<bool> {
        match self {
            Self::Participant { caller } => {
                let caller = caller.ok_or_else(ChatError::unauthenticated)?;
                Ok(event
                    .participants()
                    .is_some_and(|participants| is_participant(participants, caller)))
            }
            Self::Conversation { conversation_id } => Ok(event.conversation_id() == *conversation_id),
        }
    }
}
