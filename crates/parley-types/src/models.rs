use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// `None` until the user picks a handle.
    pub username: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The slice of a user embedded in participants and messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: Option<String>,
}

/// Membership and read-state of one user within one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: Uuid,
    pub user: UserSummary,
    pub has_seen_latest_message: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender: UserSummary,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A conversation with its participants and latest message resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub participants: Vec<Participant>,
    pub latest_message: Option<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: Uuid) -> bool {
        is_participant(&self.participants, user_id)
    }

    pub fn participant(&self, user_id: Uuid) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user.id == user_id)
    }
}

/// True if `user_id` appears among `participants`.
pub fn is_participant(participants: &[Participant], user_id: Uuid) -> bool {
    participants.iter().any(|p| p.user.id == user_id)
}
