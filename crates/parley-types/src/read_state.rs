//! Participant "has seen latest message" transitions.
//!
//! The store applies these inside its transactions so every write path agrees
//! on the same rules.

use uuid::Uuid;

/// Initial read-state of a participant row at conversation creation.
/// Only the creator starts caught up.
pub fn on_create(user_id: Uuid, creator_id: Uuid) -> bool {
    user_id == creator_id
}

/// Read-state of a participant row after `sender_id` commits a new message.
pub fn on_message(user_id: Uuid, sender_id: Uuid) -> bool {
    user_id == sender_id
}

/// Read-state after an explicit acknowledgement. Always caught up.
pub fn on_read() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creator_starts_read_others_unread() {
        let creator = Uuid::new_v4();
        let other = Uuid::new_v4();
        assert!(on_create(creator, creator));
        assert!(!on_create(other, creator));
    }

    #[test]
    fn send_marks_only_sender_read() {
        let sender = Uuid::new_v4();
        let others: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        assert!(on_message(sender, sender));
        for other in others {
            assert!(!on_message(other, sender));
        }
    }
}
