use std::collections::{HashMap, HashSet};

use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;
use uuid::Uuid;

use parley_types::models::{Conversation, Message, Participant, User};
use parley_types::read_state;

use crate::models::{now_text, timestamp_at, user_summary_at, uuid_at};
use crate::{Database, DbError, DbResult};

/// Input for [`send_message`]. The id is chosen by the client.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub conversation_id: Uuid,
    pub body: &'a str,
}

/// Result of a committed [`send_message`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message: Message,
    /// The conversation as of the commit, with refreshed read-states.
    pub conversation: Conversation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsernameUpdate {
    Updated,
    /// Another user already holds the handle.
    Taken,
}

const MESSAGE_COLUMNS: &str = "m.id, m.conversation_id, m.sender_id, u.username, m.body, m.created_at
     FROM messages m
     JOIN users u ON u.id = m.sender_id";

// -- Users --

pub fn create_user(conn: &Connection, id: Uuid, username: Option<&str>) -> DbResult<()> {
    conn.execute(
        "INSERT INTO users (id, username, created_at) VALUES (?1, ?2, ?3)",
        params![id.to_string(), username, now_text()],
    )?;
    Ok(())
}

pub fn get_user(conn: &Connection, id: Uuid) -> DbResult<Option<User>> {
    let user = conn
        .query_row(
            "SELECT id, username, created_at FROM users WHERE id = ?1",
            [id.to_string()],
            map_user,
        )
        .optional()?;
    Ok(user)
}

/// Sets `user_id`'s handle, creating the user row if it does not exist yet.
pub fn set_username(conn: &mut Connection, user_id: Uuid, username: &str) -> DbResult<UsernameUpdate> {
    let tx = conn.transaction()?;

    let holder: Option<String> = tx
        .query_row("SELECT id FROM users WHERE username = ?1", [username], |row| row.get(0))
        .optional()?;
    if let Some(holder) = holder {
        if holder != user_id.to_string() {
            return Ok(UsernameUpdate::Taken);
        }
    }

    tx.execute(
        "INSERT INTO users (id, username, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET username = excluded.username",
        params![user_id.to_string(), username, now_text()],
    )?;
    tx.commit()?;

    Ok(UsernameUpdate::Updated)
}

/// Case-insensitive substring search over handles, excluding `exclude_id`.
pub fn search_users(conn: &Connection, needle: &str, exclude_id: Uuid) -> DbResult<Vec<User>> {
    let mut stmt = conn.prepare(
        "SELECT id, username, created_at FROM users
         WHERE username IS NOT NULL
           AND id != ?2
           AND instr(lower(username), lower(?1)) > 0
         ORDER BY username",
    )?;

    let users = stmt
        .query_map(params![needle, exclude_id.to_string()], map_user)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(users)
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: uuid_at(row, 0)?,
        username: row.get(1)?,
        created_at: timestamp_at(row, 2)?,
    })
}

// -- Conversations --

/// Creates a conversation with one participant row per distinct id.
/// The whole insert rolls back if any row fails (unknown user, duplicate id).
pub fn create_conversation(
    conn: &mut Connection,
    id: Uuid,
    creator_id: Uuid,
    participant_ids: &[Uuid],
) -> DbResult<Conversation> {
    let tx = conn.transaction()?;
    let now = now_text();

    tx.execute(
        "INSERT INTO conversations (id, latest_message_id, created_at, updated_at) VALUES (?1, NULL, ?2, ?2)",
        params![id.to_string(), now],
    )?;

    let mut seen = HashSet::new();
    for user_id in participant_ids.iter().filter(|uid| seen.insert(**uid)) {
        tx.execute(
            "INSERT INTO conversation_participants
                (id, conversation_id, user_id, has_seen_latest_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                id.to_string(),
                user_id.to_string(),
                read_state::on_create(*user_id, creator_id),
                now,
            ],
        )?;
    }

    let conversation = load_conversation(&tx, id)?
        .ok_or_else(|| DbError::NotFound(format!("conversation {}", id)))?;
    tx.commit()?;

    debug!("Created conversation {} with {} participants", id, seen.len());
    Ok(conversation)
}

/// Loads one conversation with participants and latest message resolved.
pub fn load_conversation(conn: &Connection, id: Uuid) -> DbResult<Option<Conversation>> {
    let row = conn
        .query_row(
            "SELECT id, latest_message_id, created_at, updated_at FROM conversations WHERE id = ?1",
            [id.to_string()],
            map_conversation_row,
        )
        .optional()?;

    let Some(row) = row else {
        return Ok(None);
    };

    let participants = load_participants(conn, Some(id))?
        .remove(&id)
        .unwrap_or_default();

    Ok(Some(populate(conn, row, participants)?))
}

/// Candidate conversations for `user_id`.
///
/// This may return a superset of the user's conversations: callers must keep
/// only those where [`Conversation::has_participant`] holds. Membership is not
/// pushed into the query.
pub fn conversation_candidates(conn: &Connection, user_id: Uuid) -> DbResult<Vec<Conversation>> {
    let mut stmt = conn.prepare(
        "SELECT id, latest_message_id, created_at, updated_at FROM conversations
         ORDER BY updated_at DESC",
    )?;
    let rows = stmt
        .query_map([], map_conversation_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut participants = load_participants(conn, None)?;

    let conversations = rows
        .into_iter()
        .map(|row| {
            let members = participants.remove(&row.id).unwrap_or_default();
            populate(conn, row, members)
        })
        .collect::<DbResult<Vec<_>>>()?;

    debug!("{} candidate conversations for {}", conversations.len(), user_id);
    Ok(conversations)
}

/// Deletes a conversation with all of its participants and messages in one
/// transaction. Returns the populated snapshot taken before deletion.
pub fn delete_conversation(conn: &mut Connection, id: Uuid) -> DbResult<Conversation> {
    let tx = conn.transaction()?;

    let snapshot = load_conversation(&tx, id)?
        .ok_or_else(|| DbError::NotFound(format!("conversation {}", id)))?;

    let cid = id.to_string();
    tx.execute("UPDATE conversations SET latest_message_id = NULL WHERE id = ?1", [&cid])?;
    tx.execute("DELETE FROM messages WHERE conversation_id = ?1", [&cid])?;
    tx.execute("DELETE FROM conversation_participants WHERE conversation_id = ?1", [&cid])?;
    tx.execute("DELETE FROM conversations WHERE id = ?1", [&cid])?;
    tx.commit()?;

    debug!("Deleted conversation {}", id);
    Ok(snapshot)
}

struct ConversationRow {
    id: Uuid,
    latest_message_id: Option<Uuid>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

fn map_conversation_row(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    let latest_message_id = match row.get::<_, Option<String>>(1)? {
        Some(_) => Some(uuid_at(row, 1)?),
        None => None,
    };
    Ok(ConversationRow {
        id: uuid_at(row, 0)?,
        latest_message_id,
        created_at: timestamp_at(row, 2)?,
        updated_at: timestamp_at(row, 3)?,
    })
}

fn populate(conn: &Connection, row: ConversationRow, participants: Vec<Participant>) -> DbResult<Conversation> {
    let latest_message = match row.latest_message_id {
        Some(message_id) => load_message(conn, message_id)?,
        None => None,
    };

    Ok(Conversation {
        id: row.id,
        participants,
        latest_message,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

/// Participants grouped by conversation id, in creation order.
fn load_participants(
    conn: &Connection,
    conversation_id: Option<Uuid>,
) -> DbResult<HashMap<Uuid, Vec<Participant>>> {
    let mut stmt = conn.prepare(
        "SELECT p.conversation_id, p.id, p.user_id, u.username, p.has_seen_latest_message
         FROM conversation_participants p
         JOIN users u ON u.id = p.user_id
         WHERE ?1 IS NULL OR p.conversation_id = ?1
         ORDER BY p.rowid",
    )?;

    let rows = stmt.query_map([conversation_id.map(|id| id.to_string())], |row| {
        Ok((
            uuid_at(row, 0)?,
            Participant {
                id: uuid_at(row, 1)?,
                user: user_summary_at(row, 2)?,
                has_seen_latest_message: row.get(4)?,
            },
        ))
    })?;

    let mut grouped: HashMap<Uuid, Vec<Participant>> = HashMap::new();
    for row in rows {
        let (cid, participant) = row?;
        grouped.entry(cid).or_default().push(participant);
    }
    Ok(grouped)
}

// -- Read-state --

/// Marks `user_id` as caught up in `conversation_id`.
pub fn mark_read(conn: &Connection, user_id: Uuid, conversation_id: Uuid) -> DbResult<()> {
    let updated = conn.execute(
        "UPDATE conversation_participants SET has_seen_latest_message = ?3
         WHERE user_id = ?1 AND conversation_id = ?2",
        params![user_id.to_string(), conversation_id.to_string(), read_state::on_read()],
    )?;

    if updated == 0 {
        return Err(DbError::NotFound(format!(
            "participant {} in conversation {}",
            user_id, conversation_id
        )));
    }
    Ok(())
}

// -- Messages --

/// Appends a message and moves the conversation's read-states forward.
///
/// The message is inserted before the sender's membership is checked; a
/// sender without a participant row rolls the insert back.
pub fn send_message(conn: &mut Connection, new: &NewMessage<'_>) -> DbResult<SentMessage> {
    let tx = conn.transaction()?;
    let cid = new.conversation_id.to_string();
    let now = now_text();

    let exists: Option<i64> = tx
        .query_row("SELECT 1 FROM conversations WHERE id = ?1", [&cid], |row| row.get(0))
        .optional()?;
    if exists.is_none() {
        return Err(DbError::NotFound(format!("conversation {}", new.conversation_id)));
    }

    let inserted = tx.execute(
        "INSERT INTO messages (id, conversation_id, sender_id, body, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![new.id.to_string(), cid, new.sender_id.to_string(), new.body, now],
    );
    match inserted {
        Ok(_) => {}
        // The conversation exists, so only the sender reference can fail:
        // a sender with no user row has no participant row either.
        Err(e) if is_foreign_key_violation(&e) => return Err(sender_not_participant(new)),
        Err(e) => return Err(e.into()),
    }

    let sender_row: Option<String> = tx
        .query_row(
            "SELECT id FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2",
            params![cid, new.sender_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    if sender_row.is_none() {
        // Dropping `tx` rolls back the message insert.
        return Err(sender_not_participant(new));
    }

    tx.execute(
        "UPDATE conversations SET latest_message_id = ?2, updated_at = ?3 WHERE id = ?1",
        params![cid, new.id.to_string(), now],
    )?;

    let members = {
        let mut stmt = tx.prepare(
            "SELECT id, user_id FROM conversation_participants WHERE conversation_id = ?1",
        )?;
        let rows = stmt
            .query_map([&cid], |row| Ok((row.get::<_, String>(0)?, uuid_at(row, 1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    for (participant_id, user_id) in &members {
        tx.execute(
            "UPDATE conversation_participants SET has_seen_latest_message = ?2 WHERE id = ?1",
            params![participant_id, read_state::on_message(*user_id, new.sender_id)],
        )?;
    }

    let message = load_message(&tx, new.id)?
        .ok_or_else(|| DbError::NotFound(format!("message {}", new.id)))?;
    let conversation = load_conversation(&tx, new.conversation_id)?
        .ok_or_else(|| DbError::NotFound(format!("conversation {}", new.conversation_id)))?;
    tx.commit()?;

    debug!(
        "Message {} committed to {} ({} participants)",
        new.id,
        new.conversation_id,
        members.len()
    );
    Ok(SentMessage { message, conversation })
}

fn sender_not_participant(new: &NewMessage<'_>) -> DbError {
    DbError::NotFound(format!(
        "participant {} in conversation {}",
        new.sender_id, new.conversation_id
    ))
}

fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

pub fn load_message(conn: &Connection, id: Uuid) -> DbResult<Option<Message>> {
    let sql = format!("SELECT {} WHERE m.id = ?1", MESSAGE_COLUMNS);
    let message = conn.query_row(&sql, [id.to_string()], map_message).optional()?;
    Ok(message)
}

/// Messages of a conversation, newest first.
pub fn list_messages(conn: &Connection, conversation_id: Uuid) -> DbResult<Vec<Message>> {
    let sql = format!(
        "SELECT {} WHERE m.conversation_id = ?1 ORDER BY m.created_at DESC, m.rowid DESC",
        MESSAGE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;

    let messages = stmt
        .query_map([conversation_id.to_string()], map_message)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(messages)
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: uuid_at(row, 0)?,
        conversation_id: uuid_at(row, 1)?,
        sender: user_summary_at(row, 2)?,
        body: row.get(4)?,
        created_at: timestamp_at(row, 5)?,
    })
}

/// Row counts for one conversation: (conversations, participants, messages).
pub fn footprint(conn: &Connection, conversation_id: Uuid) -> DbResult<(i64, i64, i64)> {
    let cid = conversation_id.to_string();
    let count = |sql: &str| -> DbResult<i64> { Ok(conn.query_row(sql, [&cid], |row| row.get(0))?) };
    Ok((
        count("SELECT COUNT(*) FROM conversations WHERE id = ?1")?,
        count("SELECT COUNT(*) FROM conversation_participants WHERE conversation_id = ?1")?,
        count("SELECT COUNT(*) FROM messages WHERE conversation_id = ?1")?,
    ))
}

impl Database {
    // -- Users --

    pub fn create_user(&self, id: Uuid, username: Option<&str>) -> DbResult<()> {
        self.with_conn(|conn| create_user(conn, id, username))
    }

    pub fn get_user(&self, id: Uuid) -> DbResult<Option<User>> {
        self.with_conn(|conn| get_user(conn, id))
    }

    // -- Conversations --

    pub fn get_conversation(&self, id: Uuid) -> DbResult<Option<Conversation>> {
        self.with_conn(|conn| load_conversation(conn, id))
    }

    pub fn get_messages(&self, conversation_id: Uuid) -> DbResult<Vec<Message>> {
        self.with_conn(|conn| list_messages(conn, conversation_id))
    }

    pub fn footprint(&self, conversation_id: Uuid) -> DbResult<(i64, i64, i64)> {
        self.with_conn(|conn| footprint(conn, conversation_id))
    }
}
