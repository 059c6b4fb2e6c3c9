use crate::models::{
    ConversationRow, ConversationSummaryRow, MessageRow, SentWhisperRow, UnmaskingRequestRow,
    UserRow, WhisperRow,
};
use crate::{Database, ProtocolError};
use anyhow::Result;
use hush_types::models::{ConversationStatus, UnmaskingStatus};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};

const WHISPER_COLUMNS: &str =
    "w.id, w.sender_id, w.recipient_id, w.content, w.image_url, w.is_read, w.conversation_id, w.created_at";

const CONVERSATION_COLUMNS: &str = "c.id, c.participant_a, c.participant_b, c.participant_key, \
     c.initial_whisper_id, c.initial_sender_id, c.status, c.created_at, c.updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, content, image_url, created_at";

const UNMASKING_COLUMNS: &str =
    "id, conversation_id, requester_id, target_id, status, created_at, responded_at, completed_at";

impl Database {
    // -- Users --

    /// Insert a user. A taken username is `AlreadyExists`, also when two
    /// registrations race for it.
    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> std::result::Result<(), ProtocolError> {
        let created_at = crate::format_timestamp(crate::now());
        self.with_tx(|tx| {
            if query_user_by_username(tx, username)?.is_some() {
                return Err(ProtocolError::AlreadyExists("username"));
            }
            tx.execute(
                "INSERT INTO users (id, username, password, created_at) VALUES (?1, ?2, ?3, ?4)",
                (id, username, password_hash, &created_at),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| Ok(query_user_by_username(conn, username)?))
    }

    // -- Whispers --

    /// Whispers received by `user_id`, newest first.
    pub fn list_inbox(&self, user_id: &str, limit: u32) -> Result<Vec<WhisperRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {WHISPER_COLUMNS} FROM whispers w
                 WHERE w.recipient_id = ?1
                 ORDER BY w.created_at DESC, w.rowid DESC
                 LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit], map_whisper)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Whispers sent by `user_id` with their recipients, newest first.
    pub fn list_sent(&self, user_id: &str, limit: u32) -> Result<Vec<SentWhisperRow>> {
        self.with_conn(|conn| {
            // JOIN users to fetch the recipient username in a single query
            let sql = format!(
                "SELECT {WHISPER_COLUMNS}, u.username FROM whispers w
                 JOIN users u ON u.id = w.recipient_id
                 WHERE w.sender_id = ?1
                 ORDER BY w.created_at DESC, w.rowid DESC
                 LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit], |row| {
                    Ok(SentWhisperRow {
                        whisper: map_whisper(row)?,
                        recipient_username: row.get(8)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Conversations --

    /// Conversations `user_id` takes part in, most recently updated first.
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummaryRow>> {
        self.with_conn(|conn| {
            // Completed unmasking rows always come in pairs
            let sql = format!(
                "SELECT {CONVERSATION_COLUMNS}, p.last_read_message_id, cu.id, cu.username,
                        (SELECT COUNT(*) FROM unmasking_requests ur
                          WHERE ur.conversation_id = c.id AND ur.status = 'completed') AS revealed
                 FROM conversations c
                 JOIN conversation_participants p ON p.conversation_id = c.id AND p.user_id = ?1
                 LEFT JOIN users cu ON cu.id = CASE WHEN c.participant_a = ?1
                                                    THEN c.participant_b ELSE c.participant_a END
                 ORDER BY c.updated_at DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id], |row| {
                    let revealed: i64 = row.get(12)?;
                    let (revealed_id, revealed_username) = if revealed >= 2 {
                        (row.get(10)?, row.get(11)?)
                    } else {
                        (None, None)
                    };
                    Ok(ConversationSummaryRow {
                        conversation: map_conversation(row)?,
                        last_read_message_id: row.get(9)?,
                        revealed_id,
                        revealed_username,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    /// One page of a conversation, oldest first. `before` is the id of the
    /// oldest message of the previous page; paging follows
    /// `(created_at, rowid)` so messages sharing a millisecond are not skipped.
    pub fn get_messages(
        &self,
        conversation_id: &str,
        user_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> std::result::Result<Vec<MessageRow>, ProtocolError> {
        self.with_conn(|conn| {
            let conversation =
                load_conversation(conn, conversation_id)?.ok_or(ProtocolError::NotFound("conversation"))?;
            if !conversation.has_participant(user_id) {
                return Err(ProtocolError::Forbidden("not a participant"));
            }
            if let Some(cursor) = before {
                let cursor = load_message(conn, cursor)?.ok_or(ProtocolError::NotFound("message"))?;
                if cursor.conversation_id != conversation_id {
                    return Err(ProtocolError::Validation(
                        "cursor message belongs to another conversation".into(),
                    ));
                }
            }
            let mut rows = query_messages(conn, conversation_id, limit, before)?;
            rows.reverse();
            Ok(rows)
        })
    }
}

// -- Row loaders, shared with the protocol transactions --

pub(crate) fn query_user_by_username(conn: &Connection, username: &str) -> rusqlite::Result<Option<UserRow>> {
    conn.query_row(
        "SELECT id, username, password, created_at FROM users WHERE username = ?1",
        [username],
        map_user,
    )
    .optional()
}

pub(crate) fn query_user_by_id(conn: &Connection, id: &str) -> rusqlite::Result<Option<UserRow>> {
    conn.query_row(
        "SELECT id, username, password, created_at FROM users WHERE id = ?1",
        [id],
        map_user,
    )
    .optional()
}

pub(crate) fn load_whisper(conn: &Connection, id: &str) -> rusqlite::Result<Option<WhisperRow>> {
    conn.query_row(
        &format!("SELECT {WHISPER_COLUMNS} FROM whispers w WHERE w.id = ?1"),
        [id],
        map_whisper,
    )
    .optional()
}

pub(crate) fn load_conversation(conn: &Connection, id: &str) -> rusqlite::Result<Option<ConversationRow>> {
    conn.query_row(
        &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1"),
        [id],
        map_conversation,
    )
    .optional()
}

pub(crate) fn conversation_for_whisper(conn: &Connection, whisper_id: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT id FROM conversations WHERE initial_whisper_id = ?1",
        [whisper_id],
        |row| row.get(0),
    )
    .optional()
}

pub(crate) fn load_message(conn: &Connection, id: &str) -> rusqlite::Result<Option<MessageRow>> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
        [id],
        map_message,
    )
    .optional()
}

pub(crate) fn query_messages(
    conn: &Connection,
    conversation_id: &str,
    limit: u32,
    before: Option<&str>,
) -> rusqlite::Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE conversation_id = ?1
           AND (?2 IS NULL
                OR (created_at, rowid) < (SELECT created_at, rowid FROM messages WHERE id = ?2))
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?3"
    ))?;
    stmt.query_map(rusqlite::params![conversation_id, before, limit], map_message)?
        .collect::<std::result::Result<Vec<_>, _>>()
}

pub(crate) fn load_unmasking_rows(
    conn: &Connection,
    conversation_id: &str,
) -> rusqlite::Result<Vec<UnmaskingRequestRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {UNMASKING_COLUMNS} FROM unmasking_requests
         WHERE conversation_id = ?1
         ORDER BY created_at, rowid"
    ))?;
    stmt.query_map([conversation_id], map_unmasking)?
        .collect::<std::result::Result<Vec<_>, _>>()
}

pub(crate) fn load_unmasking_request(
    conn: &Connection,
    id: &str,
) -> rusqlite::Result<Option<UnmaskingRequestRow>> {
    conn.query_row(
        &format!("SELECT {UNMASKING_COLUMNS} FROM unmasking_requests WHERE id = ?1"),
        [id],
        map_unmasking,
    )
    .optional()
}

// -- Row mapping --

fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        password: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn map_whisper(row: &Row<'_>) -> rusqlite::Result<WhisperRow> {
    Ok(WhisperRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        recipient_id: row.get(2)?,
        content: row.get(3)?,
        image_url: row.get(4)?,
        is_read: row.get(5)?,
        conversation_id: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn map_conversation(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        participant_a: row.get(1)?,
        participant_b: row.get(2)?,
        participant_key: row.get(3)?,
        initial_whisper_id: row.get(4)?,
        initial_sender_id: row.get(5)?,
        status: status_column(row, 6, ConversationStatus::parse)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        image_url: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn map_unmasking(row: &Row<'_>) -> rusqlite::Result<UnmaskingRequestRow> {
    Ok(UnmaskingRequestRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        requester_id: row.get(2)?,
        target_id: row.get(3)?,
        status: status_column(row, 4, UnmaskingStatus::parse)?,
        created_at: row.get(5)?,
        responded_at: row.get(6)?,
        completed_at: row.get(7)?,
    })
}

/// Read a TEXT status column into its closed enum.
fn status_column<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("unknown status '{}'", raw).into())
    })
}
