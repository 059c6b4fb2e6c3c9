use chrono::{DateTime, Utc};
use hush_types::models::ConversationStatus;
use rusqlite::Connection;
use tracing::info;
use uuid::Uuid;

use crate::models::{ConversationRow, MessageRow, WhisperRow, participant_key};
use crate::queries::{
    conversation_for_whisper, load_conversation, load_message, load_whisper, query_user_by_username,
};
use crate::{Database, ProtocolError, format_timestamp, now};

/// Result of a direct echo: the new conversation with its two seed messages.
pub struct EchoOutcome {
    pub conversation: ConversationRow,
    /// Synthesized from the whisper, timestamped 1 ms before `reply`.
    pub opening: MessageRow,
    pub reply: MessageRow,
}

/// Content of a whisper or message, already validated by the caller.
pub struct Content<'a> {
    pub text: &'a str,
    pub image_url: Option<&'a str>,
}

impl Database {
    // -- Whispers --

    pub fn send_whisper(
        &self,
        sender_id: &str,
        recipient_username: &str,
        content: &Content<'_>,
    ) -> Result<WhisperRow, ProtocolError> {
        self.with_tx(|tx| {
            let recipient =
                query_user_by_username(tx, recipient_username)?.ok_or(ProtocolError::NotFound("recipient"))?;
            if recipient.id == sender_id {
                return Err(ProtocolError::Validation("cannot whisper to yourself".into()));
            }

            let whisper = WhisperRow {
                id: Uuid::new_v4().to_string(),
                sender_id: sender_id.to_string(),
                recipient_id: recipient.id,
                content: content.text.to_string(),
                image_url: content.image_url.map(str::to_string),
                is_read: false,
                conversation_id: None,
                created_at: format_timestamp(now()),
            };
            tx.execute(
                "INSERT INTO whispers (id, sender_id, recipient_id, content, image_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    whisper.id,
                    whisper.sender_id,
                    whisper.recipient_id,
                    whisper.content,
                    whisper.image_url,
                    whisper.created_at
                ],
            )?;
            Ok(whisper)
        })
    }

    pub fn mark_whisper_read(&self, whisper_id: &str, user_id: &str) -> Result<(), ProtocolError> {
        self.with_tx(|tx| {
            let whisper = load_whisper(tx, whisper_id)?.ok_or(ProtocolError::NotFound("whisper"))?;
            if whisper.recipient_id != user_id {
                return Err(ProtocolError::Forbidden("only the recipient can mark a whisper read"));
            }
            tx.execute("UPDATE whispers SET is_read = 1 WHERE id = ?1", [whisper_id])?;
            Ok(())
        })
    }

    // -- Escalation --

    /// Reply directly to a whisper. The reply is the consent, so the
    /// conversation is born `Active` with the whisper and the reply as its
    /// first two messages.
    pub fn echo_whisper(
        &self,
        whisper_id: &str,
        requester_id: &str,
        reply: &Content<'_>,
    ) -> Result<EchoOutcome, ProtocolError> {
        let outcome = self.with_tx(|tx| {
            let whisper = claimable_whisper(tx, whisper_id, requester_id)?;

            let replied_at = now();
            // The opening message must sort strictly before the reply
            let opened_at = replied_at - chrono::Duration::milliseconds(1);

            let conversation =
                create_conversation(tx, &whisper, ConversationStatus::Active, replied_at)?;

            let opening = insert_message(
                tx,
                &conversation.id,
                &whisper.sender_id,
                &Content {
                    text: &whisper.content,
                    image_url: whisper.image_url.as_deref(),
                },
                opened_at,
            )?;
            let answer = insert_message(tx, &conversation.id, requester_id, reply, replied_at)?;

            attach_whisper(tx, &whisper.id, &conversation.id)?;
            tx.execute("UPDATE whispers SET is_read = 1 WHERE id = ?1", [&whisper.id])?;

            Ok(EchoOutcome {
                conversation,
                opening,
                reply: answer,
            })
        })?;

        info!(
            "Whisper {} echoed into active conversation {}",
            whisper_id, outcome.conversation.id
        );
        Ok(outcome)
    }

    /// Ask the whisper's sender to open a conversation. Nothing can be said
    /// until they accept.
    pub fn send_echo_request(
        &self,
        whisper_id: &str,
        requester_id: &str,
    ) -> Result<ConversationRow, ProtocolError> {
        let conversation = self.with_tx(|tx| {
            let whisper = claimable_whisper(tx, whisper_id, requester_id)?;
            let conversation =
                create_conversation(tx, &whisper, ConversationStatus::Initiated, now())?;
            attach_whisper(tx, &whisper.id, &conversation.id)?;
            Ok(conversation)
        })?;

        info!(
            "Echo request for whisper {} opened conversation {}",
            whisper_id, conversation.id
        );
        Ok(conversation)
    }

    pub fn accept_echo_request(
        &self,
        conversation_id: &str,
        responder_id: &str,
    ) -> Result<ConversationRow, ProtocolError> {
        self.decide_echo_request(conversation_id, responder_id, ConversationStatus::Active)
    }

    pub fn reject_echo_request(
        &self,
        conversation_id: &str,
        responder_id: &str,
    ) -> Result<ConversationRow, ProtocolError> {
        self.decide_echo_request(conversation_id, responder_id, ConversationStatus::Closed)
    }

    fn decide_echo_request(
        &self,
        conversation_id: &str,
        responder_id: &str,
        next: ConversationStatus,
    ) -> Result<ConversationRow, ProtocolError> {
        let conversation = self.with_tx(|tx| {
            let conversation =
                load_conversation(tx, conversation_id)?.ok_or(ProtocolError::NotFound("conversation"))?;
            if conversation.status != ConversationStatus::Initiated {
                return Err(ProtocolError::InvalidState(format!(
                    "conversation is {}, not initiated",
                    conversation.status.as_str()
                )));
            }
            if conversation.ratifier() != responder_id {
                return Err(ProtocolError::Forbidden("only the whisper's sender can answer an echo request"));
            }
            advance_status(tx, conversation, next)
        })?;

        info!(
            "Echo request on conversation {} answered: {}",
            conversation.id,
            conversation.status.as_str()
        );
        Ok(conversation)
    }

    /// Either participant may end an active conversation.
    pub fn close_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<ConversationRow, ProtocolError> {
        let conversation = self.with_tx(|tx| {
            let conversation =
                load_conversation(tx, conversation_id)?.ok_or(ProtocolError::NotFound("conversation"))?;
            if !conversation.has_participant(user_id) {
                return Err(ProtocolError::Forbidden("not a participant"));
            }
            if conversation.status != ConversationStatus::Active {
                return Err(ProtocolError::InvalidState(format!(
                    "conversation is {}, not active",
                    conversation.status.as_str()
                )));
            }
            advance_status(tx, conversation, ConversationStatus::Closed)
        })?;

        info!("Conversation {} closed", conversation.id);
        Ok(conversation)
    }

    // -- Messages --

    /// Append a message. Returns it with the id of the participant to notify.
    pub fn send_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &Content<'_>,
    ) -> Result<(MessageRow, String), ProtocolError> {
        self.with_tx(|tx| {
            let conversation =
                load_conversation(tx, conversation_id)?.ok_or(ProtocolError::NotFound("conversation"))?;
            let Some(counterpart) = conversation.counterpart_of(sender_id) else {
                return Err(ProtocolError::Forbidden("not a participant"));
            };
            if conversation.status != ConversationStatus::Active {
                return Err(ProtocolError::InvalidState(format!(
                    "conversation is {}, not active",
                    conversation.status.as_str()
                )));
            }

            let sent_at = now();
            let message = insert_message(tx, conversation_id, sender_id, content, sent_at)?;
            tx.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![format_timestamp(sent_at), conversation_id],
            )?;
            Ok((message, counterpart.to_string()))
        })
    }

    /// Move the caller's read marker to `message_id`.
    pub fn mark_conversation_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<(), ProtocolError> {
        self.with_tx(|tx| {
            let conversation =
                load_conversation(tx, conversation_id)?.ok_or(ProtocolError::NotFound("conversation"))?;
            if !conversation.has_participant(user_id) {
                return Err(ProtocolError::Forbidden("not a participant"));
            }
            let message = load_message(tx, message_id)?.ok_or(ProtocolError::NotFound("message"))?;
            if message.conversation_id != conversation_id {
                return Err(ProtocolError::Validation(
                    "message belongs to another conversation".into(),
                ));
            }
            tx.execute(
                "UPDATE conversation_participants SET last_read_message_id = ?1
                 WHERE conversation_id = ?2 AND user_id = ?3",
                [message_id, conversation_id, user_id],
            )?;
            Ok(())
        })
    }
}

/// Load a whisper the requester may escalate: it exists, they received it,
/// and nothing has escalated it yet.
fn claimable_whisper(
    conn: &Connection,
    whisper_id: &str,
    requester_id: &str,
) -> Result<WhisperRow, ProtocolError> {
    let whisper = load_whisper(conn, whisper_id)?.ok_or(ProtocolError::NotFound("whisper"))?;
    if whisper.recipient_id != requester_id {
        return Err(ProtocolError::Forbidden("only the recipient can escalate a whisper"));
    }
    if whisper.conversation_id.is_some() || conversation_for_whisper(conn, whisper_id)?.is_some() {
        return Err(ProtocolError::AlreadyExists("conversation for this whisper"));
    }
    Ok(whisper)
}

fn create_conversation(
    conn: &Connection,
    whisper: &WhisperRow,
    status: ConversationStatus,
    at: DateTime<Utc>,
) -> Result<ConversationRow, ProtocolError> {
    let (a, b) = if whisper.sender_id < whisper.recipient_id {
        (&whisper.sender_id, &whisper.recipient_id)
    } else {
        (&whisper.recipient_id, &whisper.sender_id)
    };
    let created_at = format_timestamp(at);

    let conversation = ConversationRow {
        id: Uuid::new_v4().to_string(),
        participant_a: a.clone(),
        participant_b: b.clone(),
        participant_key: participant_key(a, b),
        initial_whisper_id: whisper.id.clone(),
        initial_sender_id: whisper.sender_id.clone(),
        status,
        created_at: created_at.clone(),
        updated_at: created_at,
    };

    conn.execute(
        "INSERT INTO conversations
            (id, participant_a, participant_b, participant_key, initial_whisper_id,
             initial_sender_id, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            conversation.id,
            conversation.participant_a,
            conversation.participant_b,
            conversation.participant_key,
            conversation.initial_whisper_id,
            conversation.initial_sender_id,
            conversation.status.as_str(),
            conversation.created_at,
            conversation.updated_at
        ],
    )?;

    for user_id in [&conversation.participant_a, &conversation.participant_b] {
        conn.execute(
            "INSERT INTO conversation_participants (conversation_id, user_id, status, joined_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![conversation.id, user_id, status.as_str(), conversation.created_at],
        )?;
    }

    Ok(conversation)
}

/// Patch the whisper's conversation link. It may only ever be set once.
fn attach_whisper(conn: &Connection, whisper_id: &str, conversation_id: &str) -> Result<(), ProtocolError> {
    let updated = conn.execute(
        "UPDATE whispers SET conversation_id = ?1 WHERE id = ?2 AND conversation_id IS NULL",
        [conversation_id, whisper_id],
    )?;
    if updated != 1 {
        return Err(ProtocolError::AlreadyExists("conversation for this whisper"));
    }
    Ok(())
}

/// Move a conversation and both participant rows forward to `next`.
fn advance_status(
    conn: &Connection,
    mut conversation: ConversationRow,
    next: ConversationStatus,
) -> Result<ConversationRow, ProtocolError> {
    if !conversation.status.can_advance_to(next) {
        return Err(ProtocolError::InvalidState(format!(
            "cannot move conversation from {} to {}",
            conversation.status.as_str(),
            next.as_str()
        )));
    }

    let updated_at = format_timestamp(now());
    conn.execute(
        "UPDATE conversations SET status = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![next.as_str(), updated_at, conversation.id],
    )?;
    conn.execute(
        "UPDATE conversation_participants SET status = ?1 WHERE conversation_id = ?2",
        rusqlite::params![next.as_str(), conversation.id],
    )?;

    conversation.status = next;
    conversation.updated_at = updated_at;
    Ok(conversation)
}

fn insert_message(
    conn: &Connection,
    conversation_id: &str,
    sender_id: &str,
    content: &Content<'_>,
    at: DateTime<Utc>,
) -> Result<MessageRow, ProtocolError> {
    let message = MessageRow {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        content: content.text.to_string(),
        image_url: content.image_url.map(str::to_string),
        created_at: format_timestamp(at),
    };
    conn.execute(
        "INSERT INTO messages (id, conversation_id, sender_id, content, image_url, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            message.id,
            message.conversation_id,
            message.sender_id,
            message.content,
            message.image_url,
            message.created_at
        ],
    )?;
    Ok(message)
}
