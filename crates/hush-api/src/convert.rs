use chrono::{DateTime, Utc};
use uuid::Uuid;

use hush_db::models::{ConversationSummaryRow, MessageRow};
use hush_db::unmasking::RevealedUser;
use hush_types::api::{ConversationResponse, MessageResponse};
use hush_types::models::{ConversationStatus, RevealedIdentity};

use crate::error::ApiError;

/// Stored ids are text; a malformed one is an internal error.
pub(crate) fn id(raw: &str) -> Result<Uuid, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::internal(format!("bad stored id '{}': {}", raw, e)))
}

pub(crate) fn opt_id(raw: Option<&str>) -> Result<Option<Uuid>, ApiError> {
    raw.map(id).transpose()
}

pub(crate) fn timestamp(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    hush_db::parse_timestamp(raw).ok_or_else(|| ApiError::internal(format!("bad stored timestamp '{}'", raw)))
}

pub(crate) fn identity(user: &RevealedUser) -> Result<RevealedIdentity, ApiError> {
    Ok(RevealedIdentity {
        user_id: id(&user.user_id)?,
        username: user.username.clone(),
    })
}

pub(crate) fn message(row: &MessageRow, viewer: &str) -> Result<MessageResponse, ApiError> {
    Ok(MessageResponse {
        id: id(&row.id)?,
        conversation_id: id(&row.conversation_id)?,
        from_me: row.sender_id == viewer,
        content: row.content.clone(),
        image_url: row.image_url.clone(),
        created_at: timestamp(&row.created_at)?,
    })
}

pub(crate) fn conversation(row: &ConversationSummaryRow, viewer: &str) -> Result<ConversationResponse, ApiError> {
    let c = &row.conversation;
    let counterpart = match (&row.revealed_id, &row.revealed_username) {
        (Some(user_id), Some(username)) => Some(RevealedIdentity {
            user_id: id(user_id)?,
            username: username.clone(),
        }),
        _ => None,
    };
    Ok(ConversationResponse {
        id: id(&c.id)?,
        status: c.status,
        initial_whisper_id: id(&c.initial_whisper_id)?,
        started_by_me: c.initial_sender_id == viewer,
        awaiting_my_decision: c.status == ConversationStatus::Initiated && c.ratifier() == viewer,
        counterpart,
        last_read_message_id: opt_id(row.last_read_message_id.as_deref())?,
        created_at: timestamp(&c.created_at)?,
        updated_at: timestamp(&c.updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hush_db::models::ConversationRow;

    fn summary(status: ConversationStatus) -> ConversationSummaryRow {
        let (a, b) = (Uuid::new_v4().to_string(), Uuid::new_v4().to_string());
        let (a, b) = if a < b { (a, b) } else { (b, a) };
        ConversationSummaryRow {
            conversation: ConversationRow {
                id: Uuid::new_v4().to_string(),
                participant_key: hush_db::models::participant_key(&a, &b),
                initial_whisper_id: Uuid::new_v4().to_string(),
                initial_sender_id: a.clone(),
                participant_a: a,
                participant_b: b,
                status,
                created_at: "2026-03-01T10:00:00.000Z".into(),
                updated_at: "2026-03-01T10:05:00.000Z".into(),
            },
            last_read_message_id: None,
            revealed_id: None,
            revealed_username: None,
        }
    }

    #[test]
    fn echo_request_awaits_the_whisper_sender() {
        let row = summary(ConversationStatus::Initiated);
        let sender = row.conversation.initial_sender_id.clone();
        let recipient = row.conversation.participant_b.clone();

        let for_sender = conversation(&row, &sender).unwrap();
        assert!(for_sender.started_by_me);
        assert!(for_sender.awaiting_my_decision);

        let for_recipient = conversation(&row, &recipient).unwrap();
        assert!(!for_recipient.started_by_me);
        assert!(!for_recipient.awaiting_my_decision);
        assert!(for_recipient.counterpart.is_none());
    }

    #[test]
    fn counterpart_shown_once_revealed() {
        let mut row = summary(ConversationStatus::Active);
        let viewer = row.conversation.participant_a.clone();
        row.revealed_id = Some(row.conversation.participant_b.clone());
        row.revealed_username = Some("bob".into());

        let response = conversation(&row, &viewer).unwrap();
        assert_eq!(response.counterpart.unwrap().username, "bob");
        assert!(!response.awaiting_my_decision);
    }

    #[test]
    fn corrupt_ids_are_internal_errors() {
        assert!(id("not-a-uuid").is_err());
        assert!(timestamp("yesterday").is_err());
        assert_eq!(opt_id(None).unwrap(), None);
    }
}
