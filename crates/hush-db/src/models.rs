use hush_types::models::{ConversationStatus, UnmaskingStatus};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

pub struct WhisperRow {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub image_url: Option<String>,
    pub is_read: bool,
    pub conversation_id: Option<String>,
    pub created_at: String,
}

/// A whisper joined with its recipient's username, for the sender's outbox.
pub struct SentWhisperRow {
    pub whisper: WhisperRow,
    pub recipient_username: String,
}

#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: String,
    /// Sorted pair: `participant_a < participant_b`
    pub participant_a: String,
    pub participant_b: String,
    pub participant_key: String,
    pub initial_whisper_id: String,
    pub initial_sender_id: String,
    pub status: ConversationStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl ConversationRow {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participant_a == user_id || self.participant_b == user_id
    }

    /// The other participant, or `None` if `user_id` is not in the conversation.
    pub fn counterpart_of(&self, user_id: &str) -> Option<&str> {
        if self.participant_a == user_id {
            Some(&self.participant_b)
        } else if self.participant_b == user_id {
            Some(&self.participant_a)
        } else {
            None
        }
    }

    /// The participant who must ratify an echo request: the whisper's sender.
    pub fn ratifier(&self) -> &str {
        &self.initial_sender_id
    }
}

/// A conversation as listed for one participant.
pub struct ConversationSummaryRow {
    pub conversation: ConversationRow,
    pub last_read_message_id: Option<String>,
    /// Counterpart identity, only filled once unmasking completed.
    pub revealed_id: Option<String>,
    pub revealed_username: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub image_url: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct UnmaskingRequestRow {
    pub id: String,
    pub conversation_id: String,
    pub requester_id: String,
    pub target_id: String,
    pub status: UnmaskingStatus,
    pub created_at: String,
    pub responded_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Key derived from the sorted participant pair.
pub fn participant_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}
