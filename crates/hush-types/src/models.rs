use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a conversation escalated from a whisper.
///
/// Transitions only move forward: `Initiated -> Active -> Closed`,
/// `Initiated -> Closed`, or a conversation is born `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    /// Echo requested, waiting for the original whisper sender to decide
    Initiated,
    /// Both sides may exchange messages
    Active,
    /// Terminal
    Closed,
}

impl ConversationStatus {
    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Initiated => "initiated",
            ConversationStatus::Active => "active",
            ConversationStatus::Closed => "closed",
        }
    }

    /// Parse from database string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initiated" => Some(ConversationStatus::Initiated),
            "active" => Some(ConversationStatus::Active),
            "closed" => Some(ConversationStatus::Closed),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` is a legal forward step.
    pub fn can_advance_to(&self, next: ConversationStatus) -> bool {
        matches!(
            (self, next),
            (ConversationStatus::Initiated, ConversationStatus::Active)
                | (ConversationStatus::Initiated, ConversationStatus::Closed)
                | (ConversationStatus::Active, ConversationStatus::Closed)
        )
    }
}

/// Status of a single directed unmasking request row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmaskingStatus {
    Pending,
    MutualPending,
    Accepted,
    Declined,
    Completed,
}

impl UnmaskingStatus {
    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            UnmaskingStatus::Pending => "pending",
            UnmaskingStatus::MutualPending => "mutual_pending",
            UnmaskingStatus::Accepted => "accepted",
            UnmaskingStatus::Declined => "declined",
            UnmaskingStatus::Completed => "completed",
        }
    }

    /// Parse from database string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UnmaskingStatus::Pending),
            "mutual_pending" => Some(UnmaskingStatus::MutualPending),
            "accepted" => Some(UnmaskingStatus::Accepted),
            "declined" => Some(UnmaskingStatus::Declined),
            "completed" => Some(UnmaskingStatus::Completed),
            _ => None,
        }
    }

    /// Pending, MutualPending and Accepted rows are still in flight.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            UnmaskingStatus::Pending | UnmaskingStatus::MutualPending | UnmaskingStatus::Accepted
        )
    }
}

/// Unmasking phase of a whole conversation as shown to a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmaskingPhase {
    None,
    Pending,
    MutualPending,
    ReadyToComplete,
    Completed,
    Declined,
}

/// Identity handed to each side once unmasking completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealedIdentity {
    pub user_id: Uuid,
    pub username: String,
}
