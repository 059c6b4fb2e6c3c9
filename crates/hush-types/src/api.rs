use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationStatus, RevealedIdentity, UnmaskingPhase, UnmaskingStatus};

// -- JWT Claims --

/// JWT claims shared across hush-api (REST middleware) and hush-gateway
/// (WebSocket authentication).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Whispers --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendWhisperRequest {
    pub recipient_username: String,
    pub content: String,
    pub image_url: Option<String>,
}

/// A whisper as seen by its recipient. The sender is never exposed.
#[derive(Debug, Serialize)]
pub struct InboxWhisperResponse {
    pub id: Uuid,
    pub content: String,
    pub image_url: Option<String>,
    pub is_read: bool,
    pub conversation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SentWhisperResponse {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub recipient_username: String,
    pub content: String,
    pub image_url: Option<String>,
    pub is_read: bool,
    pub conversation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct WhisperCreatedResponse {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

// -- Escalation --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EchoWhisperRequest {
    pub content: String,
    pub image_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EchoResponse {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ConversationIdResponse {
    pub conversation_id: Uuid,
    pub status: ConversationStatus,
}

/// A conversation from the caller's point of view.
#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub id: Uuid,
    pub status: ConversationStatus,
    pub initial_whisper_id: Uuid,
    /// True when the caller sent the whisper this conversation grew from.
    pub started_by_me: bool,
    /// True when an echo request is waiting on the caller's accept/reject.
    pub awaiting_my_decision: bool,
    /// Only present once unmasking has completed.
    pub counterpart: Option<RevealedIdentity>,
    pub last_read_message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
    pub image_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub from_me: bool,
    pub content: String,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarkReadRequest {
    pub message_id: Uuid,
}

// -- Unmasking --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RespondUnmaskingRequest {
    pub accept: bool,
}

/// Result of a state-changing unmasking call.
#[derive(Debug, Serialize)]
pub struct UnmaskingResultResponse {
    pub conversation_id: Uuid,
    pub status: UnmaskingStatus,
}

#[derive(Debug, Serialize)]
pub struct UnmaskingStatusResponse {
    pub conversation_id: Uuid,
    pub state: UnmaskingPhase,
    /// Set for `pending`: whether the caller is the one who asked.
    pub requested_by_me: Option<bool>,
    /// An inbound request the caller can respond to, if any.
    pub incoming_request_id: Option<Uuid>,
    /// The caller's own live request, if any.
    pub outgoing_request_id: Option<Uuid>,
    /// Only present when `state` is `completed`.
    pub revealed: Option<RevealedIdentity>,
}
