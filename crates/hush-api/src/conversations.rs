use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use hush_db::models::ConversationRow;
use hush_types::api::{
    Claims, ConversationIdResponse, ConversationResponse, MarkReadRequest, MessageResponse, SendMessageRequest,
};
use hush_types::events::GatewayEvent;

use crate::auth::{AppState, run_db};
use crate::convert;
use crate::error::ApiError;
use crate::validate;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor: the id of the oldest message of the previous page.
    pub before: Option<Uuid>,
}

fn default_limit() -> u32 {
    50
}

pub async fn list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user = claims.sub.to_string();
    let viewer = user.clone();
    let rows = run_db(&state, move |db| Ok(db.list_conversations(&user)?)).await?;

    let conversations = rows
        .iter()
        .map(|row| convert::conversation(row, &viewer))
        .collect::<Result<Vec<ConversationResponse>, _>>()?;
    Ok(Json(conversations))
}

pub async fn accept(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user = claims.sub.to_string();
    let caller = user.clone();
    let conversation = run_db(&state, move |db| {
        db.accept_echo_request(&conversation_id.to_string(), &user)
    })
    .await?;

    notify_counterpart(&state, &conversation, &caller, GatewayEvent::ConversationActivated { conversation_id })
        .await;
    Ok(Json(status_response(conversation_id, &conversation)))
}

pub async fn reject(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user = claims.sub.to_string();
    let caller = user.clone();
    let conversation = run_db(&state, move |db| {
        db.reject_echo_request(&conversation_id.to_string(), &user)
    })
    .await?;

    notify_counterpart(&state, &conversation, &caller, GatewayEvent::ConversationClosed { conversation_id })
        .await;
    Ok(Json(status_response(conversation_id, &conversation)))
}

pub async fn close(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user = claims.sub.to_string();
    let caller = user.clone();
    let conversation = run_db(&state, move |db| {
        db.close_conversation(&conversation_id.to_string(), &user)
    })
    .await?;

    notify_counterpart(&state, &conversation, &caller, GatewayEvent::ConversationClosed { conversation_id })
        .await;
    Ok(Json(status_response(conversation_id, &conversation)))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<MessageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user = claims.sub.to_string();
    let viewer = user.clone();
    let limit = query.limit.clamp(1, 200);
    let before = query.before.map(|id| id.to_string());

    let rows = run_db(&state, move |db| {
        db.get_messages(&conversation_id.to_string(), &user, limit, before.as_deref())
    })
    .await?;

    let messages = rows
        .iter()
        .map(|row| convert::message(row, &viewer))
        .collect::<Result<Vec<MessageResponse>, _>>()?;
    Ok(Json(messages))
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = validate::content(&req.content, req.image_url.as_deref(), state.max_content_len)?;
    let user = claims.sub.to_string();
    let viewer = user.clone();

    let (message, counterpart) = run_db(&state, move |db| {
        db.send_message(&conversation_id.to_string(), &user, &content.as_content())
    })
    .await?;

    let response = convert::message(&message, &viewer)?;
    state
        .notify(
            &counterpart,
            GatewayEvent::MessageCreate {
                id: response.id,
                conversation_id,
                content: response.content.clone(),
                image_url: response.image_url.clone(),
                timestamp: response.created_at,
            },
        )
        .await;

    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = claims.sub.to_string();
    run_db(&state, move |db| {
        db.mark_conversation_read(&conversation_id.to_string(), &user, &req.message_id.to_string())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

fn status_response(conversation_id: Uuid, conversation: &ConversationRow) -> ConversationIdResponse {
    ConversationIdResponse {
        conversation_id,
        status: conversation.status,
    }
}

async fn notify_counterpart(state: &AppState, conversation: &ConversationRow, caller: &str, event: GatewayEvent) {
    if let Some(other) = conversation.counterpart_of(caller) {
        state.notify(other, event).await;
    }
}
