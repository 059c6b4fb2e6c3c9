use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use hush_types::api::{
    Claims, ConversationIdResponse, EchoResponse, EchoWhisperRequest, InboxWhisperResponse,
    SendWhisperRequest, SentWhisperResponse, WhisperCreatedResponse,
};
use hush_types::events::GatewayEvent;

use crate::auth::{AppState, run_db};
use crate::convert;
use crate::error::ApiError;
use crate::validate;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

pub async fn send_whisper(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendWhisperRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = validate::content(&req.content, req.image_url.as_deref(), state.max_content_len)?;
    let sender = claims.sub.to_string();
    let recipient = req.recipient_username.trim().to_string();

    let whisper = run_db(&state, move |db| {
        db.send_whisper(&sender, &recipient, &content.as_content())
    })
    .await?;

    let id = convert::id(&whisper.id)?;
    let created_at = convert::timestamp(&whisper.created_at)?;
    state
        .notify(
            &whisper.recipient_id,
            GatewayEvent::WhisperReceived {
                whisper_id: id,
                timestamp: created_at,
            },
        )
        .await;

    Ok((StatusCode::CREATED, Json(WhisperCreatedResponse { id, created_at })))
}

pub async fn inbox(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user = claims.sub.to_string();
    let limit = query.limit.min(200);
    let rows = run_db(&state, move |db| Ok(db.list_inbox(&user, limit)?)).await?;

    let whispers = rows
        .iter()
        .map(|row| -> Result<InboxWhisperResponse, ApiError> {
            Ok(InboxWhisperResponse {
                id: convert::id(&row.id)?,
                content: row.content.clone(),
                image_url: row.image_url.clone(),
                is_read: row.is_read,
                conversation_id: convert::opt_id(row.conversation_id.as_deref())?,
                created_at: convert::timestamp(&row.created_at)?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(whispers))
}

pub async fn sent(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user = claims.sub.to_string();
    let limit = query.limit.min(200);
    let rows = run_db(&state, move |db| Ok(db.list_sent(&user, limit)?)).await?;

    let whispers = rows
        .iter()
        .map(|row| -> Result<SentWhisperResponse, ApiError> {
            let w = &row.whisper;
            Ok(SentWhisperResponse {
                id: convert::id(&w.id)?,
                recipient_id: convert::id(&w.recipient_id)?,
                recipient_username: row.recipient_username.clone(),
                content: w.content.clone(),
                image_url: w.image_url.clone(),
                is_read: w.is_read,
                conversation_id: convert::opt_id(w.conversation_id.as_deref())?,
                created_at: convert::timestamp(&w.created_at)?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(whispers))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(whisper_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user = claims.sub.to_string();
    run_db(&state, move |db| db.mark_whisper_read(&whisper_id.to_string(), &user)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Reply directly: the conversation opens active with the whisper and the
/// reply as its first two messages.
pub async fn echo(
    State(state): State<AppState>,
    Path(whisper_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EchoWhisperRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let reply = validate::content(&req.content, req.image_url.as_deref(), state.max_content_len)?;
    let user = claims.sub.to_string();

    let outcome = run_db(&state, move |db| {
        db.echo_whisper(&whisper_id.to_string(), &user, &reply.as_content())
    })
    .await?;

    let conversation_id = convert::id(&outcome.conversation.id)?;
    let reply = &outcome.reply;
    let whisper_sender = outcome.conversation.ratifier().to_string();
    state
        .notify(&whisper_sender, GatewayEvent::ConversationActivated { conversation_id })
        .await;
    state
        .notify(
            &whisper_sender,
            GatewayEvent::MessageCreate {
                id: convert::id(&reply.id)?,
                conversation_id,
                content: reply.content.clone(),
                image_url: reply.image_url.clone(),
                timestamp: convert::timestamp(&reply.created_at)?,
            },
        )
        .await;

    Ok((
        StatusCode::CREATED,
        Json(EchoResponse {
            conversation_id,
            message_id: convert::id(&reply.id)?,
        }),
    ))
}

/// Ask the whisper's sender for a conversation instead of replying.
pub async fn echo_request(
    State(state): State<AppState>,
    Path(whisper_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user = claims.sub.to_string();
    let conversation = run_db(&state, move |db| db.send_echo_request(&whisper_id.to_string(), &user)).await?;

    let conversation_id = convert::id(&conversation.id)?;
    state
        .notify(
            conversation.ratifier(),
            GatewayEvent::EchoRequested {
                conversation_id,
                whisper_id,
            },
        )
        .await;

    Ok((
        StatusCode::CREATED,
        Json(ConversationIdResponse {
            conversation_id,
            status: conversation.status,
        }),
    ))
}
