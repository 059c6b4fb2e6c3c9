use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use hush_db::unmasking::{UnmaskingOutcome, UnmaskingState};
use hush_types::api::{Claims, RespondUnmaskingRequest, UnmaskingResultResponse, UnmaskingStatusResponse};
use hush_types::events::GatewayEvent;
use hush_types::models::UnmaskingStatus;

use crate::auth::{AppState, run_db};
use crate::convert;
use crate::error::ApiError;

pub async fn status(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let viewer = claims.sub.to_string();
    let user = viewer.clone();
    let view = run_db(&state, move |db| db.unmasking_status(&conversation_id.to_string(), &user)).await?;

    let requested_by_me = match &view.state {
        UnmaskingState::Pending { requester_id } => Some(*requester_id == viewer),
        _ => None,
    };
    Ok(Json(UnmaskingStatusResponse {
        conversation_id,
        state: view.state.phase(),
        requested_by_me,
        incoming_request_id: convert::opt_id(view.incoming_request_id.as_deref())?,
        outgoing_request_id: convert::opt_id(view.outgoing_request_id.as_deref())?,
        revealed: view.revealed.as_ref().map(convert::identity).transpose()?,
    }))
}

pub async fn request(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user = claims.sub.to_string();
    let outcome = run_db(&state, move |db| db.request_unmasking(&conversation_id.to_string(), &user)).await?;

    let event = match outcome.status {
        UnmaskingStatus::MutualPending => GatewayEvent::UnmaskingMutual { conversation_id },
        _ => GatewayEvent::UnmaskingRequested {
            conversation_id,
            request_id: convert::id(&outcome.request_id)?,
        },
    };
    state.notify(&outcome.counterpart_id, event).await;

    Ok((StatusCode::CREATED, Json(result_response(conversation_id, &outcome))))
}

pub async fn respond(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<RespondUnmaskingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = claims.sub.to_string();
    let responder = user.clone();
    let outcome = run_db(&state, move |db| {
        db.respond_to_unmasking(&request_id.to_string(), &user, req.accept)
    })
    .await?;

    let conversation_id = convert::id(&outcome.conversation_id)?;
    match outcome.status {
        UnmaskingStatus::Declined => {
            state
                .notify(&outcome.counterpart_id, GatewayEvent::UnmaskingDeclined { conversation_id })
                .await;
        }
        UnmaskingStatus::Accepted => {
            state
                .notify(&outcome.counterpart_id, GatewayEvent::UnmaskingAccepted { conversation_id })
                .await;
        }
        UnmaskingStatus::Completed => announce_completion(&state, conversation_id, &outcome, &responder).await?,
        _ => {}
    }

    Ok(Json(result_response(conversation_id, &outcome)))
}

pub async fn complete(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user = claims.sub.to_string();
    let caller = user.clone();
    let outcome = run_db(&state, move |db| db.complete_unmasking(&conversation_id.to_string(), &user)).await?;

    announce_completion(&state, conversation_id, &outcome, &caller).await?;
    Ok(Json(result_response(conversation_id, &outcome)))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user = claims.sub.to_string();
    run_db(&state, move |db| db.cancel_unmasking_request(&request_id.to_string(), &user)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Tell both participants who the other one is.
async fn announce_completion(
    state: &AppState,
    conversation_id: Uuid,
    outcome: &UnmaskingOutcome,
    caller: &str,
) -> Result<(), ApiError> {
    for viewer in [caller, outcome.counterpart_id.as_str()] {
        let Some(other) = outcome.revealed_to(viewer) else {
            continue;
        };
        let identity = convert::identity(other)?;
        state
            .notify(viewer, GatewayEvent::UnmaskingCompleted { conversation_id, identity })
            .await;
    }
    Ok(())
}

fn result_response(conversation_id: Uuid, outcome: &UnmaskingOutcome) -> UnmaskingResultResponse {
    UnmaskingResultResponse {
        conversation_id,
        status: outcome.status,
    }
}
