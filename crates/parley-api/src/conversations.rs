use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use parley_types::api::{CreateConversationRequest, CreateConversationResponse, SuccessResponse};

use crate::error::ApiResult;
use crate::middleware::Caller;
use crate::state::AppState;

// Store calls are blocking; each handler runs its service call off the
// async runtime.

pub async fn list_conversations(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> ApiResult<impl IntoResponse> {
    let conversations = tokio::task::spawn_blocking(move || state.service.list_conversations(caller)).await??;
    Ok(Json(conversations))
}

pub async fn create_conversation(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(req): Json<CreateConversationRequest>,
) -> ApiResult<impl IntoResponse> {
    let conversation_id = tokio::task::spawn_blocking(move || {
        state.service.create_conversation(caller, &req.participant_ids)
    })
    .await??;

    Ok((StatusCode::CREATED, Json(CreateConversationResponse { conversation_id })))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Caller(caller): Caller,
) -> ApiResult<impl IntoResponse> {
    let success =
        tokio::task::spawn_blocking(move || state.service.delete_conversation(caller, conversation_id))
            .await??;
    Ok(Json(SuccessResponse { success }))
}

/// The caller acknowledges the latest message for themselves.
pub async fn mark_as_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Caller(caller): Caller,
) -> ApiResult<impl IntoResponse> {
    let success = tokio::task::spawn_blocking(move || {
        let user_id = caller.unwrap_or_default();
        state.service.mark_conversation_as_read(caller, user_id, conversation_id)
    })
    .await??;
    Ok(Json(SuccessResponse { success }))
}
