use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use parley_types::api::{SendMessageRequest, SuccessResponse};

use crate::error::ApiResult;
use crate::middleware::Caller;
use crate::state::AppState;

pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Caller(caller): Caller,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let success = tokio::task::spawn_blocking(move || {
        state
            .service
            .send_message(caller, req.id, req.sender_id, conversation_id, &req.body)
    })
    .await??;

    Ok((StatusCode::CREATED, Json(SuccessResponse { success })))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Caller(caller): Caller,
) -> ApiResult<impl IntoResponse> {
    let messages =
        tokio::task::spawn_blocking(move || state.service.list_messages(caller, conversation_id)).await??;
    Ok(Json(messages))
}
