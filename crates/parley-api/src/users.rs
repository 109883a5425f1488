use axum::{
    Json,
    extract::{Query, State},
    response::IntoResponse,
};

use parley_types::api::{CreateUsernameRequest, SearchUsersQuery};

use crate::error::ApiResult;
use crate::middleware::Caller;
use crate::state::AppState;

pub async fn create_username(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(req): Json<CreateUsernameRequest>,
) -> ApiResult<impl IntoResponse> {
    let response =
        tokio::task::spawn_blocking(move || state.service.create_username(caller, &req.username)).await??;
    Ok(Json(response))
}

pub async fn search_users(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(query): Query<SearchUsersQuery>,
) -> ApiResult<impl IntoResponse> {
    let users =
        tokio::task::spawn_blocking(move || state.service.search_users(caller, &query.username)).await??;
    Ok(Json(users))
}
