pub mod conversations;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod service;
pub mod state;
pub mod users;

use axum::{
    Router, middleware as axum_middleware,
    routing::{delete, get, post, put},
};

use crate::state::AppState;

/// Every command and query route. Identity is attached by
/// [`middleware::identify`]; each operation rejects anonymous callers itself.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/conversations", get(conversations::list_conversations))
        .route("/conversations", post(conversations::create_conversation))
        .route("/conversations/{conversation_id}", delete(conversations::delete_conversation))
        .route("/conversations/{conversation_id}/read", post(conversations::mark_as_read))
        .route("/conversations/{conversation_id}/messages", get(messages::get_messages))
        .route("/conversations/{conversation_id}/messages", post(messages::send_message))
        .route("/users/me/username", put(users::create_username))
        .route("/users/search", get(users::search_users))
        .layer(axum_middleware::from_fn_with_state(state.clone(), middleware::identify))
        .with_state(state)
}
