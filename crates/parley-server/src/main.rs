mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_api::service::ChatService;
use parley_api::state::{AppState, AppStateInner};
use parley_gateway::auth::verify_token;
use parley_gateway::bus::EventBus;
use parley_gateway::connection;

use crate::config::Config;

#[derive(Clone)]
struct GatewayState {
    bus: EventBus,
    jwt_secret: String,
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(parley_db::Database::open(&config.db_path)?);

    // Shared state
    let bus = EventBus::with_capacity(config.event_capacity);
    let app_state: AppState = Arc::new(AppStateInner {
        service: ChatService::new(db, bus.clone()),
        jwt_secret: config.jwt_secret.clone(),
    });

    let gateway_state = GatewayState {
        bus: bus.clone(),
        jwt_secret: config.jwt_secret.clone(),
    };

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway_state);

    let app = Router::new()
        .merge(parley_api::router(app_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Parley server listening on {}", config.addr);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(bus))
        .await?;

    info!("Parley server stopped");
    Ok(())
}

/// Resolves on Ctrl-C after tearing down the event bus, which ends every
/// live subscription so open sockets close and the server can drain.
async fn shutdown_signal(bus: EventBus) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
    bus.shutdown();
}

/// Accepts the identity token as `?token=` or a bearer header. No token means
/// an anonymous socket; a bad token is refused before the upgrade.
async fn ws_upgrade(
    State(state): State<GatewayState>,
    Query(query): Query<GatewayQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query.token.or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
    });

    let user_id = match token {
        Some(token) => match verify_token(&token, &state.jwt_secret) {
            Ok(claims) => Some(claims.sub),
            Err(e) => {
                warn!("Gateway upgrade with invalid token: {}", e);
                return StatusCode::UNAUTHORIZED.into_response();
            }
        },
        None => None,
    };

    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.bus, user_id))
}
