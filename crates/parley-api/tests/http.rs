use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use parley_api::service::ChatService;
use parley_api::state::AppStateInner;
use parley_db::Database;
use parley_gateway::bus::EventBus;
use parley_types::api::Claims;

const SECRET: &str = "test-secret";

struct TestApp {
    router: Router,
    db: Arc<Database>,
}

fn app() -> TestApp {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let service = ChatService::new(db.clone(), EventBus::new());
    let router = parley_api::router(Arc::new(AppStateInner {
        service,
        jwt_secret: SECRET.into(),
    }));
    TestApp { router, db }
}

fn token(user: Uuid) -> String {
    encode(
        &Header::default(),
        &Claims { sub: user, exp: 4_000_000_000 },
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

async fn call(app: &TestApp, method: &str, uri: &str, user: Option<Uuid>, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        req = req.header(header::AUTHORIZATION, format!("Bearer {}", token(user)));
    }
    let req = match body {
        Some(body) => req
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };

    let response = app.router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn anonymous_requests_are_unauthorized() {
    let app = app();
    let (status, body) = call(&app, "GET", "/conversations", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("not authorized"));
}

#[tokio::test]
async fn bad_token_is_rejected() {
    let app = app();
    let req = Request::builder()
        .uri("/conversations")
        .header(header::AUTHORIZATION, "Bearer not-a-jwt")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn conversation_lifecycle_over_http() {
    let app = app();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    app.db.create_user(a, Some("alice")).unwrap();
    app.db.create_user(b, Some("bob")).unwrap();

    let (status, created) = call(&app, "POST", "/conversations", Some(a), Some(json!({ "participantIds": [a, b] }))).await;
    assert_eq!(status, StatusCode::CREATED);
    let cid = created["conversationId"].as_str().unwrap().to_string();

    let message_id = Uuid::new_v4();
    let (status, sent) = call(
        &app,
        "POST",
        &format!("/conversations/{}/messages", cid),
        Some(b),
        Some(json!({ "id": message_id, "senderId": b, "body": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(sent, json!({ "success": true }));

    let (status, conversations) = call(&app, "GET", "/conversations", Some(a), None).await;
    assert_eq!(status, StatusCode::OK);
    let conversation = &conversations[0];
    assert_eq!(conversation["latestMessage"]["id"], json!(message_id));
    assert_eq!(conversation["latestMessage"]["sender"]["username"], json!("bob"));
    let seen: Vec<bool> = conversation["participants"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["hasSeenLatestMessage"].as_bool().unwrap())
        .collect();
    assert_eq!(seen, vec![false, true]);

    let (status, read) = call(&app, "POST", &format!("/conversations/{}/read", cid), Some(a), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(read, json!({ "success": true }));

    let (status, messages) = call(&app, "GET", &format!("/conversations/{}/messages", cid), Some(a), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(messages[0]["body"], json!("hi"));

    let (status, _) = call(&app, "DELETE", &format!("/conversations/{}", cid), Some(a), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(&app, "DELETE", &format!("/conversations/{}", cid), Some(a), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn outsiders_are_forbidden_and_unknown_senders_not_found() {
    let app = app();
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    app.db.create_user(a, Some("alice")).unwrap();
    app.db.create_user(b, Some("bob")).unwrap();
    app.db.create_user(c, Some("carol")).unwrap();

    let (_, created) = call(&app, "POST", "/conversations", Some(a), Some(json!({ "participantIds": [a, b] }))).await;
    let cid = created["conversationId"].as_str().unwrap().to_string();

    let (status, _) = call(&app, "GET", &format!("/conversations/{}/messages", cid), Some(c), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(&app, "DELETE", &format!("/conversations/{}", cid), Some(c), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let stranger = Uuid::new_v4();
    let (status, body) = call(
        &app,
        "POST",
        &format!("/conversations/{}/messages", cid),
        Some(stranger),
        Some(json!({ "id": Uuid::new_v4(), "senderId": stranger, "body": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn validation_errors_map_to_bad_request() {
    let app = app();
    let a = Uuid::new_v4();
    app.db.create_user(a, Some("alice")).unwrap();

    let (status, _) = call(&app, "POST", "/conversations", Some(a), Some(json!({ "participantIds": [] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, "PUT", "/users/me/username", Some(a), Some(json!({ "username": "" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn store_failures_do_not_leak_details() {
    let app = app();
    let a = Uuid::new_v4();
    app.db.create_user(a, Some("alice")).unwrap();

    let (status, body) = call(
        &app,
        "POST",
        "/conversations",
        Some(a),
        Some(json!({ "participantIds": [a, Uuid::new_v4()] })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({ "error": "internal store error" }));
}

#[tokio::test]
async fn usernames_and_search() {
    let app = app();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

    let (status, body) = call(&app, "PUT", "/users/me/username", Some(a), Some(json!({ "username": "alice" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true }));

    let (_, body) = call(&app, "PUT", "/users/me/username", Some(b), Some(json!({ "username": "alice" }))).await;
    assert_eq!(body, json!({ "error": "Username already taken. Please try another" }));

    call(&app, "PUT", "/users/me/username", Some(b), Some(json!({ "username": "Alicia" }))).await;

    let (status, found) = call(&app, "GET", "/users/search?username=ali", Some(a), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found, json!([{ "id": b, "username": "Alicia" }]));
}
