use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::{Body, to_bytes};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{Request, Response, StatusCode};
use futures_util::StreamExt;
use jsonwebtoken::{EncodingKey, Header, encode};
use lapor_domain::store::InMemoryStore;
use lapor_infra::config::AppConfig;
use serde::Serialize;
use serde_json::{Value, json};
use tower_util::ServiceExt;

use crate::middleware::ANONYMOUS_ID_HEADER;
use crate::routes;
use crate::state::AppState;

const SECRET: &str = "test-secret";

#[derive(Serialize)]
struct Claims {
    sub: String,
    role: String,
    exp: usize,
}

fn test_config() -> AppConfig {
    AppConfig {
        app_env: "test".to_string(),
        port: 0,
        log_level: "info".to_string(),
        data_backend: "memory".to_string(),
        surreal_endpoint: "ws://127.0.0.1:8000".to_string(),
        surreal_ns: "lapor".to_string(),
        surreal_db: "realtime".to_string(),
        surreal_user: "root".to_string(),
        surreal_pass: "root".to_string(),
        jwt_secret: SECRET.to_string(),
        auth_dev_bypass_enabled: false,
        realtime_subscriber_buffer: 16,
        realtime_heartbeat_interval_ms: 60_000,
        realtime_liveness_deadline_ms: 120_000,
        realtime_sweep_interval_ms: 60_000,
        realtime_stall_timeout_ms: 1_000,
        catchup_max_events: 100,
        catchup_window_ms: 3_600_000,
        journal_max_events: 1_000,
        catchup_cursor_secret: "test-cursor-secret".to_string(),
    }
}

fn token(role: &str, sub: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time")
        .as_secs();
    let claims = Claims {
        sub: sub.to_string(),
        role: role.to_string(),
        exp: (now + 3600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("token")
}

fn user_token(sub: &str) -> String {
    token("user", sub)
}

fn test_app() -> axum::Router {
    test_app_state_router().1
}

fn test_app_state_router() -> (AppState, axum::Router) {
    let store = Arc::new(InMemoryStore::new());
    let state = AppState::with_store(test_config(), store.clone(), store);
    let app = routes::router(state.clone());
    (state, app)
}

fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    match body {
        Some(body) => builder
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

async fn send(app: &axum::Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.expect("response")
}

async fn json_body(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    serde_json::from_slice(&bytes).expect("json body")
}

async fn error_code(response: Response<Body>) -> String {
    let body = json_body(response).await;
    body["error"]["code"].as_str().expect("error code").to_string()
}

async fn create_room(app: &axum::Router, token: &str, request_id: &str) -> String {
    let response = send(
        app,
        request(
            "POST",
            "/v1/rooms",
            Some(token),
            Some(json!({
                "scope_id": "rt-05",
                "privacy_level": "public",
                "request_id": request_id,
            })),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    json_body(response).await["room_id"]
        .as_str()
        .expect("room id")
        .to_string()
}

async fn current_cursor(app: &axum::Router, token: &str) -> String {
    let response = send(app, request("GET", "/v1/realtime/cursor", Some(token), None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await["cursor"]
        .as_str()
        .expect("cursor")
        .to_string()
}

fn event_types(batch: &Value) -> Vec<String> {
    batch["events"]
        .as_array()
        .expect("events")
        .iter()
        .map(|event| event["type"].as_str().expect("type").to_string())
        .collect()
}

#[tokio::test]
async fn health_reports_store_and_connections() {
    let app = test_app();
    let response = send(&app, request("GET", "/health", None, None)).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["environment"], "test");
    assert_eq!(body["store"], "memory");
    assert_eq!(body["store_status"], "ok");
    assert_eq!(body["connections"], 0);
}

#[tokio::test]
async fn protected_routes_require_identity() {
    let app = test_app();
    for (method, uri) in [
        ("POST", "/v1/rooms"),
        ("POST", "/v1/reports"),
        ("GET", "/v1/realtime/feed"),
        ("GET", "/v1/realtime/user/user-1"),
        ("GET", "/v1/realtime/room/room-1/ws"),
    ] {
        let response = send(&app, request(method, uri, None, None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{method} {uri}");
        assert_eq!(error_code(response).await, "AUTH_REQUIRED");
    }
}

#[tokio::test]
async fn invalid_token_is_treated_as_missing_identity() {
    let app = test_app();
    let response = send(
        &app,
        request("GET", "/v1/realtime/feed", Some("not-a-jwt"), None),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn anonymous_device_header_identifies_reporter() {
    let app = test_app();
    let mut req = request(
        "POST",
        "/v1/reports",
        None,
        Some(json!({
            "title": "Flooded underpass",
            "category": "flood",
            "request_id": "req-anon-1",
        })),
    );
    req.headers_mut()
        .insert(ANONYMOUS_ID_HEADER, "device-42".parse().expect("header"));

    let response = send(&app, req).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    assert_eq!(body["reporter_id"], "anon:device-42");
    assert_eq!(body["status"], "open");
}

#[tokio::test]
async fn room_message_flow_replays_through_catchup() {
    let app = test_app();
    let owner = user_token("user-a");
    let cursor = current_cursor(&app, &owner).await;
    let room_id = create_room(&app, &owner, "req-room-1").await;

    let response = send(
        &app,
        request(
            "POST",
            &format!("/v1/rooms/{room_id}/messages"),
            Some(&owner),
            Some(json!({
                "body": "water rising near the bridge",
                "request_id": "req-msg-1",
                "origin_client_id": "tab-1",
            })),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let message = json_body(response).await;
    assert_eq!(message["author_id"], "user-a");

    let response = send(
        &app,
        request(
            "GET",
            &format!("/v1/realtime/catchup?since={cursor}"),
            Some(&owner),
            None,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let batch = json_body(response).await;
    assert_eq!(batch["is_replay"], true);
    assert_eq!(batch["gap"], false);
    let types = event_types(&batch);
    assert!(types.contains(&"room_created".to_string()));
    assert!(types.contains(&"message_created".to_string()));
    let replayed = batch["events"]
        .as_array()
        .expect("events")
        .iter()
        .find(|event| event["type"] == "message_created")
        .expect("message event");
    assert_eq!(replayed["is_replay"], true);
    assert_eq!(replayed["origin_client_id"], "tab-1");
}

#[tokio::test]
async fn retried_message_request_is_idempotent() {
    let app = test_app();
    let owner = user_token("user-a");
    let room_id = create_room(&app, &owner, "req-room-2").await;

    let mut ids = Vec::new();
    for _ in 0..2 {
        let response = send(
            &app,
            request(
                "POST",
                &format!("/v1/rooms/{room_id}/messages"),
                Some(&owner),
                Some(json!({ "body": "hello", "request_id": "req-msg-dup" })),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        ids.push(json_body(response).await["message_id"].clone());
    }
    assert_eq!(ids[0], ids[1]);
}

#[tokio::test]
async fn message_validation_rejects_empty_body() {
    let app = test_app();
    let owner = user_token("user-a");
    let room_id = create_room(&app, &owner, "req-room-3").await;

    let response = send(
        &app,
        request(
            "POST",
            &format!("/v1/rooms/{room_id}/messages"),
            Some(&owner),
            Some(json!({ "body": "", "request_id": "req-msg-empty" })),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "VALIDATION_ERROR");
}

#[tokio::test]
async fn catchup_requires_since() {
    let app = test_app();
    let response = send(
        &app,
        request(
            "GET",
            "/v1/realtime/catchup",
            Some(&user_token("user-a")),
            None,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "VALIDATION_ERROR");
}

#[tokio::test]
async fn catchup_without_identity_requires_auth() {
    let app = test_app();
    let response = send(
        &app,
        request("GET", "/v1/realtime/catchup?since=abc", None, None),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(response).await, "AUTH_REQUIRED");
}

#[tokio::test]
async fn catchup_rejects_cursor_issued_to_another_actor() {
    let app = test_app();
    let cursor = current_cursor(&app, &user_token("user-a")).await;

    for since in [cursor.as_str(), "garbage"] {
        let response = send(
            &app,
            request(
                "GET",
                &format!("/v1/realtime/catchup?since={since}"),
                Some(&user_token("user-b")),
                None,
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "INVALID_CURSOR");
    }
}

#[tokio::test]
async fn streaming_another_users_channel_is_forbidden() {
    let (state, app) = test_app_state_router();
    let response = send(
        &app,
        request(
            "GET",
            "/v1/realtime/user/user-b",
            Some(&user_token("user-a")),
            None,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(response).await, "FORBIDDEN_STREAM");
    assert_eq!(state.engine.broadcaster.registry().len(), 0);
}

#[tokio::test]
async fn streaming_a_room_requires_membership() {
    let app = test_app();
    let room_id = create_room(&app, &user_token("user-a"), "req-room-4").await;

    let response = send(
        &app,
        request(
            "GET",
            &format!("/v1/realtime/room/{room_id}"),
            Some(&user_token("user-b")),
            None,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(response).await, "NOT_ROOM_MEMBER");
}

#[tokio::test]
async fn report_status_change_by_stranger_is_forbidden() {
    let app = test_app();
    let response = send(
        &app,
        request(
            "POST",
            "/v1/reports",
            Some(&user_token("reporter")),
            Some(json!({
                "title": "Broken street light",
                "category": "infrastructure",
                "contact": "0812-000",
                "request_id": "req-report-1",
            })),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let report_id = json_body(response).await["report_id"]
        .as_str()
        .expect("report id")
        .to_string();
    let status_uri = format!("/v1/reports/{report_id}/status");

    let response = send(
        &app,
        request(
            "POST",
            &status_uri,
            Some(&user_token("stranger")),
            Some(json!({ "status": "verified" })),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(response).await, "FORBIDDEN_WRITE");

    let response = send(
        &app,
        request(
            "POST",
            &status_uri,
            Some(&token("moderator", "mod-1")),
            Some(json!({ "status": "verified" })),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "verified");
    assert_eq!(body["revision"], 1);
}

#[tokio::test]
async fn unknown_report_status_is_a_validation_error() {
    let app = test_app();
    let response = send(
        &app,
        request(
            "POST",
            "/v1/reports/r-missing/status",
            Some(&token("moderator", "mod-1")),
            Some(json!({ "status": "teleported" })),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "VALIDATION_ERROR");
}

#[tokio::test]
async fn user_stream_opens_with_ready_event() {
    let (state, app) = test_app_state_router();
    let response = send(
        &app,
        request(
            "GET",
            "/v1/realtime/user/user-a",
            Some(&user_token("user-a")),
            None,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));
    assert_eq!(state.engine.broadcaster.registry().len(), 1);

    let mut frames = response.into_body().into_data_stream();
    let first = tokio::time::timeout(Duration::from_secs(2), frames.next())
        .await
        .expect("ready frame in time")
        .expect("stream frame")
        .expect("frame bytes");
    let text = String::from_utf8(first.to_vec()).expect("utf8 frame");
    assert!(text.contains("event: ready"));
    assert!(text.contains("user:user-a"));
}
