mod realtime;

use axum::extract::{Extension, Path, State};
use axum::{
    Json, Router,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use lapor_domain::ports::db::TransactionalStore;
use lapor_domain::reports::{AddCommentInput, ReportStatus, SubmitReportInput};
use lapor_domain::rooms::{CreateRoomInput, SendMessageInput};
use lapor_domain::util::{format_ms_rfc3339, now_ms};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::middleware::{CorrelationId, RequestIdentity};
use crate::{
    error::ApiError, middleware as app_middleware, observability, state::AppState, validation,
};

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/rooms", post(create_room))
        .route("/v1/rooms/:room_id/join", post(join_room))
        .route("/v1/rooms/:room_id/leave", post(leave_room))
        .route("/v1/rooms/:room_id/messages", post(send_message))
        .route(
            "/v1/rooms/:room_id/messages/:message_id/delivered",
            post(mark_delivered),
        )
        .route(
            "/v1/rooms/:room_id/messages/:message_id/read",
            post(mark_read),
        )
        .route("/v1/rooms/:room_id/typing", post(typing))
        .route("/v1/reports", post(submit_report))
        .route("/v1/reports/:report_id/status", post(update_report_status))
        .route("/v1/reports/:report_id/comments", post(add_comment))
        .route("/v1/realtime/user/:user_id", get(realtime::stream_user))
        .route("/v1/realtime/room/:room_id", get(realtime::stream_room))
        .route("/v1/realtime/room/:room_id/ws", get(realtime::stream_room_ws))
        .route("/v1/realtime/feed", get(realtime::stream_feed))
        .route("/v1/realtime/cursor", get(realtime::current_cursor))
        .route_layer(middleware::from_fn(
            app_middleware::require_identity_middleware,
        ));

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/realtime/catchup", get(realtime::catchup))
        .merge(protected)
        .layer(middleware::from_fn(app_middleware::metrics_layer))
        .layer(app_middleware::timeout_layer())
        .layer(app_middleware::trace_layer())
        .layer(app_middleware::set_request_id_layer())
        .layer(app_middleware::propagate_request_id_layer())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::identity_middleware,
        ))
        .layer(middleware::from_fn(
            app_middleware::correlation_id_middleware,
        ));

    if !state.config.app_env.eq_ignore_ascii_case("test") {
        app = app.layer(app_middleware::rate_limit_layer());
    }

    app.with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
    store: &'static str,
    store_status: &'static str,
    connections: usize,
    server_time: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = state.engine.pipeline.store();
    let store_status = match store.health_check().await {
        Ok(()) => "ok",
        Err(err) => {
            tracing::warn!(store = store.name(), error = %err, "store health check failed");
            "degraded"
        }
    };
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.app_env.clone(),
        store: store.name(),
        store_status,
        connections: state.engine.broadcaster.registry().len(),
        server_time: format_ms_rfc3339(now_ms()),
    })
}

async fn metrics() -> Response {
    match observability::render_metrics() {
        Some(body) => body.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Deserialize, Validate)]
struct CreateRoomRequest {
    #[validate(length(min = 1, max = 128))]
    scope_id: String,
    #[validate(length(min = 1, max = 16))]
    privacy_level: String,
    #[validate(length(min = 1, max = 128))]
    request_id: String,
}

#[derive(Debug, Deserialize, Validate)]
struct SendMessageRequest {
    #[validate(length(min = 1, max = 2_000))]
    body: String,
    #[validate(length(min = 1, max = 128))]
    request_id: String,
    #[validate(length(max = 128))]
    origin_client_id: Option<String>,
}

#[derive(Debug, Default, Deserialize, Validate)]
struct TypingRequest {
    #[validate(length(max = 128))]
    origin_client_id: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
struct SubmitReportRequest {
    #[validate(length(min = 1, max = 160))]
    title: String,
    #[serde(default)]
    #[validate(length(max = 5_000))]
    description: String,
    #[validate(length(min = 1, max = 64))]
    category: String,
    #[validate(length(max = 256))]
    location: Option<String>,
    #[validate(length(max = 128))]
    contact: Option<String>,
    #[validate(length(min = 1, max = 128))]
    request_id: String,
    #[validate(length(max = 128))]
    origin_client_id: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
struct UpdateReportStatusRequest {
    #[validate(length(min = 1, max = 32))]
    status: String,
}

#[derive(Debug, Deserialize, Validate)]
struct AddCommentRequest {
    #[validate(length(min = 1, max = 2_000))]
    body: String,
    #[validate(length(min = 1, max = 128))]
    request_id: String,
    #[validate(length(max = 128))]
    origin_client_id: Option<String>,
}

async fn create_room(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Extension(correlation): Extension<CorrelationId>,
    Json(payload): Json<CreateRoomRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let actor = identity.require()?;
    let room = state
        .rooms
        .create_room(
            &actor,
            CreateRoomInput {
                scope_id: payload.scope_id,
                privacy_level: payload.privacy_level,
                request_id: payload.request_id,
            },
        )
        .await?
        .into_value();
    tracing::info!(
        room_id = %room.room_id,
        actor_id = %actor.user_id,
        correlation_id = %correlation.0,
        "room created"
    );
    Ok((StatusCode::CREATED, Json(room)).into_response())
}

async fn join_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Extension(identity): Extension<RequestIdentity>,
) -> Result<Response, ApiError> {
    let actor = identity.require()?;
    let member = state.rooms.join_room(&actor, &room_id).await?.into_value();
    Ok(Json(member).into_response())
}

async fn leave_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Extension(identity): Extension<RequestIdentity>,
) -> Result<Response, ApiError> {
    let actor = identity.require()?;
    let member = state.rooms.leave_room(&actor, &room_id).await?.into_value();
    Ok(Json(member).into_response())
}

async fn send_message(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Extension(identity): Extension<RequestIdentity>,
    Extension(correlation): Extension<CorrelationId>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let actor = identity.require()?;
    let message = state
        .rooms
        .send_message(
            &actor,
            SendMessageInput {
                room_id,
                body: payload.body,
                request_id: payload.request_id,
                origin_client_id: validation::optional_tag(payload.origin_client_id),
            },
        )
        .await?
        .into_value();
    tracing::debug!(
        message_id = %message.message_id,
        correlation_id = %correlation.0,
        "room message accepted"
    );
    Ok((StatusCode::CREATED, Json(message)).into_response())
}

async fn mark_delivered(
    State(state): State<AppState>,
    Path((room_id, message_id)): Path<(String, String)>,
    Extension(identity): Extension<RequestIdentity>,
) -> Result<Response, ApiError> {
    let actor = identity.require()?;
    let receipt = state
        .rooms
        .mark_delivered(&actor, &room_id, &message_id)
        .await?
        .into_value();
    Ok(Json(receipt).into_response())
}

async fn mark_read(
    State(state): State<AppState>,
    Path((room_id, message_id)): Path<(String, String)>,
    Extension(identity): Extension<RequestIdentity>,
) -> Result<Response, ApiError> {
    let actor = identity.require()?;
    let receipt = state
        .rooms
        .mark_read(&actor, &room_id, &message_id)
        .await?
        .into_value();
    Ok(Json(receipt).into_response())
}

async fn typing(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Extension(identity): Extension<RequestIdentity>,
    payload: Option<Json<TypingRequest>>,
) -> Result<Response, ApiError> {
    let Json(payload) = payload.unwrap_or_default();
    validation::validate(&payload)?;
    let actor = identity.require()?;
    state
        .rooms
        .typing(
            &actor,
            &room_id,
            validation::optional_tag(payload.origin_client_id),
        )
        .await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn submit_report(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Extension(correlation): Extension<CorrelationId>,
    Json(payload): Json<SubmitReportRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let actor = identity.require()?;
    let report = state
        .reports
        .submit_report(
            &actor,
            SubmitReportInput {
                title: payload.title,
                description: payload.description,
                category: payload.category,
                location: payload.location,
                contact: payload.contact,
                request_id: payload.request_id,
                origin_client_id: validation::optional_tag(payload.origin_client_id),
            },
        )
        .await?
        .into_value();
    tracing::info!(
        report_id = %report.report_id,
        category = %report.category,
        correlation_id = %correlation.0,
        "report submitted"
    );
    Ok((StatusCode::CREATED, Json(report)).into_response())
}

async fn update_report_status(
    State(state): State<AppState>,
    Path(report_id): Path<String>,
    Extension(identity): Extension<RequestIdentity>,
    Json(payload): Json<UpdateReportStatusRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let actor = identity.require()?;
    let status = ReportStatus::parse(&payload.status)
        .ok_or_else(|| ApiError::Validation(format!("unknown status '{}'", payload.status)))?;
    let report = state
        .reports
        .update_report_status(&actor, &report_id, status)
        .await?
        .into_value();
    Ok(Json(report).into_response())
}

async fn add_comment(
    State(state): State<AppState>,
    Path(report_id): Path<String>,
    Extension(identity): Extension<RequestIdentity>,
    Json(payload): Json<AddCommentRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let actor = identity.require()?;
    let comment = state
        .reports
        .add_comment(
            &actor,
            AddCommentInput {
                report_id,
                body: payload.body,
                request_id: payload.request_id,
                origin_client_id: validation::optional_tag(payload.origin_client_id),
            },
        )
        .await?
        .into_value();
    Ok((StatusCode::CREATED, Json(comment)).into_response())
}
