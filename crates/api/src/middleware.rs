use axum::{
    body::Body,
    extract::MatchedPath,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::middleware::NoOpMiddleware;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use lapor_domain::auth::Role;
use lapor_domain::identity::ActorIdentity;
use lapor_domain::util::uuid_v7_without_dashes;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_governor::GovernorLayer;
use tower_governor::governor::{GovernorConfig, GovernorConfigBuilder};
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{Span, info_span};
use uuid::Uuid;

use crate::error::ApiError;
use crate::observability;
use crate::state::AppState;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
pub const ANONYMOUS_ID_HEADER: &str = "x-anonymous-id";
const SESSION_COOKIE: &str = "lapor_session";

const DEV_BYPASS_USER_ID: &str = "dev-user";

#[derive(Clone, Debug)]
pub struct CorrelationId(pub String);

/// Identity resolved for the current request, if any.
#[derive(Clone, Debug, Default)]
pub struct RequestIdentity {
    pub actor: Option<ActorIdentity>,
    pub source: IdentitySource,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IdentitySource {
    #[default]
    None,
    DevBypass,
    Token,
    AnonymousDevice,
}

impl RequestIdentity {
    pub fn require(&self) -> Result<ActorIdentity, ApiError> {
        self.actor.clone().ok_or(ApiError::AuthRequired)
    }
}

fn dev_bypass_enabled(state: &AppState) -> bool {
    state.config.auth_dev_bypass_enabled && state.config.app_env.eq_ignore_ascii_case("development")
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    role: Option<String>,
    name: Option<String>,
    #[allow(dead_code)]
    exp: usize,
}

#[derive(Clone)]
pub struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = Uuid::now_v7().to_string();
        let value = HeaderValue::from_str(&id).ok()?;
        Some(RequestId::new(value))
    }
}

pub fn trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, RequestSpan> {
    TraceLayer::new_for_http().make_span_with(RequestSpan)
}

#[derive(Clone, Default)]
pub(crate) struct RequestSpan;

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, req: &Request<B>) -> Span {
        let request_id_header = HeaderName::from_static("x-request-id");
        let request_id = req
            .headers()
            .get(&request_id_header)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("-");
        let correlation_id = req
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("-");
        info_span!(
            "http_request",
            method = %req.method(),
            uri = %req.uri(),
            request_id = %request_id,
            correlation_id = %correlation_id
        )
    }
}

pub fn set_request_id_layer() -> SetRequestIdLayer<UuidRequestId> {
    SetRequestIdLayer::x_request_id(UuidRequestId)
}

pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::x_request_id()
}

/// Bounds time to response head; streaming bodies are not cut off.
pub fn timeout_layer() -> TimeoutLayer {
    TimeoutLayer::new(Duration::from_secs(30))
}

pub type RateLimitLayer = GovernorLayer<PeerIpKeyExtractor, NoOpMiddleware>;

pub fn rate_limit_layer() -> RateLimitLayer {
    let config = GovernorConfigBuilder::default()
        .per_second(100)
        .burst_size(200)
        .finish()
        .unwrap_or_else(|| {
            tracing::error!(
                "rate limit config builder produced invalid values; using conservative default"
            );
            GovernorConfig::default()
        });
    GovernorLayer {
        config: Arc::new(config),
    }
}

/// Resolves the caller: dev bypass, then a signed token, then an anonymous
/// device header. Never rejects; handlers decide whether identity is required.
pub async fn identity_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let identity = resolve_identity(&state, req.headers());
    tracing::debug!(
        source = ?identity.source,
        actor_id = identity.actor.as_ref().map(|actor| actor.user_id.as_str()).unwrap_or("-"),
        "request identity resolved"
    );
    req.extensions_mut().insert(identity);
    next.run(req).await
}

fn resolve_identity(state: &AppState, headers: &HeaderMap) -> RequestIdentity {
    if dev_bypass_enabled(state) {
        return RequestIdentity {
            actor: Some(ActorIdentity::with_user_id(DEV_BYPASS_USER_ID)),
            source: IdentitySource::DevBypass,
        };
    }

    if let Some(token) = auth_token(headers) {
        match decode_token(token, &state.config.jwt_secret) {
            Ok(actor) => {
                return RequestIdentity {
                    actor: Some(actor),
                    source: IdentitySource::Token,
                };
            }
            Err(reason) => tracing::warn!(reason, "ignoring invalid auth token"),
        }
    }

    let anonymous = headers
        .get(ANONYMOUS_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(ActorIdentity::anonymous);
    match anonymous {
        Some(actor) => RequestIdentity {
            actor: Some(actor),
            source: IdentitySource::AnonymousDevice,
        },
        None => RequestIdentity::default(),
    }
}

fn decode_token(token: &str, secret: &str) -> Result<ActorIdentity, &'static str> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|_| "invalid_jwt")?;

    let claims = data.claims;
    if claims.sub.trim().is_empty() {
        return Err("empty_subject");
    }
    let role = claims
        .role
        .as_deref()
        .and_then(Role::parse)
        .ok_or("invalid_role_claim")?;
    let mut actor = ActorIdentity::with_user_id(claims.sub).with_role(role);
    if let Some(name) = claims.name.filter(|name| !name.trim().is_empty()) {
        actor.username = name;
    }
    Ok(actor)
}

pub async fn require_identity_middleware(req: Request<Body>, next: Next) -> Response {
    let identified = req
        .extensions()
        .get::<RequestIdentity>()
        .is_some_and(|identity| identity.actor.is_some());
    if identified {
        next.run(req).await
    } else {
        ApiError::AuthRequired.into_response()
    }
}

pub async fn correlation_id_middleware(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static(CORRELATION_ID_HEADER);
    let correlation_id = match req.headers().get(&header_name) {
        Some(value) => match value.to_str() {
            Ok(value) => value.to_string(),
            Err(_) => {
                return ApiError::Validation("invalid correlation id".into()).into_response();
            }
        },
        None => uuid_v7_without_dashes(),
    };

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        req.headers_mut().insert(header_name.clone(), value);
    }

    req.extensions_mut()
        .insert(CorrelationId(correlation_id.clone()));

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(header_name, value);
    }
    response
}

pub async fn metrics_layer(req: Request<Body>, next: Next) -> Response {
    let start = std::time::Instant::now();
    let method = req.method().as_str().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let response = next.run(req).await;
    let status = response.status();
    observability::register_http_request(&method, &route, status, start.elapsed());
    response
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?;
    let value = value.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
}

fn cookie_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::COOKIE)?;
    let value = value.to_str().ok()?;
    value.split(';').find_map(|part| {
        let (name, val) = part.trim().split_once('=')?;
        (name.trim() == SESSION_COOKIE).then(|| val.trim())
    })
}

pub(crate) fn auth_token(headers: &HeaderMap) -> Option<&str> {
    bearer_token(headers).or_else(|| cookie_token(headers))
}
