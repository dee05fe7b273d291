use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Extension, Path, Query, State};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::{Sink, SinkExt, StreamExt};
use lapor_domain::realtime::catchup::CatchupBatch;
use lapor_domain::realtime::channel::Channel;
use lapor_domain::realtime::event::EventEnvelope;
use lapor_domain::realtime::registry::Delivery;
use lapor_domain::realtime::session::{StreamOutput, StreamSession};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::ApiError;
use crate::middleware::RequestIdentity;
use crate::observability;
use crate::state::AppState;

const SSE: &str = "sse";
const WEBSOCKET: &str = "websocket";

type SseSender = mpsc::Sender<Result<Event, Infallible>>;

#[derive(Clone, Copy)]
struct StreamTiming {
    heartbeat: Duration,
    stall: Duration,
}

impl StreamTiming {
    fn from_state(state: &AppState) -> Self {
        Self {
            heartbeat: state.engine.config.heartbeat_interval,
            stall: state.engine.config.stall_timeout,
        }
    }
}

pub(super) async fn stream_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Extension(identity): Extension<RequestIdentity>,
) -> Result<Response, ApiError> {
    open_sse(state, identity, Channel::user(user_id)).await
}

pub(super) async fn stream_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Extension(identity): Extension<RequestIdentity>,
) -> Result<Response, ApiError> {
    open_sse(state, identity, Channel::room(room_id)).await
}

pub(super) async fn stream_feed(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
) -> Result<Response, ApiError> {
    open_sse(state, identity, Channel::Feed).await
}

pub(super) async fn stream_room_ws(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Extension(identity): Extension<RequestIdentity>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let (session, deliveries) =
        open_session(&state, &identity, Channel::room(room_id), WEBSOCKET).await?;
    let timing = StreamTiming::from_state(&state);
    Ok(ws.on_upgrade(move |socket| pump_websocket(socket, session, deliveries, timing)))
}

#[derive(Debug, Deserialize)]
pub(super) struct CatchupQuery {
    since: Option<String>,
}

pub(super) async fn catchup(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    Query(query): Query<CatchupQuery>,
) -> Result<Json<CatchupBatch>, ApiError> {
    let since = query.since.unwrap_or_default();
    if identity.actor.is_some() && since.trim().is_empty() {
        return Err(ApiError::Validation("since is required".into()));
    }
    let batch = state
        .engine
        .catchup
        .catchup(identity.actor.as_ref(), since.trim())
        .await?;
    Ok(Json(batch))
}

#[derive(Serialize)]
pub(super) struct CursorResponse {
    cursor: String,
}

pub(super) async fn current_cursor(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
) -> Result<Json<CursorResponse>, ApiError> {
    let actor = identity.require()?;
    Ok(Json(CursorResponse {
        cursor: state.engine.catchup.current_cursor(&actor),
    }))
}

async fn open_session(
    state: &AppState,
    identity: &RequestIdentity,
    channel: Channel,
    transport: &'static str,
) -> Result<(StreamSession, mpsc::Receiver<Delivery>), ApiError> {
    let actor = identity.require()?;
    let channel_kind = channel.kind_str();
    let opened = StreamSession::open(
        state.engine.broadcaster.clone(),
        state.engine.cursors.clone(),
        actor,
        channel,
    )
    .await?;
    observability::register_stream_opened(transport, channel_kind);
    Ok(opened)
}

async fn open_sse(
    state: AppState,
    identity: RequestIdentity,
    channel: Channel,
) -> Result<Response, ApiError> {
    let (session, deliveries) = open_session(&state, &identity, channel, SSE).await?;
    let (tx, rx) = mpsc::channel(state.engine.config.subscriber_buffer.max(1));
    let ready = Event::default()
        .event("ready")
        .id(session.current_cursor())
        .json_data(json!({
            "channel": session.channel().to_string(),
            "connection_id": session.connection_id(),
        }))
        .unwrap_or_else(|_| Event::default().event("ready"));
    // fresh channel, cannot be full
    let _ = tx.try_send(Ok(ready));
    tokio::spawn(pump_sse(session, deliveries, tx, StreamTiming::from_state(&state)));
    Ok(Sse::new(ReceiverStream::new(rx)).into_response())
}

async fn push_sse(tx: &SseSender, event: Event, stall: Duration) -> Result<(), &'static str> {
    match tx.send_timeout(Ok(event), stall).await {
        Ok(()) => Ok(()),
        Err(SendTimeoutError::Timeout(_)) => Err("stalled"),
        Err(SendTimeoutError::Closed(_)) => Err("client_gone"),
    }
}

fn envelope_event(cursor: String, envelope: &EventEnvelope) -> Event {
    Event::default()
        .event("event")
        .id(cursor)
        .json_data(envelope)
        .unwrap_or_else(|_| {
            Event::default()
                .event("error")
                .data("failed-to-serialize-event")
        })
}

async fn pump_sse(
    mut session: StreamSession,
    mut deliveries: mpsc::Receiver<Delivery>,
    tx: SseSender,
    timing: StreamTiming,
) {
    let mut heartbeat = interval(timing.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    let reason = loop {
        tokio::select! {
            delivery = deliveries.recv() => {
                let Some(delivery) = delivery else {
                    break "dropped";
                };
                match session.admit(delivery).await {
                    Ok(StreamOutput::Event { cursor, envelope }) => {
                        if let Err(reason) =
                            push_sse(&tx, envelope_event(cursor, &envelope), timing.stall).await
                        {
                            break reason;
                        }
                    }
                    Ok(StreamOutput::Closed { reason }) => {
                        let closed = Event::default().event("closed").data(reason);
                        let _ = push_sse(&tx, closed, timing.stall).await;
                        break reason;
                    }
                    Ok(StreamOutput::Skip) => {}
                    Err(err) => {
                        tracing::warn!(
                            connection_id = session.connection_id(),
                            error = %err,
                            "realtime stream failed"
                        );
                        let failed = Event::default().event("error").data("stream_failed");
                        let _ = push_sse(&tx, failed, timing.stall).await;
                        break "error";
                    }
                }
            }
            _ = heartbeat.tick() => {
                if !session.touch() {
                    break "dropped";
                }
                let ping = Event::default().event("ping").data("keep-alive");
                if let Err(reason) = push_sse(&tx, ping, timing.stall).await {
                    break reason;
                }
            }
        }
    };

    observability::register_stream_closed(SSE, reason);
    tracing::debug!(
        connection_id = session.connection_id(),
        channel = %session.channel(),
        reason,
        "sse stream ended"
    );
}

#[derive(Serialize)]
struct WebsocketFrame<'a> {
    cursor: &'a str,
    event: &'a EventEnvelope,
}

fn websocket_payload(cursor: &str, envelope: &EventEnvelope) -> String {
    serde_json::to_string(&WebsocketFrame {
        cursor,
        event: envelope,
    })
    .unwrap_or_else(|_| "{\"error\":\"failed-to-serialize-event\"}".to_string())
}

async fn close_websocket<S>(sender: &mut S, code: u16, reason: &'static str)
where
    S: Sink<Message> + Unpin,
{
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn pump_websocket(
    socket: WebSocket,
    mut session: StreamSession,
    mut deliveries: mpsc::Receiver<Delivery>,
    timing: StreamTiming,
) {
    let (mut sender, mut incoming) = socket.split();
    let ready = json!({
        "type": "ready",
        "cursor": session.current_cursor(),
        "channel": session.channel().to_string(),
    })
    .to_string();
    if sender.send(Message::Text(ready)).await.is_err() {
        observability::register_stream_closed(WEBSOCKET, "client_gone");
        return;
    }

    let mut heartbeat = interval(timing.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    let reason = loop {
        tokio::select! {
            delivery = deliveries.recv() => {
                let Some(delivery) = delivery else {
                    close_websocket(&mut sender, close_code::AWAY, "connection dropped").await;
                    break "dropped";
                };
                match session.admit(delivery).await {
                    Ok(StreamOutput::Event { cursor, envelope }) => {
                        let frame = Message::Text(websocket_payload(&cursor, &envelope));
                        match timeout(timing.stall, sender.send(frame)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) => break "client_gone",
                            Err(_) => break "stalled",
                        }
                    }
                    Ok(StreamOutput::Closed { reason }) => {
                        close_websocket(&mut sender, close_code::POLICY, reason).await;
                        break reason;
                    }
                    Ok(StreamOutput::Skip) => {}
                    Err(err) => {
                        tracing::warn!(
                            connection_id = session.connection_id(),
                            error = %err,
                            "realtime websocket failed"
                        );
                        close_websocket(&mut sender, close_code::ERROR, "stream failed").await;
                        break "error";
                    }
                }
            }
            frame = incoming.next() => {
                match frame {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break "client_gone",
                    Some(Ok(_)) => {
                        if !session.touch() {
                            break "dropped";
                        }
                    }
                }
            }
            _ = heartbeat.tick() => {
                match timeout(timing.stall, sender.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break "client_gone",
                    Err(_) => break "stalled",
                }
            }
        }
    };

    observability::register_stream_closed(WEBSOCKET, reason);
    tracing::debug!(
        connection_id = session.connection_id(),
        channel = %session.channel(),
        reason,
        "websocket stream ended"
    );
}
