use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::broadcaster::EventBroadcaster;
use super::channel::Channel;
use super::event::{EventKind, RealtimeEvent};
use super::outbox::OutboxEntry;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub events: usize,
    pub deliveries: usize,
    pub failed_deliveries: usize,
}

type PostPublishHook = fn(&EventBroadcaster, &RealtimeEvent);

/// Side effects that follow publication of a given kind.
const POST_PUBLISH_HOOKS: &[(EventKind, PostPublishHook)] =
    &[(EventKind::MemberLeft, revoke_departed_member)];

fn post_publish_hook(kind: EventKind) -> Option<PostPublishHook> {
    POST_PUBLISH_HOOKS
        .iter()
        .find(|(hook_kind, _)| *hook_kind == kind)
        .map(|(_, hook)| *hook)
}

fn revoke_departed_member(broadcaster: &EventBroadcaster, event: &RealtimeEvent) {
    let Some(user_id) = event.payload.data().get("user_id").and_then(Value::as_str) else {
        warn!(event_id = %event.event_id, "member_left event without user_id");
        return;
    };
    broadcaster.revoke(&Channel::room(event.aggregate_id.as_str()), user_id);
}

/// Hands committed outbox entries to the broadcaster off the request path.
#[derive(Clone)]
pub struct OutboxFlusher {
    broadcaster: Arc<EventBroadcaster>,
}

impl OutboxFlusher {
    pub fn new(broadcaster: Arc<EventBroadcaster>) -> Self {
        Self { broadcaster }
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    /// Spawns the fan-out and returns immediately. `None` when there is nothing to flush.
    pub fn flush(&self, entries: Vec<OutboxEntry>) -> Option<JoinHandle<FlushReport>> {
        if entries.is_empty() {
            return None;
        }
        let broadcaster = self.broadcaster.clone();
        Some(tokio::spawn(async move { flush_now(&broadcaster, entries) }))
    }
}

fn flush_now(broadcaster: &EventBroadcaster, entries: Vec<OutboxEntry>) -> FlushReport {
    let mut report = FlushReport::default();
    for entry in entries {
        let (event, published) = broadcaster.emit(entry);
        report.events += 1;
        report.deliveries += published.delivered;
        report.failed_deliveries += published.failed;
        if let Some(hook) = post_publish_hook(event.kind) {
            hook(broadcaster, &event);
        }
    }
    debug!(
        events = report.events,
        deliveries = report.deliveries,
        failed = report.failed_deliveries,
        "outbox flushed"
    );
    report
}
