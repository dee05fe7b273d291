//! Post-commit realtime delivery: outbox staging inside transactional units,
//! channel fan-out to live connections, and authorized catchup replay.

use std::sync::Arc;
use std::time::Duration;

pub mod broadcaster;
pub mod catchup;
pub mod channel;
pub mod cursor;
pub mod event;
pub mod flusher;
mod index;
pub mod journal;
mod metrics;
pub mod outbox;
pub mod policy;
pub mod registry;
pub mod session;
pub mod unit;

use broadcaster::EventBroadcaster;
use catchup::{CatchupConfig, CatchupService};
use cursor::CursorCodec;
use flusher::OutboxFlusher;
use journal::EventJournal;
use policy::ChannelAuthorizer;
use registry::RegistryConfig;
use unit::MutationPipeline;

use crate::ports::db::TransactionalStore;
use crate::ports::rooms::RoomDirectory;

#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    pub subscriber_buffer: usize,
    pub heartbeat_interval: Duration,
    pub liveness_deadline: Duration,
    pub sweep_interval: Duration,
    pub stall_timeout: Duration,
    pub catchup_max_events: usize,
    pub catchup_window_ms: i64,
    pub journal_max_events: usize,
    pub cursor_secret: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 64,
            heartbeat_interval: Duration::from_secs(15),
            liveness_deadline: Duration::from_secs(45),
            sweep_interval: Duration::from_secs(10),
            stall_timeout: Duration::from_secs(5),
            catchup_max_events: 500,
            catchup_window_ms: 24 * 60 * 60 * 1_000,
            journal_max_events: 10_000,
            cursor_secret: "lapor-dev-cursor-secret".to_string(),
        }
    }
}

/// The wired realtime stack shared by every request.
#[derive(Clone)]
pub struct RealtimeEngine {
    pub broadcaster: Arc<EventBroadcaster>,
    pub pipeline: MutationPipeline,
    pub catchup: CatchupService,
    pub cursors: CursorCodec,
    pub config: RealtimeConfig,
}

impl RealtimeEngine {
    pub fn new(
        store: Arc<dyn TransactionalStore>,
        rooms: Arc<dyn RoomDirectory>,
        config: RealtimeConfig,
    ) -> Self {
        let journal = EventJournal::new(config.journal_max_events, config.catchup_window_ms);
        let broadcaster = Arc::new(EventBroadcaster::new(
            ChannelAuthorizer::new(rooms.clone()),
            journal,
            RegistryConfig {
                queue_capacity: config.subscriber_buffer,
                liveness_deadline: config.liveness_deadline,
            },
        ));
        let cursors = CursorCodec::new(config.cursor_secret.clone());
        let pipeline = MutationPipeline::new(store, OutboxFlusher::new(broadcaster.clone()));
        let catchup = CatchupService::new(
            broadcaster.clone(),
            rooms,
            cursors.clone(),
            CatchupConfig {
                max_events: config.catchup_max_events,
                window_ms: config.catchup_window_ms,
            },
        );
        Self {
            broadcaster,
            pipeline,
            catchup,
            cursors,
            config,
        }
    }
}
