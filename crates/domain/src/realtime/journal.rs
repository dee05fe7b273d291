use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::channel::Channel;
use super::event::{PendingEvent, RealtimeEvent};
use crate::util::now_ms;

#[derive(Clone, Debug)]
pub struct JournalEntry {
    pub event: Arc<RealtimeEvent>,
    pub channels: Vec<Channel>,
}

#[derive(Debug)]
pub struct JournalRead {
    pub entries: Vec<JournalEntry>,
    /// Events newer than the requested position may have been lost.
    pub gap: bool,
    /// Oldest position the journal still answers for completely.
    pub horizon: i64,
    /// Every event stamped after the read is strictly newer than this.
    pub watermark: i64,
}

#[derive(Debug)]
struct JournalState {
    entries: VecDeque<JournalEntry>,
    /// Newest server timestamp ever evicted.
    evicted_through: Option<i64>,
    /// Last timestamp issued or reserved by a read.
    clock: i64,
}

/// Bounded in-process record of published replayable events, read by catchup.
#[derive(Clone, Debug)]
pub struct EventJournal {
    state: Arc<Mutex<JournalState>>,
    max_events: usize,
    window_ms: i64,
    started_at_ms: i64,
}

impl EventJournal {
    pub fn new(max_events: usize, window_ms: i64) -> Self {
        Self::starting_at(max_events, window_ms, now_ms() - 1)
    }

    /// Journal that holds every event stamped after `started_at_ms`.
    pub fn starting_at(max_events: usize, window_ms: i64, started_at_ms: i64) -> Self {
        Self {
            state: Arc::new(Mutex::new(JournalState {
                entries: VecDeque::new(),
                evicted_through: None,
                clock: started_at_ms,
            })),
            max_events: max_events.max(1),
            window_ms: window_ms.max(1),
            started_at_ms,
        }
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    /// Stamps the event with the next server timestamp and, when replayable,
    /// records it in the same critical section.
    pub fn stamp(&self, event: PendingEvent, channels: &[Channel]) -> Arc<RealtimeEvent> {
        let mut state = self.lock();
        let timestamp = now_ms().max(state.clock + 1);
        state.clock = timestamp;
        let event = Arc::new(event.stamp(timestamp));
        if event.kind.is_replayable() {
            self.record(&mut state, event.clone(), channels.to_vec());
        }
        event
    }

    /// Records an already stamped event. The clock never moves backwards.
    pub fn append(&self, event: Arc<RealtimeEvent>, channels: Vec<Channel>) {
        let mut state = self.lock();
        state.clock = state.clock.max(event.server_timestamp);
        self.record(&mut state, event, channels);
    }

    /// Position a fresh cursor may start from. Reserved: later stamps are greater.
    pub fn position(&self) -> i64 {
        reserve(&mut self.lock(), now_ms())
    }

    /// Entries with `server_timestamp > since`, oldest first.
    pub fn read_since(&self, since: i64, now: i64) -> JournalRead {
        let window_start = now - self.window_ms;
        let mut state = self.lock();
        prune_before(&mut state, window_start);

        let horizon = [
            self.started_at_ms,
            window_start,
            state.evicted_through.unwrap_or(i64::MIN),
        ]
        .into_iter()
        .max()
        .unwrap_or(window_start);

        let entries = state
            .entries
            .iter()
            .filter(|entry| entry.event.server_timestamp > since)
            .cloned()
            .collect();
        JournalRead {
            entries,
            gap: since < horizon,
            horizon,
            watermark: reserve(&mut state, now),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, JournalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, state: &mut JournalState, event: Arc<RealtimeEvent>, channels: Vec<Channel>) {
        let timestamp = event.server_timestamp;
        state.entries.push_back(JournalEntry { event, channels });
        while state.entries.len() > self.max_events {
            evict_front(state);
        }
        prune_before(state, timestamp - self.window_ms);
    }
}

fn reserve(state: &mut JournalState, now: i64) -> i64 {
    state.clock = state.clock.max(now - 1);
    state.clock
}

fn evict_front(state: &mut JournalState) {
    if let Some(entry) = state.entries.pop_front() {
        let timestamp = entry.event.server_timestamp;
        state.evicted_through = Some(
            state
                .evicted_through
                .map_or(timestamp, |current| current.max(timestamp)),
        );
    }
}

fn prune_before(state: &mut JournalState, cutoff: i64) {
    while state
        .entries
        .front()
        .is_some_and(|entry| entry.event.server_timestamp < cutoff)
    {
        evict_front(state);
    }
}
