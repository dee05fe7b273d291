use std::collections::HashMap;

use super::channel::Channel;
use super::event::PendingEvent;
use crate::DomainResult;
use crate::error::DomainError;

#[derive(Clone, Debug, PartialEq)]
pub struct OutboxEntry {
    pub event: PendingEvent,
    pub channels: Vec<Channel>,
}

/// Events staged by one transactional unit. Never shared; drained on commit,
/// discarded on rollback.
#[derive(Debug, Default)]
pub struct Outbox {
    entries: Vec<OutboxEntry>,
    positions: HashMap<String, usize>,
}

impl Outbox {
    /// Stages an event on the given channels. Staging an `event_id` that is
    /// already present keeps the first body and unions the channel lists.
    /// Returns `true` when the event was new.
    pub fn stage(&mut self, event: PendingEvent, channels: Vec<Channel>) -> DomainResult<bool> {
        if channels.is_empty() {
            return Err(DomainError::Validation(format!(
                "event {} staged without channels",
                event.event_id()
            )));
        }

        if let Some(position) = self.positions.get(event.event_id()) {
            let existing = &mut self.entries[*position].channels;
            for channel in channels {
                if !existing.contains(&channel) {
                    existing.push(channel);
                }
            }
            return Ok(false);
        }

        let mut unique = Vec::with_capacity(channels.len());
        for channel in channels {
            if !unique.contains(&channel) {
                unique.push(channel);
            }
        }
        self.positions
            .insert(event.event_id().to_string(), self.entries.len());
        self.entries.push(OutboxEntry {
            event,
            channels: unique,
        });
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in staging order.
    pub fn drain(self) -> Vec<OutboxEntry> {
        self.entries
    }

    /// Drops everything staged so far and returns how many entries were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        self.positions.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::event::{EventKind, EventPayload};
    use serde_json::json;

    fn delivered(body: &str) -> PendingEvent {
        PendingEvent::new(
            EventKind::MessageDelivered,
            "msg-1",
            "user-2",
            EventPayload::full(json!({ "note": body })),
        )
        .unwrap()
    }

    #[test]
    fn duplicate_event_id_collapses_and_unions_channels() {
        let mut outbox = Outbox::default();
        assert!(outbox.stage(delivered("first"), vec![Channel::room("r1")]).unwrap());
        assert!(
            !outbox
                .stage(
                    delivered("second"),
                    vec![Channel::room("r1"), Channel::user("author")]
                )
                .unwrap()
        );

        let entries = outbox.drain();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event.payload().data()["note"], "first");
        assert_eq!(
            entries[0].channels,
            vec![Channel::room("r1"), Channel::user("author")]
        );
    }

    #[test]
    fn discard_empties_the_outbox() {
        let mut outbox = Outbox::default();
        outbox.stage(delivered("x"), vec![Channel::Feed]).unwrap();
        assert_eq!(outbox.discard(), 1);
        assert!(outbox.is_empty());
        assert!(outbox.stage(delivered("x"), Vec::new()).is_err());
    }
}
