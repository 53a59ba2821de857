use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::types::{Event, SubscriptionId};

pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;
pub type Handler = Arc<dyn Fn(&Event) -> HandlerResult + Send + Sync>;

#[derive(Clone)]
pub struct Subscriber {
    pub id: SubscriptionId,
    pub min_weight: f32,
    pub(crate) handler: Handler,
}

impl Subscriber {
    pub fn accepts(&self, event: &Event) -> bool {
        self.min_weight <= event.weight
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("min_weight", &self.min_weight)
            .finish_non_exhaustive()
    }
}

/// Capped ring of the most recent events seen on a channel.
#[derive(Debug, Clone)]
pub struct EventHistory {
    entries: VecDeque<Event>,
    capacity: usize,
}

impl EventHistory {
    pub fn new(capacity: usize) -> Self {
        EventHistory {
            entries: VecDeque::with_capacity(capacity.min(256)),
            capacity,
        }
    }

    pub fn push(&mut self, event: Event) {
        if self.capacity == 0 {
            return;
        }
        self.entries.push_back(event);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub subscribers: Vec<Subscriber>,
    pub paired: BTreeSet<String>,
    pub last_activity_ms: u64,
    /// Display-only; nothing reads it for control flow.
    pub resonance: f32,
    pub history: EventHistory,
}

impl Channel {
    pub fn new(name: impl Into<String>, history_capacity: usize) -> Self {
        Channel {
            name: name.into(),
            subscribers: Vec::new(),
            paired: BTreeSet::new(),
            last_activity_ms: 0,
            resonance: 0.0,
            history: EventHistory::new(history_capacity),
        }
    }

    /// Records the event and returns the handlers it should reach, in
    /// subscription order.
    pub(crate) fn record(&mut self, event: &Event) -> Vec<(SubscriptionId, Handler)> {
        self.last_activity_ms = event.timestamp_ms;
        self.resonance = (self.resonance * 0.9 + event.weight * 0.1).clamp(0.0, 1.0);
        self.history.push(event.clone());
        self.subscribers
            .iter()
            .filter(|sub| sub.accepts(event))
            .map(|sub| (sub.id, sub.handler.clone()))
            .collect()
    }

    pub fn snapshot(&self) -> ChannelStatus {
        ChannelStatus {
            name: self.name.clone(),
            subscribers: self.subscribers.len(),
            paired: self.paired.iter().cloned().collect(),
            history: self.history.len(),
            last_activity_ms: self.last_activity_ms,
            resonance: self.resonance,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChannelStatus {
    pub name: String,
    pub subscribers: usize,
    pub paired: Vec<String>,
    pub history: usize,
    pub last_activity_ms: u64,
    pub resonance: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventPayload;

    fn event(n: u64, weight: f32) -> Event {
        Event {
            id: format!("evt_{n}"),
            channel: "test".into(),
            kind: "level:update".into(),
            payload: EventPayload::LevelUpdate { level: weight },
            weight,
            timestamp_ms: n,
            pair_id: None,
        }
    }

    #[test]
    fn history_keeps_only_newest_entries() {
        let mut history = EventHistory::new(3);
        for n in 0..5 {
            history.push(event(n, 0.5));
        }
        assert_eq!(history.len(), 3);
        let ids: Vec<_> = history.recent(10).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["evt_2", "evt_3", "evt_4"]);
        let last: Vec<_> = history.recent(1).into_iter().map(|e| e.id).collect();
        assert_eq!(last, vec!["evt_4"]);
    }

    #[test]
    fn record_filters_by_min_weight() {
        let mut channel = Channel::new("test", 4);
        let noop: Handler = Arc::new(|_| Ok(()));
        channel.subscribers.push(Subscriber {
            id: 1,
            min_weight: 0.0,
            handler: noop.clone(),
        });
        channel.subscribers.push(Subscriber {
            id: 2,
            min_weight: 0.8,
            handler: noop,
        });
        let targets = channel.record(&event(7, 0.5));
        assert_eq!(targets.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(channel.last_activity_ms, 7);
        assert!(channel.resonance > 0.0);
        assert_eq!(channel.history.len(), 1);
    }
}
