use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::channel::{
    Channel, ChannelStatus, Handler, HandlerResult, Subscriber, DEFAULT_HISTORY_CAPACITY,
};
use crate::types::{
    Event, EventPayload, SubscriptionId, COMPONENT_EVOLUTION, CONSCIOUSNESS_SHIFT,
    DEFAULT_CHANNELS, PATTERN_EMERGENCE, THEME_TRANSITION,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventConfig {
    pub channels: Vec<String>,
    pub entanglements: Vec<(String, String)>,
    pub history_capacity: usize,
    pub default_weight: f32,
}

impl Default for EventConfig {
    fn default() -> Self {
        EventConfig {
            channels: DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect(),
            entanglements: vec![
                (CONSCIOUSNESS_SHIFT.into(), PATTERN_EMERGENCE.into()),
                (THEME_TRANSITION.into(), COMPONENT_EVOLUTION.into()),
            ],
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            default_weight: 0.5,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("channel {0} cannot be entangled with itself")]
    SelfEntanglement(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubscribeOptions {
    pub min_weight: f32,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        SubscribeOptions { min_weight: 0.0 }
    }
}

impl SubscribeOptions {
    pub fn min_weight(min_weight: f32) -> Self {
        SubscribeOptions { min_weight }
    }
}

/// Outcome of a single `emit`. Paired deliveries are counted separately.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DispatchReport {
    pub event_id: Option<String>,
    pub dropped: bool,
    pub delivered: usize,
    pub failed: usize,
    pub paired_delivered: usize,
    pub paired_failed: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventSystemStatus {
    pub channels: Vec<ChannelStatus>,
    pub emitted: u64,
    pub delivered: u64,
    pub failed: u64,
}

pub struct EventSystem {
    channels: RwLock<HashMap<String, Channel>>,
    next_subscription: AtomicU64,
    history_capacity: usize,
    default_weight: f32,
    emitted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl EventSystem {
    pub fn new(cfg: &EventConfig) -> Self {
        let system = EventSystem {
            channels: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            history_capacity: cfg.history_capacity,
            default_weight: sanitize_weight(cfg.default_weight, 0.5),
            emitted: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        };
        for name in &cfg.channels {
            system.register_channel(name);
        }
        for (left, right) in &cfg.entanglements {
            if let Err(err) = system.entangle(left, right) {
                warn!(left = %left, right = %right, error = %err, "event_system.entangle_skipped");
            }
        }
        system
    }

    pub fn default_weight(&self) -> f32 {
        self.default_weight
    }

    pub fn register_channel(&self, name: &str) -> bool {
        let mut channels = self.channels.write();
        if channels.contains_key(name) {
            return false;
        }
        channels.insert(name.to_string(), Channel::new(name, self.history_capacity));
        true
    }

    pub fn entangle(&self, left: &str, right: &str) -> Result<(), EventError> {
        if left == right {
            return Err(EventError::SelfEntanglement(left.to_string()));
        }
        let mut channels = self.channels.write();
        for name in [left, right] {
            if !channels.contains_key(name) {
                return Err(EventError::UnknownChannel(name.to_string()));
            }
        }
        if let Some(channel) = channels.get_mut(left) {
            channel.paired.insert(right.to_string());
        }
        if let Some(channel) = channels.get_mut(right) {
            channel.paired.insert(left.to_string());
        }
        Ok(())
    }

    pub fn subscribe<F>(
        &self,
        channel: &str,
        handler: F,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionId, EventError>
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        let mut channels = self.channels.write();
        let target = channels
            .get_mut(channel)
            .ok_or_else(|| EventError::UnknownChannel(channel.to_string()))?;
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let handler: Handler = Arc::new(handler);
        target.subscribers.push(Subscriber {
            id,
            min_weight: opts.min_weight,
            handler,
        });
        debug!(channel = %channel, id, min_weight = opts.min_weight, "event_system.subscribed");
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut channels = self.channels.write();
        for channel in channels.values_mut() {
            let before = channel.subscribers.len();
            channel.subscribers.retain(|sub| sub.id != id);
            if channel.subscribers.len() != before {
                return true;
            }
        }
        false
    }

    /// Builds an event and delivers it synchronously. `weight` falls back to
    /// the configured default and is clamped to `0.0..=1.0`.
    pub fn emit(
        &self,
        channel: &str,
        payload: EventPayload,
        weight: impl Into<Option<f32>>,
    ) -> DispatchReport {
        let weight = match weight.into() {
            Some(value) => sanitize_weight(value, self.default_weight),
            None => self.default_weight,
        };
        let event = Event {
            id: next_event_id(),
            channel: channel.to_string(),
            kind: payload.kind().to_string(),
            payload,
            weight,
            timestamp_ms: unix_ms(),
            pair_id: None,
        };

        let (primary, paired) = {
            let mut channels = self.channels.write();
            let Some(target) = channels.get_mut(channel) else {
                debug!(channel = %channel, kind = %event.kind, "event_system.dropped_unknown_channel");
                return DispatchReport {
                    dropped: true,
                    ..Default::default()
                };
            };
            let primary = target.record(&event);
            let partners: Vec<String> = target.paired.iter().cloned().collect();
            let mut paired: Vec<(Event, Vec<(SubscriptionId, Handler)>)> = Vec::new();
            for name in partners {
                if let Some(partner) = channels.get_mut(&name) {
                    let mut copy = event.clone();
                    copy.channel = name.clone();
                    copy.pair_id = Some(format!("{}:{}", event.id, name));
                    let handlers = partner.record(&copy);
                    paired.push((copy, handlers));
                }
            }
            (primary, paired)
        };
        self.emitted.fetch_add(1, Ordering::Relaxed);

        let mut report = DispatchReport {
            event_id: Some(event.id.clone()),
            ..Default::default()
        };
        let (ok, failed) = self.deliver(&event, &primary);
        report.delivered = ok;
        report.failed = failed;
        for (copy, handlers) in &paired {
            let (ok, failed) = self.deliver(copy, handlers);
            report.paired_delivered += ok;
            report.paired_failed += failed;
        }
        report
    }

    fn deliver(&self, event: &Event, handlers: &[(SubscriptionId, Handler)]) -> (usize, usize) {
        let mut ok = 0usize;
        let mut failed = 0usize;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => ok += 1,
                Ok(Err(err)) => {
                    failed += 1;
                    warn!(
                        channel = %event.channel,
                        kind = %event.kind,
                        subscription = id,
                        error = %err,
                        "event_system.handler_failed"
                    );
                }
                Err(_) => {
                    failed += 1;
                    warn!(
                        channel = %event.channel,
                        kind = %event.kind,
                        subscription = id,
                        "event_system.handler_panicked"
                    );
                }
            }
        }
        self.delivered.fetch_add(ok as u64, Ordering::Relaxed);
        self.failed.fetch_add(failed as u64, Ordering::Relaxed);
        (ok, failed)
    }

    pub fn history(&self, channel: &str, limit: usize) -> Result<Vec<Event>, EventError> {
        let channels = self.channels.read();
        channels
            .get(channel)
            .map(|c| c.history.recent(limit))
            .ok_or_else(|| EventError::UnknownChannel(channel.to_string()))
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.read().contains_key(channel)
    }

    pub fn status(&self) -> EventSystemStatus {
        let mut channels: Vec<ChannelStatus> =
            self.channels.read().values().map(Channel::snapshot).collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        EventSystemStatus {
            channels,
            emitted: self.emitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventSystem {
    fn default() -> Self {
        EventSystem::new(&EventConfig::default())
    }
}

fn sanitize_weight(weight: f32, fallback: f32) -> f32 {
    if weight.is_finite() {
        weight.clamp(0.0, 1.0)
    } else {
        fallback.clamp(0.0, 1.0)
    }
}

pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

fn next_event_id() -> String {
    let mut rng = rand::thread_rng();
    format!("evt_{}_{:08x}", unix_ms(), rng.gen::<u32>())
}
