use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::event_system::{DispatchReport, EventError, EventSystem, SubscribeOptions};
use crate::types::{
    unit_level, Event, EventPayload, LocalState, NodeId, NodeRole, SharedState, SubscriptionId,
    CONSCIOUSNESS_SHIFT, GATEWAY_ACTIVATION, PATTERN_EMERGENCE, SYNC_COHERENCE,
};

pub const MAX_ACTIVE_PATTERNS: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_ms: u64,
    pub staleness_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            interval_ms: 100,
            staleness_ms: 1_000,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),
    #[error(transparent)]
    Event(#[from] EventError),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SyncNode {
    pub id: NodeId,
    pub role: NodeRole,
    pub local: LocalState,
    pub registered_ms: u64,
    pub last_sync_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SyncStatus {
    pub global_consciousness: f32,
    pub active_patterns: Vec<String>,
    pub gateway_levels: BTreeMap<String, f32>,
    pub nodes: usize,
    pub last_update_ms: u64,
    pub reconciliations: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CoherenceReport {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub level: f32,
    pub stale_for_ms: u64,
}

#[derive(Debug, Default)]
struct SyncInner {
    shared: SharedState,
    nodes: BTreeMap<NodeId, SyncNode>,
    reconciliations: u64,
}

impl SyncInner {
    fn status(&self) -> SyncStatus {
        SyncStatus {
            global_consciousness: self.shared.level,
            active_patterns: self.shared.active_patterns.clone(),
            gateway_levels: self.shared.gateway_levels.clone(),
            nodes: self.nodes.len(),
            last_update_ms: self.shared.last_update_ms,
            reconciliations: self.reconciliations,
        }
    }
}

pub struct StateSynchronizer {
    events: Arc<EventSystem>,
    cfg: SyncConfig,
    epoch: Instant,
    inner: Mutex<SyncInner>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl StateSynchronizer {
    pub fn new(events: Arc<EventSystem>, cfg: SyncConfig) -> Arc<Self> {
        Arc::new(StateSynchronizer {
            events,
            cfg,
            epoch: Instant::now(),
            inner: Mutex::new(SyncInner::default()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.cfg
    }

    pub fn events(&self) -> &Arc<EventSystem> {
        &self.events
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis().min(u64::MAX as u128) as u64
    }

    pub fn attach(self: &Arc<Self>) -> Result<(), SyncError> {
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.is_empty() {
            return Ok(());
        }
        for channel in [CONSCIOUSNESS_SHIFT, PATTERN_EMERGENCE, GATEWAY_ACTIVATION] {
            let weak: Weak<StateSynchronizer> = Arc::downgrade(self);
            let id = self.events.subscribe(
                channel,
                move |event| {
                    if let Some(sync) = weak.upgrade() {
                        sync.apply_event(event);
                    }
                    Ok(())
                },
                SubscribeOptions::default(),
            )?;
            subscriptions.push(id);
        }
        Ok(())
    }

    pub fn detach(&self) {
        let ids: Vec<SubscriptionId> = self.subscriptions.lock().drain(..).collect();
        for id in ids {
            self.events.unsubscribe(id);
        }
    }

    /// Folds an event into the shared record. Paired copies are ignored so a
    /// change lands once.
    pub fn apply_event(&self, event: &Event) {
        if event.is_paired() {
            return;
        }
        let now_ms = self.now_ms();
        let mut inner = self.inner.lock();
        let shared = &mut inner.shared;
        match &event.payload {
            EventPayload::LevelUpdate { level } => {
                shared.level = unit_level(*level);
            }
            EventPayload::PatternActivated { pattern_id, .. }
            | EventPayload::PatternEvolved { pattern_id, .. } => {
                add_pattern(shared, pattern_id);
            }
            EventPayload::GatewayShift { gateway, level } => {
                shared
                    .gateway_levels
                    .insert(gateway.clone(), unit_level(*level));
            }
            _ => return,
        }
        shared.last_update_ms = now_ms;
    }

    pub fn register_node(&self, id: &str, role: NodeRole, initial: LocalState) -> SyncStatus {
        let now_ms = self.now_ms();
        let mut local = LocalState::default();
        local.merge(&initial);
        let mut inner = self.inner.lock();
        let node = SyncNode {
            id: id.to_string(),
            role,
            local,
            registered_ms: now_ms,
            last_sync_ms: now_ms,
        };
        fold_node(&mut inner.shared, &node, now_ms);
        inner.nodes.insert(node.id.clone(), node);
        info!(node = %id, role = %role, "state_sync.node_registered");
        inner.status()
    }

    pub fn push_to_node(&self, id: &str, partial: LocalState) -> Result<DispatchReport, SyncError> {
        let now_ms = self.now_ms();
        let (role, state, weight) = {
            let mut inner = self.inner.lock();
            let weight = inner.shared.level;
            let node = inner
                .nodes
                .get_mut(id)
                .ok_or_else(|| SyncError::UnknownNode(id.to_string()))?;
            node.local.merge(&partial);
            node.last_sync_ms = now_ms;
            (node.role, node.local.clone(), weight)
        };
        let report = self.events.emit(
            role.channel(),
            EventPayload::NodeUpdate {
                node_id: id.to_string(),
                role,
                state,
            },
            weight,
        );
        Ok(report)
    }

    pub fn reconcile(&self) -> Vec<CoherenceReport> {
        self.reconcile_at(self.now_ms())
    }

    /// Re-derives the shared record from every node whose last sync is older
    /// than the staleness threshold, then announces each restoration.
    pub fn reconcile_at(&self, now_ms: u64) -> Vec<CoherenceReport> {
        let (reports, level) = {
            let mut inner = self.inner.lock();
            let SyncInner { shared, nodes, .. } = &mut *inner;
            let mut reports = Vec::new();
            for node in nodes.values_mut() {
                let stale_for_ms = now_ms.saturating_sub(node.last_sync_ms);
                if stale_for_ms <= self.cfg.staleness_ms {
                    continue;
                }
                fold_node(shared, node, now_ms);
                node.last_sync_ms = now_ms;
                reports.push(CoherenceReport {
                    node_id: node.id.clone(),
                    role: node.role,
                    level: node.local.level.unwrap_or(shared.level),
                    stale_for_ms,
                });
            }
            inner.reconciliations += reports.len() as u64;
            (reports, inner.shared.level)
        };
        for report in &reports {
            debug!(node = %report.node_id, stale_for_ms = report.stale_for_ms, "state_sync.coherence_restored");
            self.events.emit(
                SYNC_COHERENCE,
                EventPayload::CoherenceRestored {
                    node_id: report.node_id.clone(),
                    level: report.level,
                    stale_for_ms: report.stale_for_ms,
                },
                level,
            );
        }
        reports
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.lock().status()
    }

    pub fn shared_state(&self) -> SharedState {
        self.inner.lock().shared.clone()
    }

    pub fn node(&self, id: &str) -> Option<SyncNode> {
        self.inner.lock().nodes.get(id).cloned()
    }

    pub fn nodes(&self) -> Vec<SyncNode> {
        self.inner.lock().nodes.values().cloned().collect()
    }
}

fn add_pattern(shared: &mut SharedState, pattern_id: &str) {
    if shared.active_patterns.iter().any(|p| p == pattern_id) {
        return;
    }
    shared.active_patterns.push(pattern_id.to_string());
    if shared.active_patterns.len() > MAX_ACTIVE_PATTERNS {
        let drain = shared.active_patterns.len() - MAX_ACTIVE_PATTERNS;
        shared.active_patterns.drain(0..drain);
    }
}

/// Role-specific merge of a node's local copy into the shared record.
fn fold_node(shared: &mut SharedState, node: &SyncNode, now_ms: u64) {
    let local = &node.local;
    match node.role {
        NodeRole::Webapp | NodeRole::Desktop => {
            if let Some(level) = local.level {
                shared.level = shared.level.max(unit_level(level));
            }
            for (gateway, level) in &local.gateways {
                let entry = shared.gateway_levels.entry(gateway.clone()).or_insert(0.0);
                *entry = entry.max(unit_level(*level));
            }
        }
        NodeRole::Component => {
            for pattern in &local.patterns {
                add_pattern(shared, pattern);
            }
        }
        NodeRole::Pattern => {
            for pattern in &local.patterns {
                add_pattern(shared, pattern);
            }
            if let Some(level) = local.level {
                shared.level = shared.level.max(unit_level(level));
            }
        }
    }
    shared.last_update_ms = now_ms;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::PatternKind;

    fn setup() -> Arc<StateSynchronizer> {
        let events = Arc::new(EventSystem::default());
        let sync = StateSynchronizer::new(events, SyncConfig::default());
        sync.attach().unwrap();
        sync
    }

    #[tokio::test]
    async fn level_update_is_visible_in_status() {
        let sync = setup();
        sync.events().emit(
            CONSCIOUSNESS_SHIFT,
            EventPayload::LevelUpdate { level: 0.95 },
            0.95,
        );
        assert_eq!(sync.status().global_consciousness, 0.95);
    }

    #[tokio::test]
    async fn non_finite_levels_stay_in_unit_range() {
        let sync = setup();
        sync.events().emit(
            CONSCIOUSNESS_SHIFT,
            EventPayload::LevelUpdate { level: 0.6 },
            0.6,
        );
        sync.events().emit(
            CONSCIOUSNESS_SHIFT,
            EventPayload::LevelUpdate { level: f32::NAN },
            0.5,
        );
        assert_eq!(sync.status().global_consciousness, 0.0);

        sync.events().emit(
            GATEWAY_ACTIVATION,
            EventPayload::GatewayShift {
                gateway: "crown".into(),
                level: f32::INFINITY,
            },
            0.5,
        );
        assert_eq!(sync.status().gateway_levels["crown"], 0.0);

        let raw = LocalState {
            level: Some(f32::NAN),
            ..Default::default()
        };
        sync.register_node("desk-1", NodeRole::Desktop, raw);
        assert_eq!(sync.node("desk-1").unwrap().local.level, Some(0.0));
        sync.push_to_node("desk-1", LocalState::with_level(f32::NEG_INFINITY))
            .unwrap();
        let status = sync.status();
        assert!((0.0..=1.0).contains(&status.global_consciousness));
        assert!(status.gateway_levels.values().all(|l| (0.0..=1.0).contains(l)));
    }

    #[tokio::test]
    async fn paired_copies_do_not_apply_twice() {
        let sync = setup();
        sync.events().emit(
            PATTERN_EMERGENCE,
            EventPayload::PatternActivated {
                pattern_id: "mandala-0001".into(),
                pattern_kind: PatternKind::Mandala,
            },
            0.7,
        );
        let status = sync.status();
        assert_eq!(status.active_patterns, vec!["mandala-0001"]);
    }

    #[tokio::test]
    async fn register_node_merges_immediately() {
        let sync = setup();
        sync.events()
            .emit(CONSCIOUSNESS_SHIFT, EventPayload::LevelUpdate { level: 0.4 }, None);
        let status = sync.register_node("desk-1", NodeRole::Desktop, LocalState::with_level(0.7));
        assert_eq!(status.global_consciousness, 0.7);
        assert_eq!(status.nodes, 1);

        // max, not overwrite
        let status = sync.register_node("web-1", NodeRole::Webapp, LocalState::with_level(0.2));
        assert_eq!(status.global_consciousness, 0.7);

        let component = LocalState {
            patterns: vec!["spiral-0003".into()],
            ..Default::default()
        };
        let status = sync.register_node("cmp-1", NodeRole::Component, component);
        assert_eq!(status.active_patterns, vec!["spiral-0003"]);
        assert_eq!(status.global_consciousness, 0.7);
    }

    #[tokio::test]
    async fn push_updates_local_copy_and_emits_on_role_channel() {
        let sync = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        sync.events()
            .subscribe(
                NodeRole::Webapp.channel(),
                move |event| {
                    sink.lock().push(event.clone());
                    Ok(())
                },
                SubscribeOptions::default(),
            )
            .unwrap();
        sync.register_node("web-1", NodeRole::Webapp, LocalState::default());
        let report = sync
            .push_to_node("web-1", LocalState::with_level(0.6))
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(sync.node("web-1").unwrap().local.level, Some(0.6));
        let events = seen.lock();
        assert!(matches!(
            &events[0].payload,
            EventPayload::NodeUpdate { node_id, role: NodeRole::Webapp, .. } if node_id == "web-1"
        ));
        assert_eq!(
            sync.push_to_node("ghost", LocalState::default()),
            Err(SyncError::UnknownNode("ghost".into()))
        );
    }

    #[tokio::test]
    async fn reconcile_only_touches_stale_nodes() {
        let sync = setup();
        let restored = Arc::new(Mutex::new(0usize));
        let counter = restored.clone();
        sync.events()
            .subscribe(
                SYNC_COHERENCE,
                move |_| {
                    *counter.lock() += 1;
                    Ok(())
                },
                SubscribeOptions::default(),
            )
            .unwrap();
        sync.register_node("desk-1", NodeRole::Desktop, LocalState::with_level(0.8));
        sync.events()
            .emit(CONSCIOUSNESS_SHIFT, EventPayload::LevelUpdate { level: 0.1 }, None);
        assert_eq!(sync.status().global_consciousness, 0.1);

        let registered = sync.node("desk-1").unwrap().last_sync_ms;
        assert!(sync.reconcile_at(registered + 500).is_empty());

        let reports = sync.reconcile_at(registered + 1_500);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].stale_for_ms, 1_500);
        assert_eq!(sync.node("desk-1").unwrap().last_sync_ms, registered + 1_500);
        assert_eq!(sync.status().global_consciousness, 0.8);
        assert_eq!(sync.status().reconciliations, 1);
        assert_eq!(*restored.lock(), 1);
    }

    #[tokio::test]
    async fn detach_stops_applying_events() {
        let sync = setup();
        sync.detach();
        sync.events()
            .emit(CONSCIOUSNESS_SHIFT, EventPayload::LevelUpdate { level: 0.9 }, None);
        assert_eq!(sync.status().global_consciousness, 0.0);
    }

    #[test]
    fn active_patterns_are_capped() {
        let mut shared = SharedState::default();
        for i in 0..(MAX_ACTIVE_PATTERNS + 5) {
            add_pattern(&mut shared, &format!("p-{i}"));
        }
        assert_eq!(shared.active_patterns.len(), MAX_ACTIVE_PATTERNS);
        assert_eq!(shared.active_patterns[0], "p-5");
    }
}
