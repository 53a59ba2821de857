use serde::{Deserialize, Serialize};

use crate::state_sync::{SyncNode, SyncStatus};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SyncMetrics {
    pub nodes: usize,
    pub stale_pct: f32,
    pub level: f32,
    pub active_patterns: usize,
    pub gateway_avg: f32,
    /// Display-only blend of level and node freshness.
    pub coherence: f32,
}

pub fn analyze(status: &SyncStatus, nodes: &[SyncNode], now_ms: u64, staleness_ms: u64) -> SyncMetrics {
    let gateway_avg = if status.gateway_levels.is_empty() {
        0.0
    } else {
        status.gateway_levels.values().sum::<f32>() / status.gateway_levels.len() as f32
    };
    let stale = nodes
        .iter()
        .filter(|node| now_ms.saturating_sub(node.last_sync_ms) > staleness_ms)
        .count();
    let stale_pct = if nodes.is_empty() {
        0.0
    } else {
        stale as f32 / nodes.len() as f32
    };
    let freshness = 1.0 - stale_pct;
    let coherence = (status.global_consciousness * 0.6 + freshness * 0.3 + gateway_avg * 0.1).clamp(0.0, 1.0);
    SyncMetrics {
        nodes: nodes.len(),
        stale_pct,
        level: status.global_consciousness,
        active_patterns: status.active_patterns.len(),
        gateway_avg,
        coherence,
    }
}
