use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::component::ComponentKind;
use crate::patterns::PatternKind;

pub type SubscriptionId = u64;
pub type NodeId = String;

pub const CONSCIOUSNESS_SHIFT: &str = "consciousness:shift";
pub const PATTERN_EMERGENCE: &str = "pattern:emergence";
pub const THEME_TRANSITION: &str = "theme:transition";
pub const COMPONENT_EVOLUTION: &str = "component:evolution";
pub const GATEWAY_ACTIVATION: &str = "gateway:activation";
pub const SYNC_COHERENCE: &str = "sync:coherence";

pub const DEFAULT_CHANNELS: &[&str] = &[
    CONSCIOUSNESS_SHIFT,
    PATTERN_EMERGENCE,
    THEME_TRANSITION,
    COMPONENT_EVOLUTION,
    GATEWAY_ACTIVATION,
    SYNC_COHERENCE,
    "sync:webapp",
    "sync:desktop",
    "sync:component",
    "sync:pattern",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Webapp,
    Desktop,
    Component,
    Pattern,
}

impl NodeRole {
    pub const ALL: [NodeRole; 4] = [
        NodeRole::Webapp,
        NodeRole::Desktop,
        NodeRole::Component,
        NodeRole::Pattern,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Webapp => "webapp",
            NodeRole::Desktop => "desktop",
            NodeRole::Component => "component",
            NodeRole::Pattern => "pattern",
        }
    }

    pub fn channel(&self) -> &'static str {
        match self {
            NodeRole::Webapp => "sync:webapp",
            NodeRole::Desktop => "sync:desktop",
            NodeRole::Component => "sync:component",
            NodeRole::Pattern => "sync:pattern",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "webapp" | "web" => Ok(NodeRole::Webapp),
            "desktop" => Ok(NodeRole::Desktop),
            "component" => Ok(NodeRole::Component),
            "pattern" => Ok(NodeRole::Pattern),
            other => Err(format!("unknown node role: {other}")),
        }
    }
}

/// Clamps into `0.0..=1.0`; NaN and infinities become `0.0`.
pub fn unit_level(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LocalState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub gateways: BTreeMap<String, f32>,
}

impl LocalState {
    pub fn with_level(level: f32) -> Self {
        LocalState {
            level: Some(unit_level(level)),
            ..Default::default()
        }
    }

    /// Level overwrites, patterns union, gateways overwrite per key.
    pub fn merge(&mut self, partial: &LocalState) {
        if let Some(level) = partial.level {
            self.level = Some(unit_level(level));
        }
        for pattern in &partial.patterns {
            if !self.patterns.contains(pattern) {
                self.patterns.push(pattern.clone());
            }
        }
        for (gateway, level) in &partial.gateways {
            self.gateways.insert(gateway.clone(), unit_level(*level));
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SharedState {
    pub level: f32,
    pub active_patterns: Vec<String>,
    pub gateway_levels: BTreeMap<String, f32>,
    pub last_update_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    LevelUpdate {
        level: f32,
    },
    PatternActivated {
        pattern_id: String,
        pattern_kind: PatternKind,
    },
    PatternEvolved {
        parent_id: String,
        pattern_id: String,
        complexity: u8,
        weight: f32,
    },
    GatewayShift {
        gateway: String,
        level: f32,
    },
    ThemeChanged {
        theme: String,
        intensity: f32,
    },
    ComponentCreated {
        component_id: String,
        component_kind: ComponentKind,
    },
    ComponentEvolved {
        parent_id: String,
        component_id: String,
    },
    NodeUpdate {
        node_id: NodeId,
        role: NodeRole,
        state: LocalState,
    },
    CoherenceRestored {
        node_id: NodeId,
        level: f32,
        stale_for_ms: u64,
    },
    Custom {
        kind: String,
        #[serde(default)]
        data: JsonValue,
    },
}

impl EventPayload {
    pub fn kind(&self) -> &str {
        match self {
            EventPayload::LevelUpdate { .. } => "level:update",
            EventPayload::PatternActivated { .. } => "pattern:activated",
            EventPayload::PatternEvolved { .. } => "pattern:evolved",
            EventPayload::GatewayShift { .. } => "gateway:shift",
            EventPayload::ThemeChanged { .. } => "theme:changed",
            EventPayload::ComponentCreated { .. } => "component:created",
            EventPayload::ComponentEvolved { .. } => "component:evolved",
            EventPayload::NodeUpdate { .. } => "node:update",
            EventPayload::CoherenceRestored { .. } => "coherence:restored",
            EventPayload::Custom { kind, .. } => kind,
        }
    }

    /// Builds the typed variant named by `kind` from its JSON fields; kinds
    /// without a variant become `Custom`.
    pub fn from_kind(kind: &str, data: JsonValue) -> Result<Self, serde_json::Error> {
        if !TYPED_KINDS.contains(&kind) {
            return Ok(EventPayload::Custom {
                kind: kind.to_string(),
                data,
            });
        }
        let mut fields = match data {
            JsonValue::Object(fields) => fields,
            JsonValue::Null => serde_json::Map::new(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "{kind} expects a json object, got {other}"
                )))
            }
        };
        fields.insert("type".into(), JsonValue::String(kind.replace(':', "_")));
        serde_json::from_value(JsonValue::Object(fields))
    }
}

const TYPED_KINDS: &[&str] = &[
    "level:update",
    "pattern:activated",
    "pattern:evolved",
    "gateway:shift",
    "theme:changed",
    "component:created",
    "component:evolved",
    "node:update",
    "coherence:restored",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub channel: String,
    pub kind: String,
    pub payload: EventPayload,
    pub weight: f32,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair_id: Option<String>,
}

impl Event {
    pub fn is_paired(&self) -> bool {
        self.pair_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overwrites_level_and_unions_patterns() {
        let mut local = LocalState {
            level: Some(0.3),
            patterns: vec!["mandala-0001".into()],
            gateways: BTreeMap::from([("heart".to_string(), 0.2)]),
        };
        let partial = LocalState {
            level: Some(1.4),
            patterns: vec!["mandala-0001".into(), "spiral-0002".into()],
            gateways: BTreeMap::from([("heart".to_string(), 0.7)]),
        };
        local.merge(&partial);
        assert_eq!(local.level, Some(1.0));
        assert_eq!(local.patterns, vec!["mandala-0001", "spiral-0002"]);
        assert_eq!(local.gateways["heart"], 0.7);
    }

    #[test]
    fn non_finite_levels_are_zeroed() {
        assert_eq!(LocalState::with_level(f32::NAN).level, Some(0.0));
        let mut local = LocalState::with_level(0.5);
        local.merge(&LocalState {
            level: Some(f32::INFINITY),
            patterns: Vec::new(),
            gateways: BTreeMap::from([("root".to_string(), f32::NAN)]),
        });
        assert_eq!(local.level, Some(0.0));
        assert_eq!(local.gateways["root"], 0.0);
        assert_eq!(unit_level(-3.0), 0.0);
        assert_eq!(unit_level(0.25), 0.25);
    }

    #[test]
    fn payload_kind_follows_variant() {
        let payload = EventPayload::LevelUpdate { level: 0.4 };
        assert_eq!(payload.kind(), "level:update");
        let custom = EventPayload::Custom {
            kind: "ui:ripple".into(),
            data: JsonValue::Null,
        };
        assert_eq!(custom.kind(), "ui:ripple");
    }

    #[test]
    fn known_kinds_build_typed_payloads() {
        let payload = EventPayload::from_kind("level:update", serde_json::json!({ "level": 0.95 })).unwrap();
        assert_eq!(payload, EventPayload::LevelUpdate { level: 0.95 });
        let payload = EventPayload::from_kind(
            "gateway:shift",
            serde_json::json!({ "gateway": "heart", "level": 0.4 }),
        )
        .unwrap();
        assert_eq!(payload.kind(), "gateway:shift");

        let custom = EventPayload::from_kind("ui:ripple", serde_json::json!({ "x": 1 })).unwrap();
        assert_eq!(
            custom,
            EventPayload::Custom {
                kind: "ui:ripple".into(),
                data: serde_json::json!({ "x": 1 }),
            }
        );

        assert!(EventPayload::from_kind("level:update", JsonValue::Null).is_err());
        assert!(EventPayload::from_kind("level:update", serde_json::json!([0.5])).is_err());
    }

    #[test]
    fn role_parses_and_maps_to_channel() {
        let role: NodeRole = "Desktop".parse().unwrap();
        assert_eq!(role, NodeRole::Desktop);
        assert_eq!(role.channel(), "sync:desktop");
        assert!("kiosk".parse::<NodeRole>().is_err());
    }
}
