pub mod channel;
pub mod component;
pub mod config;
pub mod context;
pub mod event_system;
pub mod metrics;
pub mod patterns;
pub mod state_sync;
pub mod sync_loop;
pub mod theme;
pub mod types;

pub use channel::{ChannelStatus, HandlerError, HandlerResult};
pub use component::{Component, ComponentError, ComponentFactory, ComponentKind, MarkupRenderer, Renderer};
pub use config::{ConfigError, CoreConfig};
pub use context::{InterfaceError, InterfaceStatus, QuantumInterface};
pub use event_system::{
    DispatchReport, EventConfig, EventError, EventSystem, EventSystemStatus, SubscribeOptions,
};
pub use metrics::{analyze, SyncMetrics};
pub use patterns::{Pattern, PatternError, PatternGenerator, PatternGeometry, PatternKind};
pub use state_sync::{CoherenceReport, StateSynchronizer, SyncConfig, SyncError, SyncNode, SyncStatus};
pub use sync_loop::{run_loop, spawn_sync_loop, LoopHandle};
pub use theme::{Palette, Rgb, Theme, ThemeEngine, ThemeError};
pub use types::{
    Event, EventPayload, LocalState, NodeId, NodeRole, SharedState, SubscriptionId,
    COMPONENT_EVOLUTION, CONSCIOUSNESS_SHIFT, DEFAULT_CHANNELS, GATEWAY_ACTIVATION,
    PATTERN_EMERGENCE, SYNC_COHERENCE, THEME_TRANSITION,
};
