use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::component::{Component, ComponentError, ComponentFactory, ComponentKind, Renderer};
use crate::config::CoreConfig;
use crate::event_system::{DispatchReport, EventError, EventSystem, EventSystemStatus};
use crate::metrics::SyncMetrics;
use crate::patterns::{Pattern, PatternError, PatternGenerator, PatternKind};
use crate::state_sync::{StateSynchronizer, SyncError, SyncStatus};
use crate::sync_loop::{spawn_sync_loop, LoopHandle};
use crate::theme::{Theme, ThemeEngine, ThemeError};
use crate::types::{
    unit_level, EventPayload, LocalState, NodeRole, COMPONENT_EVOLUTION, CONSCIOUSNESS_SHIFT,
    GATEWAY_ACTIVATION, PATTERN_EMERGENCE, THEME_TRANSITION,
};

#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Theme(#[from] ThemeError),
    #[error(transparent)]
    Component(#[from] ComponentError),
    #[error("sync loop already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InterfaceStatus {
    pub sync: SyncStatus,
    pub events: EventSystemStatus,
    pub theme: String,
    pub patterns: usize,
    pub components: usize,
    pub running: bool,
}

pub struct QuantumInterface {
    cfg: CoreConfig,
    events: Arc<EventSystem>,
    sync: Arc<StateSynchronizer>,
    patterns: Mutex<PatternGenerator>,
    themes: Mutex<ThemeEngine>,
    components: Mutex<ComponentFactory>,
    sync_loop: Mutex<Option<LoopHandle>>,
}

impl QuantumInterface {
    pub fn init(cfg: CoreConfig) -> Result<Self, InterfaceError> {
        Self::with_renderer(cfg, Box::new(crate::component::MarkupRenderer))
    }

    pub fn with_renderer(cfg: CoreConfig, renderer: Box<dyn Renderer>) -> Result<Self, InterfaceError> {
        let events = Arc::new(EventSystem::new(&cfg.events));
        let sync = StateSynchronizer::new(events.clone(), cfg.sync.clone());
        sync.attach()?;
        let mut themes = ThemeEngine::with_builtin();
        themes.set_active(&cfg.default_theme)?;
        info!(
            channels = events.channel_names().len(),
            theme = %cfg.default_theme,
            "interface.initialized"
        );
        Ok(QuantumInterface {
            patterns: Mutex::new(PatternGenerator::new(&cfg.pattern_seed)),
            themes: Mutex::new(themes),
            components: Mutex::new(ComponentFactory::new(renderer)),
            sync_loop: Mutex::new(None),
            events,
            sync,
            cfg,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    pub fn events(&self) -> &Arc<EventSystem> {
        &self.events
    }

    pub fn synchronizer(&self) -> &Arc<StateSynchronizer> {
        &self.sync
    }

    pub fn start<F, G>(&self, on_metrics: F, on_event: G) -> Result<(), InterfaceError>
    where
        F: Fn(&SyncMetrics) + Send + Sync + 'static,
        G: Fn(&str) + Send + Sync + 'static,
    {
        let mut slot = self.sync_loop.lock();
        if slot.is_some() {
            return Err(InterfaceError::AlreadyRunning);
        }
        *slot = Some(spawn_sync_loop(
            self.sync.clone(),
            self.cfg.sync.interval_ms,
            on_metrics,
            on_event,
        ));
        info!(interval_ms = self.cfg.sync.interval_ms, "interface.started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.sync_loop.lock().is_some()
    }

    pub async fn dispose(&self) {
        let handle = self.sync_loop.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
        self.sync.detach();
        info!("interface.disposed");
    }

    pub fn emit_level(&self, level: f32, weight: Option<f32>) -> DispatchReport {
        let level = unit_level(level);
        self.events.emit(
            CONSCIOUSNESS_SHIFT,
            EventPayload::LevelUpdate { level },
            weight.unwrap_or(level),
        )
    }

    pub fn emit_gateway(&self, gateway: &str, level: f32) -> DispatchReport {
        let level = unit_level(level);
        self.events.emit(
            GATEWAY_ACTIVATION,
            EventPayload::GatewayShift {
                gateway: gateway.to_string(),
                level,
            },
            level,
        )
    }

    pub fn generate_pattern(&self, kind: PatternKind, complexity: u32, weight: f32, dimensions: u32) -> Pattern {
        let pattern = self.patterns.lock().generate(kind, complexity, weight, dimensions);
        self.announce_pattern(&pattern);
        pattern
    }

    pub fn evolve_pattern(&self, id: &str, score: f32) -> Result<Pattern, InterfaceError> {
        let pattern = self.patterns.lock().evolve(id, score)?;
        self.announce_pattern(&pattern);
        Ok(pattern)
    }

    pub fn pattern(&self, id: &str) -> Option<Pattern> {
        self.patterns.lock().get(id).cloned()
    }

    pub fn set_theme(&self, name: &str) -> Result<Theme, InterfaceError> {
        let theme = self.themes.lock().set_active(name)?.clone();
        self.events.emit(
            THEME_TRANSITION,
            EventPayload::ThemeChanged {
                theme: theme.name.clone(),
                intensity: theme.intensity,
            },
            theme.intensity,
        );
        Ok(theme)
    }

    pub fn current_theme(&self) -> Theme {
        let level = self.sync.shared_state().level;
        self.themes.lock().modulated(level)
    }

    pub fn create_component(&self, kind: ComponentKind, pattern_id: &str) -> Result<Component, InterfaceError> {
        let pattern = self
            .pattern(pattern_id)
            .ok_or_else(|| PatternError::UnknownPattern(pattern_id.to_string()))?;
        let theme = self.current_theme();
        let component = self.components.lock().create(kind, &pattern, &theme);
        self.events.emit(
            COMPONENT_EVOLUTION,
            EventPayload::ComponentCreated {
                component_id: component.id.clone(),
                component_kind: component.kind,
            },
            pattern.weight,
        );
        Ok(component)
    }

    pub fn evolve_component(&self, id: &str) -> Result<Component, InterfaceError> {
        let pattern_id = self
            .components
            .lock()
            .get(id)
            .map(|c| c.pattern_id.clone())
            .ok_or_else(|| ComponentError::UnknownComponent(id.to_string()))?;
        let current = self
            .pattern(&pattern_id)
            .ok_or_else(|| PatternError::UnknownPattern(pattern_id.clone()))?;
        let pattern = if current.evolvable {
            let level = self.sync.shared_state().level;
            self.evolve_pattern(&pattern_id, level)?
        } else {
            current
        };
        let theme = self.current_theme();
        let child = self.components.lock().evolve(id, &pattern, &theme)?;
        self.events.emit(
            COMPONENT_EVOLUTION,
            EventPayload::ComponentEvolved {
                parent_id: id.to_string(),
                component_id: child.id.clone(),
            },
            pattern.weight,
        );
        Ok(child)
    }

    pub fn component(&self, id: &str) -> Option<Component> {
        self.components.lock().get(id).cloned()
    }

    pub fn entangle_components(&self, ids: &[String]) -> Result<String, InterfaceError> {
        let (group, members) = {
            let mut factory = self.components.lock();
            let group = factory.entangle(ids)?;
            let members = factory.group_members(&group);
            (group, members)
        };
        debug!(group = %group, members = members.len(), "interface.components_entangled");
        self.events.emit(
            COMPONENT_EVOLUTION,
            EventPayload::Custom {
                kind: "component:entangled".to_string(),
                data: json!({ "group": group, "members": members }),
            },
            None,
        );
        Ok(group)
    }

    pub fn register_node(&self, id: &str, role: NodeRole, initial: LocalState) -> SyncStatus {
        self.sync.register_node(id, role, initial)
    }

    pub fn push_to_node(&self, id: &str, partial: LocalState) -> Result<DispatchReport, InterfaceError> {
        Ok(self.sync.push_to_node(id, partial)?)
    }

    pub fn status(&self) -> InterfaceStatus {
        InterfaceStatus {
            sync: self.sync.status(),
            events: self.events.status(),
            theme: self.themes.lock().active().name.clone(),
            patterns: self.patterns.lock().len(),
            components: self.components.lock().len(),
            running: self.is_running(),
        }
    }

    fn announce_pattern(&self, pattern: &Pattern) {
        let payload = match &pattern.parent_id {
            Some(parent_id) => EventPayload::PatternEvolved {
                parent_id: parent_id.clone(),
                pattern_id: pattern.id.clone(),
                complexity: pattern.complexity,
                weight: pattern.weight,
            },
            None => EventPayload::PatternActivated {
                pattern_id: pattern.id.clone(),
                pattern_kind: pattern.kind,
            },
        };
        self.events.emit(PATTERN_EMERGENCE, payload, pattern.weight);
    }
}
