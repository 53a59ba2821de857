use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::patterns::Pattern;
use crate::theme::Theme;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Button,
    Panel,
    Card,
    Visualizer,
    Gateway,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 5] = [
        ComponentKind::Button,
        ComponentKind::Panel,
        ComponentKind::Card,
        ComponentKind::Visualizer,
        ComponentKind::Gateway,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Button => "button",
            ComponentKind::Panel => "panel",
            ComponentKind::Card => "card",
            ComponentKind::Visualizer => "visualizer",
            ComponentKind::Gateway => "gateway",
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            ComponentKind::Button => "button",
            ComponentKind::Panel | ComponentKind::Card => "section",
            ComponentKind::Visualizer => "canvas",
            ComponentKind::Gateway => "nav",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = ComponentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ComponentKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ComponentError::UnknownKind(s.to_string()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ComponentError {
    #[error("unknown component: {0}")]
    UnknownComponent(String),
    #[error("entanglement needs at least two components, got {0}")]
    GroupTooSmall(usize),
    #[error("unknown component kind: {0}")]
    UnknownKind(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentStyle {
    pub background: String,
    pub foreground: String,
    pub border: String,
    pub glow: String,
    pub glow_radius: f32,
    pub opacity: f32,
    pub animation_ms: u32,
}

impl ComponentStyle {
    fn derive(pattern: &Pattern, theme: &Theme) -> Self {
        let palette = &theme.palette;
        ComponentStyle {
            background: palette.background.lerp(palette.primary, pattern.weight * 0.3).to_hex(),
            foreground: palette.primary.to_hex(),
            border: palette.secondary.lerp(palette.accent, pattern.weight).to_hex(),
            glow: palette.glow.to_hex(),
            glow_radius: theme.glow_radius * theme.intensity,
            opacity: 0.6 + 0.4 * pattern.weight,
            animation_ms: 4_000 - pattern.complexity as u32 * 300,
        }
    }

    fn to_css(&self) -> String {
        format!(
            "background:{};color:{};border-color:{};box-shadow:0 0 {:.1}px {};opacity:{:.2};animation-duration:{}ms",
            self.background, self.foreground, self.border, self.glow_radius, self.glow, self.opacity, self.animation_ms
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Component {
    pub id: String,
    pub kind: ComponentKind,
    pub pattern_id: String,
    pub theme: String,
    pub style: ComponentStyle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub generation: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub markup: String,
}

pub trait Renderer: Send + Sync {
    fn render(&self, component: &Component) -> String;
}

impl<F> Renderer for F
where
    F: Fn(&Component) -> String + Send + Sync,
{
    fn render(&self, component: &Component) -> String {
        self(component)
    }
}

pub struct MarkupRenderer;

impl Renderer for MarkupRenderer {
    fn render(&self, component: &Component) -> String {
        let mut attrs = format!(
            "id=\"{}\" class=\"qci-{}\" data-pattern=\"{}\" data-theme=\"{}\" data-generation=\"{}\"",
            component.id, component.kind, component.pattern_id, component.theme, component.generation
        );
        if let Some(group) = &component.group {
            attrs.push_str(&format!(" data-group=\"{group}\""));
        }
        let tag = component.kind.tag();
        format!("<{tag} {attrs} style=\"{}\"></{tag}>", component.style.to_css())
    }
}

pub struct ComponentFactory {
    renderer: Box<dyn Renderer>,
    components: HashMap<String, Component>,
    groups: BTreeMap<String, BTreeSet<String>>,
    next_component: u32,
    next_group: u32,
}

impl ComponentFactory {
    pub fn new(renderer: Box<dyn Renderer>) -> Self {
        ComponentFactory {
            renderer,
            components: HashMap::new(),
            groups: BTreeMap::new(),
            next_component: 1,
            next_group: 1,
        }
    }

    pub fn create(&mut self, kind: ComponentKind, pattern: &Pattern, theme: &Theme) -> Component {
        let id = self.next_id(kind);
        self.build(id, kind, pattern, theme, None, 0, None)
    }

    pub fn entangle(&mut self, ids: &[String]) -> Result<String, ComponentError> {
        let unique: BTreeSet<String> = ids.iter().cloned().collect();
        if unique.len() < 2 {
            return Err(ComponentError::GroupTooSmall(unique.len()));
        }
        if let Some(missing) = unique.iter().find(|id| !self.components.contains_key(*id)) {
            return Err(ComponentError::UnknownComponent(missing.clone()));
        }
        let group_id = format!("grp-{:04}", self.next_group);
        self.next_group += 1;
        for id in &unique {
            self.retag(id, Some(group_id.clone()));
        }
        self.groups.insert(group_id.clone(), unique);
        Ok(group_id)
    }

    pub fn evolve(&mut self, id: &str, pattern: &Pattern, theme: &Theme) -> Result<Component, ComponentError> {
        let parent = self
            .components
            .get(id)
            .cloned()
            .ok_or_else(|| ComponentError::UnknownComponent(id.to_string()))?;
        let child_id = self.next_id(parent.kind);
        let child = self.build(
            child_id,
            parent.kind,
            pattern,
            theme,
            parent.group.clone(),
            parent.generation + 1,
            Some(parent.id.clone()),
        );
        if let Some(group) = &parent.group {
            if let Some(members) = self.groups.get_mut(group) {
                members.insert(child.id.clone());
            }
        }
        Ok(child)
    }

    pub fn get(&self, id: &str) -> Option<&Component> {
        self.components.get(id)
    }

    pub fn group_members(&self, group_id: &str) -> Vec<String> {
        self.groups
            .get(group_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    fn next_id(&mut self, kind: ComponentKind) -> String {
        let id = format!("{}-{:04}", kind.as_str(), self.next_component);
        self.next_component += 1;
        id
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        &mut self,
        id: String,
        kind: ComponentKind,
        pattern: &Pattern,
        theme: &Theme,
        group: Option<String>,
        generation: u32,
        parent_id: Option<String>,
    ) -> Component {
        let mut component = Component {
            id,
            kind,
            pattern_id: pattern.id.clone(),
            theme: theme.name.clone(),
            style: ComponentStyle::derive(pattern, theme),
            group,
            generation,
            parent_id,
            markup: String::new(),
        };
        component.markup = self.renderer.render(&component);
        self.components.insert(component.id.clone(), component.clone());
        component
    }

    fn retag(&mut self, id: &str, group: Option<String>) {
        let Some(component) = self.components.get_mut(id) else {
            return;
        };
        if let Some(previous) = component.group.take() {
            if let Some(members) = self.groups.get_mut(&previous) {
                members.remove(id);
            }
        }
        component.group = group;
        component.markup = self.renderer.render(component);
    }
}

impl Default for ComponentFactory {
    fn default() -> Self {
        Self::new(Box::new(MarkupRenderer))
    }
}
