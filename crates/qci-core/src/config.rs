use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event_system::EventConfig;
use crate::state_sync::SyncConfig;
use crate::theme::DEFAULT_THEME;

pub const DEFAULT_PATTERN_SEED: &str = "quantum-consciousness";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoreConfig {
    pub events: EventConfig,
    pub sync: SyncConfig,
    pub pattern_seed: String,
    pub default_theme: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            events: EventConfig::default(),
            sync: SyncConfig::default(),
            pattern_seed: DEFAULT_PATTERN_SEED.to_string(),
            default_theme: DEFAULT_THEME.to_string(),
        }
    }
}

impl CoreConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(CoreConfig::default());
        }
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }
}
