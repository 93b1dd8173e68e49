//! Orchestrator configuration.

use conductor_execution::{ChainSettings, EngineConfig, EventSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        /// File that was read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The contents are not a valid configuration
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Every tunable of the orchestrator. Missing sections and fields take their
/// defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Dispatch loop
    #[serde(default)]
    pub engine: EngineConfig,

    /// Chain step timing
    #[serde(default)]
    pub chains: ChainSettings,

    /// Event bus sizing
    #[serde(default)]
    pub events: EventSettings,
}

impl OrchestratorConfig {
    /// Parse from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Pretty JSON form.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
