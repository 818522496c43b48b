//! Pipeline configuration parsing
//!
//! Reads the `[pipeline]` section of `$GENIE_HOME/config.toml`.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for config operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result type for config operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// `[pipeline]` section from config.toml
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Start sessions with the autopilot armed
    #[serde(default)]
    pub autopilot: bool,

    /// Pause composite launch runs for confirmation between steps
    #[serde(default = "default_checkpoints")]
    pub checkpoints: bool,

    /// Quiet period before a batched save (milliseconds)
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,

    /// Learning objectives requested per design
    #[serde(default = "default_objective_count")]
    pub objective_count: usize,

    /// Where project snapshots live (defaults to `$GENIE_HOME/projects`)
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            autopilot: false,
            checkpoints: default_checkpoints(),
            persist_debounce_ms: default_persist_debounce_ms(),
            objective_count: default_objective_count(),
            store_dir: None,
        }
    }
}

impl PipelineConfig {
    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    fn validate(self) -> Result<Self> {
        if self.objective_count == 0 {
            return Err(ConfigError::Invalid(
                "objective_count must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }
}

fn default_checkpoints() -> bool { true }
fn default_persist_debounce_ms() -> u64 { 1000 }
fn default_objective_count() -> usize { 5 }

/// Root config structure that may contain a [pipeline] section
#[derive(Debug, Clone, Deserialize, Default)]
struct RootConfig {
    #[serde(default)]
    pipeline: Option<PipelineConfig>,
}

/// Load pipeline configuration from a file. A missing file yields defaults.
pub fn load_pipeline_config(config_path: &Path) -> Result<PipelineConfig> {
    if !config_path.exists() {
        return Ok(PipelineConfig::default());
    }

    let content = std::fs::read_to_string(config_path)?;
    let root: RootConfig = toml::from_str(&content)?;

    root.pipeline.unwrap_or_default().validate()
}
