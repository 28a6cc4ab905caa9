//! Configuration management for Margin
//!
//! Handles loading and saving the TOML configuration that tunes stream
//! pacing, status rendering, terminal-status mapping and collaborator limits.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Provider tag used when a session is opened without one
    #[serde(default = "default_provider_name")]
    pub default_provider: String,
    /// Token reveal cadence
    #[serde(default)]
    pub pacing: PacingConfig,
    /// Status line rendering
    #[serde(default)]
    pub status: StatusConfig,
    /// Terminal status mapping and interruption marker
    #[serde(default)]
    pub completion: CompletionConfig,
    /// Tool execution records
    #[serde(default)]
    pub tools: ToolActivityConfig,
    /// Pending message queue
    #[serde(default)]
    pub queue: QueueConfig,
    /// Editor bridge limits
    #[serde(default)]
    pub editor: EditorConfig,
    /// General application settings
    #[serde(default)]
    pub general: GeneralConfig,
}

fn default_provider_name() -> String {
    "default".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_provider: default_provider_name(),
            pacing: PacingConfig::default(),
            status: StatusConfig::default(),
            completion: CompletionConfig::default(),
            tools: ToolActivityConfig::default(),
            queue: QueueConfig::default(),
            editor: EditorConfig::default(),
            general: GeneralConfig::default(),
        }
    }
}

/// Token pacing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Interval between two revealed tokens
    pub tick_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self { tick_ms: 30 }
    }
}

impl PacingConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// Status line configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Interval between two status line renders
    pub tick_ms: u64,
    /// Whether the backend runs with extended reasoning
    pub extended_reasoning: bool,
    /// Prefix used when extended reasoning is enabled
    pub thinking_label: String,
    /// Prefix used otherwise
    pub working_label: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            tick_ms: 250,
            extended_reasoning: false,
            thinking_label: "Thinking".to_string(),
            working_label: "Working".to_string(),
        }
    }
}

impl StatusConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    /// The clock prefix for a job
    pub fn label(&self) -> &str {
        if self.extended_reasoning {
            &self.thinking_label
        } else {
            &self.working_label
        }
    }
}

/// Outcome of normalizing a terminal status string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalStatus {
    Ok,
    Failed(String),
}

/// Terminal status mapping
///
/// The set of statuses that count as success is part of the backend API
/// contract, so it lives in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Status strings treated as `ok` (compared case-insensitively)
    pub ok_statuses: Vec<String>,
    /// Appended to the transcript when a job is interrupted
    pub interrupted_marker: String,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            ok_statuses: vec![
                "ok".to_string(),
                "success".to_string(),
                "complete".to_string(),
            ],
            interrupted_marker: "_[Interrupted by user]_".to_string(),
        }
    }
}

impl CompletionConfig {
    /// Normalize a free-form status string
    pub fn normalize(&self, status: &str) -> TerminalStatus {
        let status = status.trim();
        if self
            .ok_statuses
            .iter()
            .any(|ok| ok.eq_ignore_ascii_case(status))
        {
            TerminalStatus::Ok
        } else {
            TerminalStatus::Failed(status.to_string())
        }
    }
}

/// Tool execution record configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolActivityConfig {
    /// A running tool record flips to failed after this long
    pub execution_timeout_secs: u64,
    /// Finished or failed records are removed after this long
    pub removal_grace_secs: u64,
}

impl Default for ToolActivityConfig {
    fn default() -> Self {
        Self {
            execution_timeout_secs: 60,
            removal_grace_secs: 5,
        }
    }
}

impl ToolActivityConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn removal_grace(&self) -> Duration {
        Duration::from_secs(self.removal_grace_secs)
    }
}

/// Pending message queue configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of queued messages per session (unbounded when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pending: Option<usize>,
}

/// Editor bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Upper bound on a single editor bridge call
    pub timeout_ms: u64,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self { timeout_ms: 5000 }
    }
}

impl EditorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// General application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
        }
    }
}

/// Configuration manager for loading and saving config
pub struct ConfigManager {
    config_path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::with_path(config_path)
    }

    /// Create a config manager with a specific path
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let config = if config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            Config::default()
        };

        Ok(Self { config_path, config })
    }

    /// Get the default config path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".to_string()))?;

        Ok(config_dir.join("margin").join("config.toml"))
    }

    fn load_from_path(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Path this manager loads from and saves to
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get mutable access to configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(&self.config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&self.config_path, content)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }
}
