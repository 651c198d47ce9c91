//! Configuration management
//!
//! Handles loading, validation, and merging of configuration from:
//! - TOML files
//! - CLI arguments

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::DEFAULT_CHUNK_SIZE;

/// Smallest chunked-transfer chunk we accept.
pub const MIN_CHUNK_SIZE: usize = 1024;
/// Largest chunked-transfer chunk we accept.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Default location for the config file.
///
/// XDG config dir when available, falling back to /etc.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir().map_or_else(
        || PathBuf::from("/etc/xseld/config.toml"),
        |d| d.join("xseld/config.toml"),
    )
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Selections to track, by atom name.
    pub selections: Vec<String>,
    /// Chunked-transfer chunk size in bytes.
    pub chunk_size: usize,
    /// Claim tracked selections at startup instead of waiting for a trigger.
    pub claim_on_start: bool,
    /// Primary data target offered when a payload is available.
    pub native_target: String,
}

/// Payload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadConfig {
    /// Directory where received payloads are written and served payloads
    /// are read from. `None` means the current working directory.
    pub dir: Option<PathBuf>,
    /// Text served for string targets.
    pub text: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log output format: pretty, compact, json
    pub format: String,
    /// Optional log file path (logs to stdout when unset)
    pub file: Option<String>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Engine configuration
    pub engine: EngineConfig,
    /// Payload configuration
    #[serde(default = "default_payload")]
    pub payload: PayloadConfig,
    /// Logging configuration
    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,
}

fn default_payload() -> PayloadConfig {
    PayloadConfig {
        dir: None,
        text: "Copy & Paste test".to_string(),
    }
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: "info".to_string(),
        format: "pretty".to_string(),
        file: None,
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &str) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).context(format!("Failed to read config file: {path}"))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Create default configuration
    pub fn default_config() -> Self {
        Config {
            engine: EngineConfig {
                selections: vec!["PRIMARY".to_string(), "CLIPBOARD".to_string()],
                chunk_size: DEFAULT_CHUNK_SIZE,
                claim_on_start: false,
                native_target: "image/png".to_string(),
            },
            payload: default_payload(),
            logging: default_logging(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.engine.selections.is_empty() {
            anyhow::bail!("At least one selection must be tracked");
        }
        for name in &self.engine.selections {
            if name.is_empty() || name.contains(char::is_whitespace) {
                anyhow::bail!("Invalid selection name: {name:?}");
            }
        }

        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.engine.chunk_size) {
            anyhow::bail!(
                "chunk_size ({}) must be between {MIN_CHUNK_SIZE} and {MAX_CHUNK_SIZE}",
                self.engine.chunk_size
            );
        }

        if self.engine.native_target.is_empty() {
            anyhow::bail!("native_target cannot be empty");
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Invalid log level: {}", self.logging.level),
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" | "json" => {}
            _ => anyhow::bail!("Invalid log format: {}", self.logging.format),
        }

        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(
        mut self,
        selections: Option<Vec<String>>,
        chunk_size: Option<usize>,
        claim_on_start: bool,
    ) -> Self {
        if let Some(selections) = selections {
            self.engine.selections = selections;
        }
        if let Some(chunk_size) = chunk_size {
            self.engine.chunk_size = chunk_size;
        }
        if claim_on_start {
            self.engine.claim_on_start = true;
        }

        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
