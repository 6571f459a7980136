//! Configuration file support
//!
//! Configuration is loaded from TOML. Every section is optional; missing
//! keys take their defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::{CaptureConfig, DecoderConfig, LanesConfig};
use crate::error::{FlowSplitError, Result};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where packets come from
    pub capture: CaptureConfig,

    /// Lane count, split criterion and output modes
    pub lanes: LanesConfig,

    /// External decoder used when decoding is enabled
    pub decoder: DecoderConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            FlowSplitError::Config(format!("Failed to read config file: {}", e))
        })?;
        let mut config = Self::from_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| FlowSplitError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Serialize configuration to a TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| FlowSplitError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(path.as_ref(), content).map_err(|e| {
            FlowSplitError::Config(format!("Failed to write config file: {}", e))
        })
    }

    /// Apply environment variable overrides.
    ///
    /// Supported environment variables:
    /// - FLOWSPLIT_DECODER_CMD
    /// - FLOWSPLIT_OUTPUT_DIR
    /// - FLOWSPLIT_LANES
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FLOWSPLIT_DECODER_CMD") {
            self.decoder.command = v;
        }
        if let Ok(v) = std::env::var("FLOWSPLIT_OUTPUT_DIR") {
            self.lanes.output_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FLOWSPLIT_LANES") {
            match v.parse() {
                Ok(n) => self.lanes.count = n,
                Err(_) => tracing::warn!(value = %v, "Ignoring invalid FLOWSPLIT_LANES"),
            }
        }
    }

    /// Reject configurations that cannot run at all
    pub fn validate(&self) -> Result<()> {
        if self.lanes.count == 0 {
            return Err(FlowSplitError::ZeroLanes);
        }
        if self.lanes.decode && self.decoder.command.trim().is_empty() {
            return Err(FlowSplitError::Config(
                "decoding enabled but no decoder command configured".into(),
            ));
        }
        Ok(())
    }
}
