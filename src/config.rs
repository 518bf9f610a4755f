//! Service configuration
//!
//! Every tunable in one place. Loaded from TOML at startup, falls back to
//! defaults for anything missing. Environment variables override the file,
//! command-line flags override both.

use anyhow::Context;
use aurabridge_acquisition::{validate_participant, ControllerConfig};
use aurabridge_core::{CameraConfig, GatewayConfig, SessionConfig, SourceConfig, WorkerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_OUTPUT: &str = "AURABRIDGE_OUTPUT";
pub const ENV_PARTICIPANT: &str = "AURABRIDGE_PARTICIPANT";
pub const ENV_PORT: &str = "AURABRIDGE_PORT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Control channel listener.
    pub gateway: GatewayConfig,
    /// Output root and initial participant.
    pub session: SessionConfig,
    /// Stop timeout and poll interval for signal workers.
    pub workers: WorkerConfig,
    /// Shared capture device.
    pub camera: CameraConfig,
    pub sources: SourceConfig,
}

impl AppConfig {
    /// Load from a TOML file, falling back to defaults when it is missing or invalid.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match Self::from_toml(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {:#}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!("No config at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("invalid config")
    }

    /// Render as TOML (for generating a starter config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Apply `AURABRIDGE_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(output) = lookup(ENV_OUTPUT).filter(|v| !v.is_empty()) {
            self.session.output_root = PathBuf::from(output);
        }
        if let Some(participant) = lookup(ENV_PARTICIPANT).filter(|v| !v.is_empty()) {
            self.session.participant = participant;
        }
        if let Some(port) = lookup(ENV_PORT) {
            match port.parse() {
                Ok(port) => self.gateway.port = port,
                Err(_) => tracing::warn!("Ignoring invalid {}={}", ENV_PORT, port),
            }
        }
    }

    /// Reject settings the controller cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_participant(&self.session.participant)
            .with_context(|| format!("participant {:?}", self.session.participant))?;
        Ok(())
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            session: self.session.clone(),
            workers: self.workers.clone(),
            camera: self.camera.clone(),
        }
    }
}
