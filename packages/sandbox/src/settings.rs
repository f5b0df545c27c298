// ABOUTME: Lifecycle defaults for sandbox runs
// ABOUTME: Timeouts, app port, setup and start commands, probe policy and volume mount

use crate::exposure::ExposureKind;
use crate::readiness::ProbePolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxSettings {
    // Lifetime
    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,

    // Guest application
    pub app_port: u16,
    /// Where project content lands inside each sandbox
    pub workdir: String,
    pub setup_commands: Vec<String>,
    pub start_command: String,

    pub probe: ProbePolicy,
    pub default_exposure: ExposureKind,

    // Shared volume
    pub volume_host_path: Option<String>,
    pub volume_mount_path: String,

    pub monitor_interval_secs: u64,
    /// How long terminated records stay listable before the sweep drops them
    pub retention_secs: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: 1800,
            max_timeout_secs: 7200,
            app_port: 3000,
            workdir: "/app".to_string(),
            setup_commands: vec!["npm install".to_string(), "npm run build".to_string()],
            start_command: "npm run start -- -p 3000 --hostname 0.0.0.0".to_string(),
            probe: ProbePolicy::default(),
            default_exposure: ExposureKind::Native,
            volume_host_path: None,
            volume_mount_path: "/sandbox".to_string(),
            monitor_interval_secs: 30,
            retention_secs: 3600,
        }
    }
}

impl SandboxSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |field: &'static str, reason: &str| SettingsError::Invalid {
            field,
            reason: reason.to_string(),
        };

        if self.default_timeout_secs == 0 {
            return Err(invalid("default_timeout_secs", "must be positive"));
        }
        if self.max_timeout_secs < self.default_timeout_secs {
            return Err(invalid(
                "max_timeout_secs",
                "must not be below default_timeout_secs",
            ));
        }
        if self.app_port == 0 {
            return Err(invalid("app_port", "must be positive"));
        }
        if !self.workdir.starts_with('/') || self.workdir == "/" {
            return Err(invalid("workdir", "must be an absolute path below /"));
        }
        if self.start_command.trim().is_empty() {
            return Err(invalid("start_command", "must not be empty"));
        }
        if self.probe.max_attempts == 0 {
            return Err(invalid("probe.max_attempts", "must be positive"));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Clamp a requested lifetime into `1..=max_timeout_secs` seconds
    pub fn clamp_timeout(&self, requested: Option<Duration>) -> Duration {
        let secs = requested
            .map(|d| d.as_secs())
            .unwrap_or(self.default_timeout_secs);
        Duration::from_secs(secs.clamp(1, self.max_timeout_secs))
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}
