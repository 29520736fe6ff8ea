//! Persisted render settings.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/notebook-render/settings.json
//! - Linux: ~/.config/notebook-render/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\notebook-render\settings.json

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::launch::{LaunchOptions, ToolCommand, DEFAULT_TOOL_MODULE};
use crate::port::{PortRange, DEFAULT_MAX_ATTEMPTS, DEFAULT_PORT_RANGE};
use crate::session::SessionConfig;
use crate::supervisor::{ReadinessPolicy, SupervisorConfig};

/// User-editable render settings. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Interpreter that runs the tool module. Falls back to `python3`.
    pub python_path: Option<PathBuf>,
    pub tool_module: String,
    pub strip_sources: bool,
    pub show_tracebacks: bool,
    pub max_wait_secs: u64,
    pub poll_interval_ms: u64,
    pub readiness: ReadinessPolicy,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub port_max_attempts: u32,
    pub stop_grace_ms: u64,
    pub stop_timeout_ms: u64,
    /// Directory for the managed artifact. A temporary one when unset.
    pub work_dir: Option<PathBuf>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        let launch = LaunchOptions::default();
        Self {
            python_path: None,
            tool_module: DEFAULT_TOOL_MODULE.to_string(),
            strip_sources: launch.strip_sources,
            show_tracebacks: launch.show_tracebacks,
            max_wait_secs: 30,
            poll_interval_ms: 100,
            readiness: ReadinessPolicy::default(),
            port_range_start: DEFAULT_PORT_RANGE.start,
            port_range_end: DEFAULT_PORT_RANGE.end,
            port_max_attempts: DEFAULT_MAX_ATTEMPTS,
            stop_grace_ms: 2000,
            stop_timeout_ms: 5000,
            work_dir: None,
        }
    }
}

impl From<&RenderSettings> for SessionConfig {
    fn from(settings: &RenderSettings) -> Self {
        let defaults = SupervisorConfig::default();
        Self {
            supervisor: SupervisorConfig {
                tool: ToolCommand::python_module(
                    settings.python_path.as_deref(),
                    &settings.tool_module,
                ),
                options: LaunchOptions {
                    strip_sources: settings.strip_sources,
                    show_tracebacks: settings.show_tracebacks,
                },
                max_wait: Duration::from_secs(settings.max_wait_secs),
                // A zero interval would spin the probe loop
                poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
                readiness: settings.readiness,
                stop_grace: Duration::from_millis(settings.stop_grace_ms),
                stop_timeout: Duration::from_millis(settings.stop_timeout_ms),
                working_dir: settings.work_dir.clone(),
                ..defaults
            },
            port_range: PortRange::new(settings.port_range_start, settings.port_range_end),
            port_max_attempts: settings.port_max_attempts,
            work_dir: settings.work_dir.clone(),
        }
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("notebook-render")
        .join("settings.json")
}

/// Load settings from `path`, returning defaults if it is missing or unreadable.
pub fn load_settings_from(path: &Path) -> RenderSettings {
    if !path.exists() {
        return RenderSettings::default();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!("[settings] Ignoring invalid {}: {}", path.display(), e);
            RenderSettings::default()
        }),
        Err(e) => {
            warn!("[settings] Failed to read {}: {}", path.display(), e);
            RenderSettings::default()
        }
    }
}

/// Load settings from disk, returning defaults if file doesn't exist
pub fn load_settings() -> RenderSettings {
    load_settings_from(&settings_path())
}

pub fn save_settings_to(settings: &RenderSettings, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

/// Save settings to disk
pub fn save_settings(settings: &RenderSettings) -> Result<()> {
    save_settings_to(settings, &settings_path())
}
