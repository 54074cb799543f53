//! Platform configuration
//!
//! Defaults match the constants in `robot_link_shared::timing`. A TOML file
//! may override any subset of fields:
//!
//! ```toml
//! workspace_root = "/usr/local/platform"
//! ws_addr = "0.0.0.0:5467"
//! ble_enabled = false
//! ```

use crate::transport::websocket;
use anyhow::{Context, Result};
use robot_link_shared::timing;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an alternate config file
pub const CONFIG_ENV: &str = "ROBOT_LINK_CONFIG";

/// Config file picked up from the working directory when present
pub const DEFAULT_CONFIG_FILE: &str = "platform.toml";

/// Configuration for the control plane process
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Directory holding `manifest.json`, `projects/` and `pyenvs/`
    pub workspace_root: PathBuf,
    /// WebSocket listen address
    pub ws_addr: String,
    /// Run the BLE GATT server
    pub ble_enabled: bool,
    /// Advertised name when the manifest has none
    pub default_name: String,
    /// Kill the running program after this long without a heartbeat
    pub heartbeat_timeout_ms: u64,
    /// Watchdog poll period
    pub watchdog_interval_ms: u64,
    /// Idle time after which partial BLE messages are dropped
    pub fragment_staleness_ms: u64,
    /// Device model module inside each project directory
    pub model_file: String,
    /// Pending commands the dispatcher queue holds before callers wait
    pub dispatcher_queue: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            ws_addr: websocket::DEFAULT_ADDR.into(),
            ble_enabled: true,
            default_name: "robot".into(),
            heartbeat_timeout_ms: timing::HEARTBEAT_TIMEOUT_MS,
            watchdog_interval_ms: timing::WATCHDOG_INTERVAL_MS,
            fragment_staleness_ms: timing::FRAGMENT_STALENESS_MS,
            model_file: "robot.toml".into(),
            dispatcher_queue: 64,
        }
    }
}

impl PlatformConfig {
    /// Parse a config from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("invalid platform config")?;
        Ok(config)
    }

    /// Read a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&text)
    }

    /// Load from `$ROBOT_LINK_CONFIG`, else `./platform.toml`, else defaults
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from_file(Path::new(&path));
        }

        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.is_file() {
            return Self::from_file(local);
        }

        Ok(Self::default())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn fragment_staleness(&self) -> Duration {
        Duration::from_millis(self.fragment_staleness_ms)
    }
}
