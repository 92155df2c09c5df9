//! Process settings for the controller daemon
//!
//! These are the operational knobs of the process itself (listen address,
//! data directory, bus device, timing), loaded from a `controller.toml`
//! file. They are distinct from the analyzer configuration record, which
//! lives in the store and is managed over the REST API.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shared::defaults::*;
use std::net::SocketAddr;
use std::path::Path;
use tracing::{debug, info};

/// Settings loaded from `controller.toml`. Every field has a default, so
/// an empty file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerSettings {
    /// Address the HTTP server binds to
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Directory holding the SQLite store
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// I2C character device the analyzer is attached to
    #[serde(default = "default_bus_device")]
    pub bus_device: String,
    /// Drive an in-process simulated analyzer instead of the hardware bus
    #[serde(default)]
    pub simulate: bool,
    /// SQLite busy timeout in seconds
    #[serde(default = "default_database_busy_timeout")]
    pub database_busy_timeout_seconds: u64,
    /// Interval between WAL checkpoints in seconds
    #[serde(default = "default_wal_checkpoint_interval")]
    pub wal_checkpoint_interval_seconds: u64,
    /// Wait time for background tasks during shutdown in seconds
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout_seconds: u64,
    /// Pause between status polls while a device action runs, milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Ceiling on a single device action before it is abandoned, seconds
    #[serde(default = "default_poll_timeout_seconds")]
    pub poll_timeout_seconds: u64,
    /// Device settle delay before a calibration factor read-back, milliseconds
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Capacity of the in-memory activity log ring
    #[serde(default = "default_activity_capacity")]
    pub activity_log_capacity: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            data_dir: default_data_dir(),
            bus_device: default_bus_device(),
            simulate: false,
            database_busy_timeout_seconds: default_database_busy_timeout(),
            wal_checkpoint_interval_seconds: default_wal_checkpoint_interval(),
            graceful_shutdown_timeout_seconds: default_graceful_shutdown_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_seconds: default_poll_timeout_seconds(),
            settle_delay_ms: default_settle_delay_ms(),
            activity_log_capacity: default_activity_capacity(),
        }
    }
}

impl ControllerSettings {
    /// Load and validate settings from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading controller settings from {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let settings: ControllerSettings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        settings
            .validate()
            .with_context(|| format!("Invalid settings in {}", path.display()))?;

        debug!("  listen_address: {}", settings.listen_address);
        debug!("  data_dir: {}", settings.data_dir);
        debug!("  bus_device: {}", settings.bus_device);
        debug!("  simulate: {}", settings.simulate);
        debug!("  poll_interval_ms: {}", settings.poll_interval_ms);
        debug!("  poll_timeout_seconds: {}", settings.poll_timeout_seconds);

        Ok(settings)
    }

    /// Semantic validation of the settings.
    pub fn validate(&self) -> Result<()> {
        self.listen_address
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address '{}'", self.listen_address))?;
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be at least 1");
        }
        if self.activity_log_capacity == 0 {
            anyhow::bail!("activity_log_capacity must be at least 1");
        }
        Ok(())
    }

    /// The parsed listen address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_address
            .parse()
            .with_context(|| format!("Invalid listen address '{}'", self.listen_address))
    }
}
