//! Configuration and the broker attribute store
//!
//! A [`FleetConfig`] is read from TOML:
//!
//! ```toml
//! rank = 0
//! size = 4
//! hostlist = "node[0-3]"
//! eventlog = "/var/lib/fleetmon/resource.eventlog"
//! log_level = "info"
//!
//! [monitor]
//! force_up = false
//! systemd_enable = false
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, FleetResult};
use crate::types::Rank;

/// Attribute holding this process's rank
pub const ATTR_RANK: &str = "rank";
/// Attribute holding the instance size
pub const ATTR_SIZE: &str = "size";
/// Attribute holding the fleet host list
pub const ATTR_HOSTLIST: &str = "hostlist";
/// Attribute present only when the instance runs in recovery mode
pub const ATTR_RECOVERY_MODE: &str = "broker.recovery-mode";

/// Read-only key/value lookup
pub trait AttrStore {
    /// Value of `key`, if set
    fn get(&self, key: &str) -> Option<&str>;
}

/// Attribute store backed by a map
#[derive(Debug, Clone, Default)]
pub struct Attributes {
    values: HashMap<String, String>,
}

impl Attributes {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Remove `key`
    pub fn unset(&mut self, key: &str) {
        self.values.remove(key);
    }
}

impl AttrStore for Attributes {
    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Monitor options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Start with every rank up and do not watch groups
    pub force_up: bool,
    /// Watch `sdmon.online` instead of `broker.online`
    pub systemd_enable: bool,
}

/// Top level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Rank of this process
    pub rank: Rank,
    /// Number of ranks in the instance
    pub size: u32,
    /// Number of ranks in the resource inventory, 0 if not yet known
    pub inventory_size: u32,
    /// Host list recorded in the restart event
    pub hostlist: String,
    /// Run in recovery mode
    pub recovery_mode: bool,
    /// Event log file
    pub eventlog: Option<PathBuf>,
    /// Default log filter
    pub log_level: String,
    /// Monitor options
    pub monitor: MonitorConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            size: 1,
            inventory_size: 0,
            hostlist: "localhost".to_string(),
            recovery_mode: false,
            eventlog: None,
            log_level: "info".to_string(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Parse and validate TOML text
    pub fn from_toml(text: &str) -> FleetResult<Self> {
        let config: FleetConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> FleetResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }

    /// Check that rank and size are consistent
    pub fn validate(&self) -> FleetResult<()> {
        if self.size == 0 {
            return Err(FleetError::Config("size must be at least 1".to_string()));
        }
        if self.rank >= self.size {
            return Err(FleetError::Config(format!(
                "rank {} is outside instance of size {}",
                self.rank, self.size
            )));
        }
        Ok(())
    }

    /// Attribute store describing this instance
    pub fn attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs
            .set(ATTR_RANK, self.rank.to_string())
            .set(ATTR_SIZE, self.size.to_string())
            .set(ATTR_HOSTLIST, self.hostlist.clone());
        if self.recovery_mode {
            attrs.set(ATTR_RECOVERY_MODE, "1");
        }
        attrs
    }
}
