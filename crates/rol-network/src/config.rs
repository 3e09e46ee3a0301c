//! Deployment configuration for the host network core.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::Ipv4Net;
use rol_common::{RolError, RolPaths, RolResult};
use serde::{Deserialize, Serialize};

use crate::link::DEFAULT_MANAGED_PREFIX;
use crate::rule::Table;

/// Default uplink attached to every project bridge.
pub const DEFAULT_UPLINK: &str = "enp0s8";

/// Fixed configuration values consumed by the managers.
///
/// Every field has a default matching the reference deployment, so an
/// empty TOML document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Name prefix that marks links as managed.
    pub managed_prefix: String,
    /// Interface enslaved to project bridges.
    pub uplink_interface: String,
    /// Reserved project subnets, each an IPv4 /24.
    pub project_subnets: Vec<Ipv4Net>,
    /// Netfilter tables captured in snapshots.
    pub tracked_tables: Vec<Table>,
    /// Upper bound for a single OS primitive, in seconds.
    pub operation_timeout_secs: u64,
    /// Upper bound for waiting on the host lock, in seconds.
    pub lock_timeout_secs: u64,
    /// Root directory for persisted snapshots.
    pub state_dir: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            managed_prefix: DEFAULT_MANAGED_PREFIX.to_string(),
            uplink_interface: DEFAULT_UPLINK.to_string(),
            project_subnets: (10..=15)
                .map(|third| Ipv4Net::new([10, 10, third, 0].into(), 24))
                .collect::<Result<_, _>>()
                .unwrap_or_default(),
            tracked_tables: vec![Table::Filter, Table::Nat],
            operation_timeout_secs: 10,
            lock_timeout_secs: 30,
            state_dir: RolPaths::default().root,
        }
    }
}

impl NetworkConfig {
    /// Load and validate a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or
    /// fails validation.
    pub fn load(path: &Path) -> RolResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded network configuration");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error on a parse failure and a validation error
    /// for invalid values.
    pub fn from_toml_str(content: &str) -> RolResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_toml(&self) -> RolResult<String> {
        toml::to_string_pretty(self).map_err(|e| RolError::Serialization(e.to_string()))
    }

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the offending field.
    pub fn validate(&self) -> RolResult<()> {
        if self.managed_prefix.is_empty() {
            return Err(RolError::validation("managed_prefix", "must not be empty"));
        }
        if self.uplink_interface.is_empty() {
            return Err(RolError::validation("uplink_interface", "must not be empty"));
        }
        let mut seen = HashSet::new();
        for subnet in &self.project_subnets {
            if subnet.prefix_len() != 24 || subnet.network() != subnet.addr() {
                return Err(RolError::validation(
                    "project_subnets",
                    format!("{subnet} is not an IPv4 /24 network"),
                ));
            }
            if !seen.insert(subnet) {
                return Err(RolError::validation(
                    "project_subnets",
                    format!("{subnet} is listed twice"),
                ));
            }
        }
        if self.operation_timeout_secs == 0 {
            return Err(RolError::validation(
                "operation_timeout_secs",
                "must be greater than zero",
            ));
        }
        if self.lock_timeout_secs == 0 {
            return Err(RolError::validation(
                "lock_timeout_secs",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Set the managed prefix.
    #[must_use]
    pub fn with_managed_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.managed_prefix = prefix.into();
        self
    }

    /// Set the uplink interface.
    #[must_use]
    pub fn with_uplink_interface(mut self, uplink: impl Into<String>) -> Self {
        self.uplink_interface = uplink.into();
        self
    }

    /// Set the project subnet pool.
    #[must_use]
    pub fn with_project_subnets(mut self, subnets: Vec<Ipv4Net>) -> Self {
        self.project_subnets = subnets;
        self
    }

    /// Set the tracked netfilter tables.
    #[must_use]
    pub fn with_tracked_tables(mut self, tables: Vec<Table>) -> Self {
        self.tracked_tables = tables;
        self
    }

    /// Set the per-primitive timeout.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Set the host lock timeout.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Set the snapshot root directory.
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Per-primitive timeout.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Host lock timeout.
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Filesystem layout rooted at `state_dir`.
    #[must_use]
    pub fn paths(&self) -> RolPaths {
        RolPaths::with_root(&self.state_dir)
    }
}
