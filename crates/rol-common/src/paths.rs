//! Standard filesystem paths for ROL.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for ROL data.
pub static ROL_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("ROL_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/rol"))
});

/// Standard paths used by the ROL backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolPaths {
    /// Root data directory (default: /var/lib/rol).
    pub root: PathBuf,
}

impl RolPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory for host network configuration snapshots.
    #[must_use]
    pub fn network(&self) -> PathBuf {
        self.root.join("network")
    }

    /// Saved (last-known-good) network configuration.
    #[must_use]
    pub fn saved_configuration(&self) -> PathBuf {
        self.network().join("saved.json")
    }

    /// Backup network configuration (the save before the last one).
    #[must_use]
    pub fn backup_configuration(&self) -> PathBuf {
        self.network().join("backup.json")
    }
}

impl Default for RolPaths {
    fn default() -> Self {
        Self {
            root: ROL_ROOT.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = RolPaths::with_root("/tmp/rol-test");
        assert_eq!(paths.root, PathBuf::from("/tmp/rol-test"));
        assert_eq!(
            paths.saved_configuration(),
            PathBuf::from("/tmp/rol-test/network/saved.json")
        );
        assert_eq!(
            paths.backup_configuration(),
            PathBuf::from("/tmp/rol-test/network/backup.json")
        );
    }

    #[test]
    fn slots_share_directory() {
        let paths = RolPaths::with_root("/srv/rol");
        assert_eq!(
            paths.saved_configuration().parent(),
            paths.backup_configuration().parent()
        );
        assert_eq!(paths.network(), PathBuf::from("/srv/rol/network"));
    }
}
