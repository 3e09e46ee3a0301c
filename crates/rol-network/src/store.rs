//! Saved and backup network configuration slots.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use rol_common::{ResultExt, RolError, RolPaths, RolResult};

use crate::config::NetworkConfig;
use crate::link::LinkNaming;
use crate::mutator::SharedHost;
use crate::snapshot::{NetworkSnapshot, SnapshotScope};

/// Persists the last-known-good configuration and one backup generation.
///
/// The backup always lags the saved slot by exactly one save. Restore and
/// reset that fail part-way leave the host in an undefined state; they are
/// never retried.
#[async_trait]
pub trait ConfigurationStore: Send + Sync {
    /// Move the saved slot into the backup slot and capture the live state
    /// into the saved slot.
    async fn save_configuration(&self) -> RolResult<()>;

    /// Apply the backup slot to the host; it becomes the saved slot.
    async fn restore_from_backup(&self) -> RolResult<()>;

    /// Re-apply the saved slot, discarding unsaved live changes.
    async fn reset_changes(&self) -> RolResult<()>;

    /// Compare the live state against the saved slot.
    async fn has_unsaved_changes(&self) -> RolResult<bool>;
}

#[derive(Debug, Clone)]
struct Slots {
    saved: NetworkSnapshot,
    backup: Option<NetworkSnapshot>,
}

/// [`ConfigurationStore`] backed by two JSON files.
///
/// Both slots are kept in memory and mirrored to
/// `<root>/network/saved.json` and `<root>/network/backup.json`. Files are
/// replaced atomically through a temporary file in the same directory.
pub struct FileConfigurationStore {
    host: SharedHost,
    scope: SnapshotScope,
    saved_path: PathBuf,
    backup_path: PathBuf,
    slots: Mutex<Slots>,
}

impl std::fmt::Debug for FileConfigurationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileConfigurationStore")
            .field("saved_path", &self.saved_path)
            .field("backup_path", &self.backup_path)
            .finish_non_exhaustive()
    }
}

impl FileConfigurationStore {
    /// Open the store, loading existing slots.
    ///
    /// A missing saved slot is initialised from the live state so that
    /// [`ConfigurationStore::reset_changes`] is always defined.
    ///
    /// # Errors
    ///
    /// Returns an error if a slot file cannot be read or parsed, or if the
    /// baseline cannot be captured or written.
    pub async fn open(host: SharedHost, scope: SnapshotScope, paths: &RolPaths) -> RolResult<Self> {
        let saved_path = paths.saved_configuration();
        let backup_path = paths.backup_configuration();

        let backup = read_slot(&backup_path)?;
        let saved = match read_slot(&saved_path)? {
            Some(saved) => saved,
            None => {
                let baseline = scope.capture(&*host).await.context("capture baseline")?;
                write_slot(&saved_path, &baseline)?;
                tracing::info!(path = %saved_path.display(), "Initialised saved network configuration");
                baseline
            }
        };

        Ok(Self {
            host,
            scope,
            saved_path,
            backup_path,
            slots: Mutex::new(Slots { saved, backup }),
        })
    }

    /// Open the store described by `config`.
    ///
    /// # Errors
    ///
    /// See [`FileConfigurationStore::open`].
    pub async fn from_config(host: SharedHost, config: &NetworkConfig) -> RolResult<Self> {
        let scope = SnapshotScope::new(
            LinkNaming::new(config.managed_prefix.clone()),
            config.tracked_tables.clone(),
        );
        Self::open(host, scope, &config.paths()).await
    }

    /// Contents of the saved slot.
    #[must_use]
    pub fn saved(&self) -> NetworkSnapshot {
        self.slots.lock().saved.clone()
    }

    /// Contents of the backup slot, if a save has happened.
    #[must_use]
    pub fn backup(&self) -> Option<NetworkSnapshot> {
        self.slots.lock().backup.clone()
    }

    /// Path of the saved slot file.
    #[must_use]
    pub fn saved_path(&self) -> &Path {
        &self.saved_path
    }

    /// Path of the backup slot file.
    #[must_use]
    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Put the backup file back in line with the in-memory backup slot
    /// after a save that wrote the backup but not the saved slot.
    fn revert_backup_file(&self) {
        let backup = self.slots.lock().backup.clone();
        let reverted = match backup {
            Some(backup) => write_slot(&self.backup_path, &backup),
            None => match std::fs::remove_file(&self.backup_path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        };
        if let Err(error) = reverted {
            tracing::error!(
                path = %self.backup_path.display(),
                error = %error,
                "Backup file is ahead of the saved configuration"
            );
        }
    }
}

#[async_trait]
impl ConfigurationStore for FileConfigurationStore {
    async fn save_configuration(&self) -> RolResult<()> {
        let live = self.scope.capture(&*self.host).await.context("save configuration")?;
        let previous = self.slots.lock().saved.clone();

        write_slot(&self.backup_path, &previous)?;
        if let Err(error) = write_slot(&self.saved_path, &live) {
            self.revert_backup_file();
            return Err(error.context("save configuration"));
        }

        let mut slots = self.slots.lock();
        slots.backup = Some(previous);
        slots.saved = live;
        tracing::info!(
            links = slots.saved.links.len(),
            path = %self.saved_path.display(),
            "Saved network configuration"
        );
        Ok(())
    }

    async fn restore_from_backup(&self) -> RolResult<()> {
        let backup = self.slots.lock().backup.clone().ok_or_else(|| {
            RolError::not_found(
                "configuration backup",
                self.backup_path.display().to_string(),
            )
        })?;

        self.scope
            .apply(&*self.host, &backup)
            .await
            .context("restore from backup")?;
        write_slot(&self.saved_path, &backup)?;
        self.slots.lock().saved = backup;
        tracing::info!("Restored network configuration from backup");
        Ok(())
    }

    async fn reset_changes(&self) -> RolResult<()> {
        let saved = self.slots.lock().saved.clone();
        self.scope
            .apply(&*self.host, &saved)
            .await
            .context("reset changes")?;
        tracing::info!("Reset network configuration to saved state");
        Ok(())
    }

    async fn has_unsaved_changes(&self) -> RolResult<bool> {
        let live = self.scope.capture(&*self.host).await?;
        Ok(live.differs_from(&self.slots.lock().saved))
    }
}

fn read_slot(path: &Path) -> RolResult<Option<NetworkSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let json = std::fs::read_to_string(path)?;
    let snapshot: NetworkSnapshot = serde_json::from_str(&json)
        .with_context(|| format!("parse {}", path.display()))?;
    tracing::debug!(path = %path.display(), "Loaded network snapshot");
    Ok(Some(snapshot))
}

fn write_slot(path: &Path, snapshot: &NetworkSnapshot) -> RolResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| RolError::validation("state_dir", format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(snapshot)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(json.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;

    tracing::debug!(path = %path.display(), "Wrote network snapshot");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::MemoryHost;
    use crate::mutator::NetworkMutator;
    use crate::rule::Table;

    fn scope() -> SnapshotScope {
        SnapshotScope::new(LinkNaming::default(), vec![Table::Filter, Table::Nat])
    }

    #[tokio::test]
    async fn open_writes_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RolPaths::with_root(dir.path());
        let host: SharedHost = Arc::new(MemoryHost::new());

        let store = FileConfigurationStore::open(host, scope(), &paths).await.unwrap();
        assert!(paths.saved_configuration().exists());
        assert!(store.backup().is_none());
        assert!(!store.has_unsaved_changes().await.unwrap());
    }

    #[tokio::test]
    async fn restore_without_backup_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let host: SharedHost = Arc::new(MemoryHost::new());
        let store = FileConfigurationStore::open(host, scope(), &RolPaths::with_root(dir.path()))
            .await
            .unwrap();

        assert!(store.restore_from_backup().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn slots_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RolPaths::with_root(dir.path());
        let memory = Arc::new(MemoryHost::new());
        let host: SharedHost = memory.clone();

        let store = FileConfigurationStore::open(host.clone(), scope(), &paths).await.unwrap();
        memory.create_bridge("lab1").await.unwrap();
        store.save_configuration().await.unwrap();
        drop(store);

        let reopened = FileConfigurationStore::open(host, scope(), &paths).await.unwrap();
        assert!(reopened.saved().link("rol.lab1").is_some());
        assert!(reopened.backup().unwrap().links.is_empty());
        assert!(!reopened.has_unsaved_changes().await.unwrap());
    }

    #[tokio::test]
    async fn reset_discards_unsaved_changes() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryHost::new().with_physical("enp0s3"));
        let host: SharedHost = memory.clone();
        let store = FileConfigurationStore::open(host, scope(), &RolPaths::with_root(dir.path()))
            .await
            .unwrap();

        memory
            .create_vlan("enp0s3", rol_common::VlanId::new(5).unwrap())
            .await
            .unwrap();
        assert!(store.has_unsaved_changes().await.unwrap());

        store.reset_changes().await.unwrap();
        assert!(!store.has_unsaved_changes().await.unwrap());
    }
}
