//! Shared fixtures for rol-network integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use ipnet::IpNet;
use rol_common::{RolPaths, RolResult};
use rol_network::{
    ConfigurationStore, FileConfigurationStore, HostLock, HostNetworkManager, LinkNaming,
    MemoryHost, NetworkConfig, ProjectNetworkManager, SharedHost, SnapshotScope, SubnetPool,
    Table,
};
use tempfile::TempDir;

/// Store wrapper counting calls, delegating to a real store.
pub struct CountingStore {
    inner: Arc<dyn ConfigurationStore>,
    saves: AtomicUsize,
    resets: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn ConfigurationStore>) -> Self {
        Self {
            inner,
            saves: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
        }
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigurationStore for CountingStore {
    async fn save_configuration(&self) -> RolResult<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save_configuration().await
    }

    async fn restore_from_backup(&self) -> RolResult<()> {
        self.inner.restore_from_backup().await
    }

    async fn reset_changes(&self) -> RolResult<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.inner.reset_changes().await
    }

    async fn has_unsaved_changes(&self) -> RolResult<bool> {
        self.inner.has_unsaved_changes().await
    }
}

/// A memory host with two physical interfaces, a file store in a temporary
/// directory, and managers on top.
pub struct Fixture {
    pub dir: TempDir,
    pub host: Arc<MemoryHost>,
    pub files: Arc<FileConfigurationStore>,
    pub store: Arc<CountingStore>,
    pub network: HostNetworkManager,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_host(MemoryHost::new().with_physical("enp0s3").with_physical("enp0s8")).await
    }

    pub async fn with_host(host: MemoryHost) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(host);
        let shared: SharedHost = host.clone();

        let scope = SnapshotScope::new(LinkNaming::default(), vec![Table::Filter, Table::Nat]);
        let files = Arc::new(
            FileConfigurationStore::open(shared.clone(), scope, &RolPaths::with_root(dir.path()))
                .await
                .unwrap(),
        );
        let store = Arc::new(CountingStore::new(files.clone()));
        let network = HostNetworkManager::new(
            shared,
            store.clone(),
            Arc::new(HostLock::default()),
            LinkNaming::default(),
        );
        host.clear_journal();

        Self {
            dir,
            host,
            files,
            store,
            network,
        }
    }

    pub fn projects(&self) -> ProjectNetworkManager {
        let config = NetworkConfig::default();
        ProjectNetworkManager::new(
            &self.network,
            config.uplink_interface,
            SubnetPool::new(config.project_subnets),
        )
    }
}

pub fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}
