//! Linux host backend.
//!
//! Links and addresses go through `rtnetlink`; rules go through the
//! `iptables` binary. Every primitive is bounded by the configured
//! operation timeout, and kernel error codes map to error kinds
//! (`EEXIST` to `AlreadyExists`; `ENODEV`, `ENOENT`, `ESRCH` and
//! `EADDRNOTAVAIL` to `NotFound`; everything else to `IoFailure`).

mod iptables;
mod netlink;

use async_trait::async_trait;
use ipnet::IpNet;
use rol_common::{LinkName, RolError, RolResult, VlanId};

pub use self::iptables::DEFAULT_IPTABLES;
use self::iptables::Iptables;
use self::netlink::Netlink;
use crate::config::NetworkConfig;
use crate::inventory::LinkInventory;
use crate::link::{Link, LinkNaming};
use crate::mutator::NetworkMutator;
use crate::rule::{Table, TrafficRule};

/// Host backend for the local network namespace.
#[derive(Debug, Clone)]
pub struct LinuxHost {
    netlink: Netlink,
    iptables: Iptables,
    naming: LinkNaming,
}

impl LinuxHost {
    /// Connect to the kernel. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `IoFailure` if the netlink socket cannot be opened.
    pub fn connect(config: &NetworkConfig) -> RolResult<Self> {
        let timeout = config.operation_timeout();
        let host = Self {
            netlink: Netlink::connect(timeout)?,
            iptables: Iptables::new(DEFAULT_IPTABLES, timeout),
            naming: LinkNaming::new(config.managed_prefix.clone()),
        };
        tracing::debug!(timeout = ?timeout, prefix = %host.naming.prefix(), "Connected to host network");
        Ok(host)
    }

    /// Use a different `iptables` binary, e.g. `iptables-legacy`.
    #[must_use]
    pub fn with_iptables_binary(mut self, binary: impl Into<String>) -> Self {
        self.iptables = self.iptables.with_binary(binary);
        self
    }
}

#[async_trait]
impl LinkInventory for LinuxHost {
    async fn get_list(&self) -> RolResult<Vec<Link>> {
        self.netlink.links().await
    }

    async fn get_by_name(&self, name: &str) -> RolResult<Link> {
        self.netlink
            .links()
            .await?
            .into_iter()
            .find(|l| l.name == name)
            .ok_or_else(|| RolError::not_found("link", name))
    }
}

#[async_trait]
impl NetworkMutator for LinuxHost {
    async fn create_vlan(&self, parent: &str, vlan_id: VlanId) -> RolResult<String> {
        let name = LinkName::new(LinkNaming::vlan_name(parent, vlan_id))?.to_string();
        tracing::debug!(link = %name, parent, vlan_id = %vlan_id, "Creating vlan");
        let parent_index = self.netlink.index_of(parent).await?;
        self.netlink.add_vlan(&name, parent_index, vlan_id).await?;
        Ok(name)
    }

    async fn create_bridge(&self, name: &str) -> RolResult<String> {
        let name = LinkName::new(self.naming.bridge_name(name))?.to_string();
        tracing::debug!(link = %name, "Creating bridge");
        self.netlink.add_bridge(&name).await?;
        Ok(name)
    }

    async fn set_link_up(&self, name: &str) -> RolResult<()> {
        tracing::debug!(link = %name, "Setting link up");
        let index = self.netlink.index_of(name).await?;
        self.netlink.set_up(name, index).await
    }

    async fn set_link_master(&self, slave: &str, master: &str) -> RolResult<()> {
        tracing::debug!(link = %slave, master, "Setting link master");
        let index = self.netlink.index_of(slave).await?;
        let master_index = self.netlink.index_of(master).await?;
        self.netlink.set_controller(slave, index, Some(master_index)).await
    }

    async fn unset_link_master(&self, name: &str) -> RolResult<()> {
        tracing::debug!(link = %name, "Unsetting link master");
        let index = self.netlink.index_of(name).await?;
        self.netlink.set_controller(name, index, None).await
    }

    async fn delete_link_by_name(&self, name: &str) -> RolResult<()> {
        tracing::debug!(link = %name, "Deleting link");
        let index = self.netlink.index_of(name).await?;
        self.netlink.delete(name, index).await
    }

    async fn addr_add(&self, name: &str, addr: IpNet) -> RolResult<()> {
        tracing::debug!(link = %name, addr = %addr, "Adding address");
        let index = self.netlink.index_of(name).await?;
        self.netlink.add_address(name, index, addr).await
    }

    async fn addr_delete(&self, name: &str, addr: IpNet) -> RolResult<()> {
        tracing::debug!(link = %name, addr = %addr, "Deleting address");
        let index = self.netlink.index_of(name).await?;
        self.netlink.delete_address(name, index, addr).await
    }

    async fn create_traffic_rule(&self, table: Table, rule: &TrafficRule) -> RolResult<()> {
        rule.validate()?;
        tracing::debug!(table = %table, rule = %rule, "Appending traffic rule");
        self.iptables.append(table, rule).await
    }

    async fn delete_traffic_rule(&self, table: Table, rule: &TrafficRule) -> RolResult<()> {
        rule.validate()?;
        tracing::debug!(table = %table, rule = %rule, "Deleting traffic rule");
        self.iptables.delete(table, rule).await
    }

    async fn get_chain_rules(&self, table: Table, chain: &str) -> RolResult<Vec<TrafficRule>> {
        tracing::debug!(table = %table, chain, "Listing chain rules");
        self.iptables.list(table, Some(chain)).await
    }

    async fn get_table_rules(&self, table: Table) -> RolResult<Vec<TrafficRule>> {
        tracing::debug!(table = %table, "Listing table rules");
        self.iptables.list(table, None).await
    }
}
