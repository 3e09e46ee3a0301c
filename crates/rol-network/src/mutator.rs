//! Primitive, side-effecting host network operations.

use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use rol_common::{RolResult, VlanId};

use crate::inventory::LinkInventory;
use crate::rule::{Table, TrafficRule};

/// One operation per OS primitive.
///
/// Each mutating call is a single OS transaction with no retry. Failures
/// are returned immediately; compensation is the caller's business.
/// Adding an address that is present, or deleting one that is not, is an
/// error rather than a no-op.
#[async_trait]
pub trait NetworkMutator: Send + Sync {
    /// Create VLAN `vlan_id` on `parent`, named `parent.vlan_id`.
    async fn create_vlan(&self, parent: &str, vlan_id: VlanId) -> RolResult<String>;

    /// Create a bridge. The returned name carries the managed prefix.
    async fn create_bridge(&self, name: &str) -> RolResult<String>;

    /// Set a link administratively up.
    async fn set_link_up(&self, name: &str) -> RolResult<()>;

    /// Enslave `slave` to `master`.
    async fn set_link_master(&self, slave: &str, master: &str) -> RolResult<()>;

    /// Release a link from its master.
    async fn unset_link_master(&self, name: &str) -> RolResult<()>;

    /// Delete a link.
    async fn delete_link_by_name(&self, name: &str) -> RolResult<()>;

    /// Add an address to a link.
    async fn addr_add(&self, name: &str, addr: IpNet) -> RolResult<()>;

    /// Remove an address from a link.
    async fn addr_delete(&self, name: &str, addr: IpNet) -> RolResult<()>;

    /// Append a rule to `table`.
    async fn create_traffic_rule(&self, table: Table, rule: &TrafficRule) -> RolResult<()>;

    /// Delete a rule from `table`.
    async fn delete_traffic_rule(&self, table: Table, rule: &TrafficRule) -> RolResult<()>;

    /// Rules of one chain, in kernel order.
    async fn get_chain_rules(&self, table: Table, chain: &str) -> RolResult<Vec<TrafficRule>>;

    /// Rules of every chain of `table`, in kernel order.
    async fn get_table_rules(&self, table: Table) -> RolResult<Vec<TrafficRule>>;
}

/// A host backend: link inventory plus mutation primitives.
pub trait HostNetwork: LinkInventory + NetworkMutator {}

impl<T: LinkInventory + NetworkMutator + ?Sized> HostNetwork for T {}

/// Shared handle to a host backend.
pub type SharedHost = Arc<dyn HostNetwork>;
