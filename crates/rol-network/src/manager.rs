//! Orchestration of VLAN, bridge and traffic rule operations.
//!
//! Every mutating operation runs under the [`HostLock`] and follows the
//! same protocol:
//!
//! 1. validate preconditions against fresh inventory reads;
//! 2. make the structural change, then set the link up when creating;
//! 3. sync addresses (removals, then additions);
//! 4. on failure after the host was touched, reset to the saved
//!    configuration, returning the original error on success and a
//!    `Fatal` error if the reset fails as well;
//! 5. re-read the final state.
//!
//! Operations on names without the managed prefix fail with `NotFound`,
//! whether or not such a link exists.

use std::sync::Arc;

use ipnet::IpNet;
use rol_common::{LinkName, ResultExt, RolError, RolResult, VlanId};

use crate::events::{EventBus, NetworkEvent, OperationPhase, PhaseTracker};
use crate::inventory::LinkInventory;
use crate::link::{Bridge, Link, LinkNaming, Vlan};
use crate::lock::HostLock;
use crate::mutator::{HostNetwork, NetworkMutator, SharedHost};
use crate::reconcile::{self, AddressReconciler};
use crate::rule::{Table, TrafficRule};
use crate::store::ConfigurationStore;

/// Composes inventory, mutator and store into transactional operations.
pub struct HostNetworkManager {
    host: SharedHost,
    store: Arc<dyn ConfigurationStore>,
    lock: Arc<HostLock>,
    naming: LinkNaming,
    events: EventBus,
}

impl std::fmt::Debug for HostNetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostNetworkManager")
            .field("naming", &self.naming)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl HostNetworkManager {
    /// Create a manager.
    pub fn new(
        host: SharedHost,
        store: Arc<dyn ConfigurationStore>,
        lock: Arc<HostLock>,
        naming: LinkNaming,
    ) -> Self {
        Self {
            host,
            store,
            lock,
            naming,
            events: EventBus::new(),
        }
    }

    /// Publish events on an existing bus.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Host backend.
    #[must_use]
    pub fn host(&self) -> &SharedHost {
        &self.host
    }

    /// Configuration store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ConfigurationStore> {
        &self.store
    }

    /// Host lock shared with other managers.
    #[must_use]
    pub fn lock(&self) -> &Arc<HostLock> {
        &self.lock
    }

    /// Naming convention.
    #[must_use]
    pub fn naming(&self) -> &LinkNaming {
        &self.naming
    }

    /// Event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn require_managed(&self, what: &str, name: &str) -> RolResult<()> {
        if self.naming.is_managed(name) {
            Ok(())
        } else {
            Err(RolError::not_found(what, name))
        }
    }

    // Read views

    /// All links on the host.
    ///
    /// # Errors
    ///
    /// Returns `IoFailure` if the inventory cannot be read.
    pub async fn list_links(&self) -> RolResult<Vec<Link>> {
        self.host.get_list().await
    }

    /// A single link.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the link does not exist.
    pub async fn get_link(&self, name: &str) -> RolResult<Link> {
        self.host.get_by_name(name).await
    }

    /// Managed VLANs.
    ///
    /// # Errors
    ///
    /// Returns `IoFailure` if the inventory cannot be read.
    pub async fn list_vlans(&self) -> RolResult<Vec<Vlan>> {
        self.host
            .get_list()
            .await?
            .iter()
            .filter(|l| l.is_vlan() && l.is_managed(self.naming.prefix()))
            .map(Vlan::try_from)
            .collect()
    }

    /// A managed VLAN.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unmanaged names, missing links and links that
    /// are not VLANs.
    pub async fn get_vlan(&self, name: &str) -> RolResult<Vlan> {
        self.require_managed("vlan", name)?;
        let link = self.host.get_by_name(name).await?;
        Vlan::try_from(&link)
    }

    /// Managed bridges with their slaves.
    ///
    /// # Errors
    ///
    /// Returns `IoFailure` if the inventory cannot be read.
    pub async fn list_bridges(&self) -> RolResult<Vec<Bridge>> {
        let links = self.host.get_list().await?;
        links
            .iter()
            .filter(|l| l.is_bridge() && l.is_managed(self.naming.prefix()))
            .map(|l| Bridge::from_link(l, &links))
            .collect()
    }

    /// A managed bridge.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unmanaged names, missing links and links that
    /// are not bridges.
    pub async fn get_bridge(&self, name: &str) -> RolResult<Bridge> {
        self.require_managed("bridge", name)?;
        let links = self.host.get_list().await?;
        let link = links
            .iter()
            .find(|l| l.name == name)
            .ok_or_else(|| RolError::not_found("bridge", name))?;
        Bridge::from_link(link, &links)
    }

    // VLANs

    /// Create VLAN `vlan_id` on `parent` and assign `addresses`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the parent is missing and `AlreadyExists` if the
    /// VLAN exists; neither touches the host. Later failures are compensated.
    #[tracing::instrument(skip(self))]
    pub async fn create_vlan(
        &self,
        parent: &str,
        vlan_id: VlanId,
        addresses: &[IpNet],
    ) -> RolResult<Vlan> {
        let _guard = self.lock.acquire("create_vlan").await?;

        let name = LinkName::new(LinkNaming::vlan_name(parent, vlan_id))?;
        self.host
            .get_by_name(parent)
            .await
            .with_context(|| format!("parent of vlan {name}"))?;
        if self.host.find_by_name(name.as_str()).await?.is_some() {
            return Err(RolError::already_exists("vlan", name.as_str()));
        }

        let mut tracker =
            PhaseTracker::new(&self.events, "create_vlan", name.as_str(), OperationPhase::Absent);
        let result = async {
            let created = self.host.create_vlan(parent, vlan_id).await?;
            tracker.record_mutation();
            tracker.set_link(&created);
            tracker.advance(OperationPhase::Created);

            self.host.set_link_up(&created).await?;
            sync_addresses(&*self.host, &created, addresses, &mut tracker).await?;
            tracker.advance(OperationPhase::Addressed);
            Ok::<_, RolError>(created)
        }
        .await;
        let created = self.settle(&mut tracker, result).await?;

        let vlan = Vlan::try_from(&self.host.get_by_name(&created).await?)?;
        tracker.advance(OperationPhase::Reconciled);
        tracing::info!(vlan = %vlan.name, parent = %vlan.parent, "Created vlan");
        Ok(vlan)
    }

    /// Replace the address set of a managed VLAN.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unmanaged names and non-VLAN links.
    #[tracing::instrument(skip(self))]
    pub async fn update_vlan(&self, name: &str, addresses: &[IpNet]) -> RolResult<Vlan> {
        self.require_managed("vlan", name)?;
        let _guard = self.lock.acquire("update_vlan").await?;

        let link = self.host.get_by_name(name).await?;
        Vlan::try_from(&link)?;

        let mut tracker = PhaseTracker::new(&self.events, "update_vlan", name, OperationPhase::Absent);
        tracker.advance(OperationPhase::Created);
        let result = async {
            sync_addresses(&*self.host, name, addresses, &mut tracker).await?;
            tracker.advance(OperationPhase::Addressed);
            Ok::<_, RolError>(())
        }
        .await;
        self.settle(&mut tracker, result).await?;

        let vlan = Vlan::try_from(&self.host.get_by_name(name).await?)?;
        tracker.advance(OperationPhase::Reconciled);
        tracing::info!(vlan = %name, "Updated vlan");
        Ok(vlan)
    }

    /// Delete a managed VLAN, releasing it from its bridge first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unmanaged names and non-VLAN links.
    #[tracing::instrument(skip(self))]
    pub async fn delete_vlan(&self, name: &str) -> RolResult<()> {
        self.require_managed("vlan", name)?;
        let _guard = self.lock.acquire("delete_vlan").await?;

        let link = self.host.get_by_name(name).await?;
        Vlan::try_from(&link)?;

        let mut tracker = PhaseTracker::new(&self.events, "delete_vlan", name, OperationPhase::Present);
        let result = async {
            if link.master_name.is_some() {
                self.host.unset_link_master(name).await?;
                tracker.record_mutation();
                tracker.advance(OperationPhase::Unlinked);
            }
            self.host.delete_link_by_name(name).await?;
            tracker.advance(OperationPhase::Gone);
            Ok::<_, RolError>(())
        }
        .await;
        self.settle(&mut tracker, result).await?;
        tracing::info!(vlan = %name, "Deleted vlan");
        Ok(())
    }

    // Bridges

    /// Create a managed bridge, enslave `slaves` and assign `addresses`.
    ///
    /// `name` is prefixed unless it already carries the managed prefix.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the bridge exists and `NotFound` or
    /// `Validation` for bad slaves, before touching the host.
    #[tracing::instrument(skip(self))]
    pub async fn create_bridge(
        &self,
        name: &str,
        slaves: &[String],
        addresses: &[IpNet],
    ) -> RolResult<Bridge> {
        let _guard = self.lock.acquire("create_bridge").await?;

        let full = LinkName::new(self.naming.bridge_name(name))?;
        if self.host.find_by_name(full.as_str()).await?.is_some() {
            return Err(RolError::already_exists("bridge", full.as_str()));
        }
        let slaves = self.validate_slaves(full.as_str(), slaves).await?;

        let mut tracker =
            PhaseTracker::new(&self.events, "create_bridge", full.as_str(), OperationPhase::Absent);
        let result = async {
            let created = self.host.create_bridge(name).await?;
            tracker.record_mutation();
            tracker.set_link(&created);
            tracker.advance(OperationPhase::Created);

            self.host.set_link_up(&created).await?;
            sync_slaves(&*self.host, &created, &slaves, &mut tracker).await?;
            sync_addresses(&*self.host, &created, addresses, &mut tracker).await?;
            tracker.advance(OperationPhase::Addressed);
            Ok::<_, RolError>(created)
        }
        .await;
        let created = self.settle(&mut tracker, result).await?;

        let bridge = self.read_bridge(&created).await?;
        tracker.advance(OperationPhase::Reconciled);
        tracing::info!(bridge = %bridge.name, slaves = bridge.slaves.len(), "Created bridge");
        Ok(bridge)
    }

    /// Replace the slave and address sets of a managed bridge.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unmanaged names, non-bridge links and missing
    /// slaves.
    #[tracing::instrument(skip(self))]
    pub async fn update_bridge(
        &self,
        name: &str,
        slaves: &[String],
        addresses: &[IpNet],
    ) -> RolResult<Bridge> {
        self.require_managed("bridge", name)?;
        let _guard = self.lock.acquire("update_bridge").await?;

        let link = self.host.get_by_name(name).await?;
        if !link.is_bridge() {
            return Err(RolError::not_found("bridge", name));
        }
        let slaves = self.validate_slaves(name, slaves).await?;

        let mut tracker =
            PhaseTracker::new(&self.events, "update_bridge", name, OperationPhase::Absent);
        tracker.advance(OperationPhase::Created);
        let result = async {
            sync_slaves(&*self.host, name, &slaves, &mut tracker).await?;
            sync_addresses(&*self.host, name, addresses, &mut tracker).await?;
            tracker.advance(OperationPhase::Addressed);
            Ok::<_, RolError>(())
        }
        .await;
        self.settle(&mut tracker, result).await?;

        let bridge = self.read_bridge(name).await?;
        tracker.advance(OperationPhase::Reconciled);
        tracing::info!(bridge = %name, "Updated bridge");
        Ok(bridge)
    }

    /// Delete a managed bridge after detaching its slaves.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unmanaged names and non-bridge links. Failures
    /// after a slave was detached are compensated.
    #[tracing::instrument(skip(self))]
    pub async fn delete_bridge(&self, name: &str) -> RolResult<()> {
        self.require_managed("bridge", name)?;
        let _guard = self.lock.acquire("delete_bridge").await?;

        let bridge = self.read_bridge(name).await?;

        let mut tracker =
            PhaseTracker::new(&self.events, "delete_bridge", name, OperationPhase::Present);
        let result = async {
            if !bridge.slaves.is_empty() {
                sync_slaves(&*self.host, name, &[], &mut tracker).await?;
                tracker.advance(OperationPhase::Unlinked);
            }
            self.host.delete_link_by_name(name).await?;
            tracker.advance(OperationPhase::Gone);
            Ok::<_, RolError>(())
        }
        .await;
        self.settle(&mut tracker, result).await?;
        tracing::info!(bridge = %name, "Deleted bridge");
        Ok(())
    }

    async fn read_bridge(&self, name: &str) -> RolResult<Bridge> {
        let links = self.host.get_list().await?;
        let link = links
            .iter()
            .find(|l| l.name == name)
            .ok_or_else(|| RolError::not_found("bridge", name))?;
        Bridge::from_link(link, &links)
    }

    async fn validate_slaves(&self, bridge: &str, slaves: &[String]) -> RolResult<Vec<String>> {
        let mut unique: Vec<String> = Vec::with_capacity(slaves.len());
        for slave in slaves {
            if slave == bridge {
                return Err(RolError::validation(
                    "slaves",
                    format!("{bridge} cannot be enslaved to itself"),
                ));
            }
            self.host
                .get_by_name(slave)
                .await
                .with_context(|| format!("slave of bridge {bridge}"))?;
            if !unique.contains(slave) {
                unique.push(slave.clone());
            }
        }
        Ok(unique)
    }

    // Traffic rules

    /// Rules of one table, in kernel order.
    ///
    /// # Errors
    ///
    /// Returns `IoFailure` if the rules cannot be listed.
    pub async fn list_table_rules(&self, table: Table) -> RolResult<Vec<TrafficRule>> {
        self.host.get_table_rules(table).await
    }

    /// Rules of one chain, in kernel order.
    ///
    /// # Errors
    ///
    /// Returns `IoFailure` if the rules cannot be listed.
    pub async fn list_chain_rules(&self, table: Table, chain: &str) -> RolResult<Vec<TrafficRule>> {
        self.host.get_chain_rules(table, chain).await
    }

    /// Append a rule.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if an identical rule is present.
    #[tracing::instrument(skip(self, rule), fields(rule = %rule))]
    pub async fn create_traffic_rule(&self, table: Table, rule: TrafficRule) -> RolResult<TrafficRule> {
        let rule = rule.normalized();
        rule.validate()?;
        let _guard = self.lock.acquire("create_traffic_rule").await?;

        let existing = self.host.get_chain_rules(table, &rule.chain).await?;
        if existing.contains(&rule) {
            return Err(RolError::already_exists("traffic rule", format!("{table} {rule}")));
        }
        self.host.create_traffic_rule(table, &rule).await?;
        tracing::info!(table = %table, rule = %rule, "Created traffic rule");
        Ok(rule)
    }

    /// Delete a rule.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no identical rule is present.
    #[tracing::instrument(skip(self, rule), fields(rule = %rule))]
    pub async fn delete_traffic_rule(&self, table: Table, rule: &TrafficRule) -> RolResult<()> {
        let rule = &rule.clone().normalized();
        rule.validate()?;
        let _guard = self.lock.acquire("delete_traffic_rule").await?;

        let existing = self.host.get_chain_rules(table, &rule.chain).await?;
        if !existing.contains(rule) {
            return Err(RolError::not_found("traffic rule", format!("{table} {rule}")));
        }
        self.host.delete_traffic_rule(table, rule).await?;
        tracing::info!(table = %table, rule = %rule, "Deleted traffic rule");
        Ok(())
    }

    // Configuration

    /// Save the live configuration; the previous save becomes the backup.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be captured or written.
    pub async fn save_configuration(&self) -> RolResult<()> {
        let _guard = self.lock.acquire("save_configuration").await?;
        self.store.save_configuration().await?;
        self.events.publish(NetworkEvent::ConfigurationSaved);
        Ok(())
    }

    /// Apply the backup configuration.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing was saved twice yet, or the failing
    /// apply step.
    pub async fn restore_from_backup(&self) -> RolResult<()> {
        let _guard = self.lock.acquire("restore_from_backup").await?;
        self.store.restore_from_backup().await?;
        self.events.publish(NetworkEvent::BackupRestored);
        Ok(())
    }

    /// Re-apply the saved configuration.
    ///
    /// # Errors
    ///
    /// Returns the failing apply step.
    pub async fn reset_changes(&self) -> RolResult<()> {
        let _guard = self.lock.acquire("reset_changes").await?;
        self.store.reset_changes().await?;
        self.events.publish(NetworkEvent::ChangesReset);
        Ok(())
    }

    /// Returns true if the live state differs from the saved configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the live state cannot be captured.
    pub async fn has_unsaved_changes(&self) -> RolResult<bool> {
        let _guard = self.lock.acquire("has_unsaved_changes").await?;
        self.store.has_unsaved_changes().await
    }

    async fn settle<T>(&self, tracker: &mut PhaseTracker, result: RolResult<T>) -> RolResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(error) => Err(compensate(&*self.store, tracker, error).await),
        }
    }
}

/// Roll the host back after a failed step.
///
/// Nothing is reset when the operation never touched the host. Otherwise
/// the saved configuration is re-applied: on success the original error is
/// returned with context, on failure a `Fatal` error chaining both.
pub(crate) async fn compensate(
    store: &dyn ConfigurationStore,
    tracker: &mut PhaseTracker,
    error: RolError,
) -> RolError {
    tracker.advance(OperationPhase::Failed);
    if !tracker.has_mutated() {
        return error;
    }

    tracing::warn!(
        link = %tracker.link(),
        error = %error,
        "Operation failed after changing the host, resetting to saved configuration"
    );
    tracker.advance(OperationPhase::Resetting);
    match store.reset_changes().await {
        Ok(()) => {
            tracker.advance(OperationPhase::Reset);
            error.context(format!(
                "{} failed, host reset to saved configuration",
                tracker.link()
            ))
        }
        Err(reset_error) => {
            tracker.advance(OperationPhase::ResetFailed);
            let fatal = RolError::fatal(tracker.link().to_string(), error, reset_error);
            tracing::error!(link = %tracker.link(), error = %fatal, "Host network diverged from saved configuration");
            tracker.fatal(&fatal);
            fatal
        }
    }
}

/// Bring the addresses of `name` to `desired`: removals, then additions.
pub(crate) async fn sync_addresses(
    host: &dyn HostNetwork,
    name: &str,
    desired: &[IpNet],
    tracker: &mut PhaseTracker,
) -> RolResult<()> {
    let link = host.get_by_name(name).await?;
    let diff = AddressReconciler::diff(&link.addresses, desired);
    for addr in diff.to_remove {
        host.addr_delete(name, addr)
            .await
            .with_context(|| format!("remove {addr} from {name}"))?;
        tracker.record_mutation();
    }
    for addr in diff.to_add {
        host.addr_add(name, addr)
            .await
            .with_context(|| format!("add {addr} to {name}"))?;
        tracker.record_mutation();
    }
    Ok(())
}

/// Bring the slaves of `bridge` to `desired`.
async fn sync_slaves(
    host: &dyn HostNetwork,
    bridge: &str,
    desired: &[String],
    tracker: &mut PhaseTracker,
) -> RolResult<()> {
    let current: Vec<String> = host
        .get_list()
        .await?
        .into_iter()
        .filter(|l| l.master_name.as_deref() == Some(bridge))
        .map(|l| l.name)
        .collect();
    let diff = reconcile::diff(&current, desired);
    for slave in &diff.to_remove {
        host.unset_link_master(slave)
            .await
            .with_context(|| format!("detach {slave} from {bridge}"))?;
        tracker.record_mutation();
    }
    for slave in &diff.to_add {
        host.set_link_master(slave, bridge)
            .await
            .with_context(|| format!("attach {slave} to {bridge}"))?;
        tracker.record_mutation();
    }
    Ok(())
}
