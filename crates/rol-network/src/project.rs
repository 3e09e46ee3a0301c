//! Project networks: a managed bridge with a NATed /24 behind the uplink.

use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net};
use parking_lot::Mutex;
use rol_common::{LinkName, ResultExt, RolError, RolResult};
use serde::{Deserialize, Serialize};

use crate::events::{EventBus, NetworkEvent, OperationPhase, PhaseTracker};
use crate::inventory::LinkInventory;
use crate::link::LinkNaming;
use crate::lock::HostLock;
use crate::manager::{HostNetworkManager, compensate};
use crate::mutator::{NetworkMutator, SharedHost};
use crate::rule::{Table, TrafficRule};
use crate::store::ConfigurationStore;
use crate::subnet::SubnetPool;

/// An isolated project network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Project name.
    pub name: String,
    /// Managed bridge owned by the project.
    pub bridge_name: String,
    /// Project subnet, a /24.
    pub subnet: Ipv4Net,
}

impl Project {
    /// Gateway address: the first host of the subnet, as a /24.
    #[must_use]
    pub fn gateway(&self) -> IpNet {
        gateway_of(self.subnet)
    }

    /// The `nat` rule masquerading traffic from the project subnet.
    #[must_use]
    pub fn masquerade_rule(&self) -> TrafficRule {
        TrafficRule::masquerade(IpNet::V4(self.subnet))
    }
}

fn gateway_of(subnet: Ipv4Net) -> IpNet {
    let first = Ipv4Addr::from(u32::from(subnet.network()).saturating_add(1));
    // 24 is always a valid IPv4 prefix length.
    IpNet::V4(Ipv4Net::new(first, 24).unwrap_or(subnet))
}

/// Creates and tears down project networks.
///
/// Shares the host, store, lock and events of a [`HostNetworkManager`], and
/// holds the lock for the whole create or delete sequence.
pub struct ProjectNetworkManager {
    host: SharedHost,
    store: Arc<dyn ConfigurationStore>,
    lock: Arc<HostLock>,
    naming: LinkNaming,
    events: EventBus,
    uplink: String,
    pool: Mutex<SubnetPool>,
}

impl std::fmt::Debug for ProjectNetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectNetworkManager")
            .field("uplink", &self.uplink)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl ProjectNetworkManager {
    /// Create a project manager on top of `network`.
    pub fn new(network: &HostNetworkManager, uplink: impl Into<String>, pool: SubnetPool) -> Self {
        Self {
            host: Arc::clone(network.host()),
            store: Arc::clone(network.store()),
            lock: Arc::clone(network.lock()),
            naming: network.naming().clone(),
            events: network.events().clone(),
            uplink: uplink.into(),
            pool: Mutex::new(pool),
        }
    }

    /// Uplink enslaved to every project bridge.
    #[must_use]
    pub fn uplink(&self) -> &str {
        &self.uplink
    }

    /// Free project subnets.
    #[must_use]
    pub fn available_subnets(&self) -> Vec<Ipv4Net> {
        self.pool.lock().available()
    }

    /// Provision a project network and save the configuration.
    ///
    /// Uses `subnet` if given, otherwise the first free pool subnet. Steps:
    /// create the bridge, assign the gateway, add the MASQUERADE rule,
    /// attach the uplink, set the bridge up, save. A failure after the
    /// bridge exists resets the host to the saved configuration.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the bridge or subnet is taken,
    /// `Validation` for a subnet outside the pool and `NotFound` for a
    /// missing uplink, all before touching the host.
    #[tracing::instrument(skip(self))]
    pub async fn create_project(&self, name: &str, subnet: Option<Ipv4Net>) -> RolResult<Project> {
        if name.is_empty() {
            return Err(RolError::validation("name", "must not be empty"));
        }
        let _guard = self.lock.acquire("create_project").await?;

        let bridge_name = LinkName::new(self.naming.bridge_name(name))?.to_string();
        if self.host.find_by_name(&bridge_name).await?.is_some() {
            return Err(RolError::already_exists("bridge", bridge_name));
        }
        self.host
            .get_by_name(&self.uplink)
            .await
            .context("project uplink")?;

        let subnet = {
            let mut pool = self.pool.lock();
            match subnet {
                Some(subnet) => pool.reserve(subnet).map(|()| subnet.trunc())?,
                None => pool.allocate()?,
            }
        };
        let mut project = Project {
            name: name.to_string(),
            bridge_name,
            subnet,
        };

        let mut tracker = PhaseTracker::new(
            &self.events,
            "create_project",
            &project.bridge_name,
            OperationPhase::Absent,
        );
        let result = async {
            let created = self.host.create_bridge(name).await?;
            tracker.record_mutation();
            tracker.set_link(&created);
            project.bridge_name = created;
            tracker.advance(OperationPhase::Created);

            self.host
                .addr_add(&project.bridge_name, project.gateway())
                .await
                .context("assign gateway")?;
            self.host
                .create_traffic_rule(Table::Nat, &project.masquerade_rule())
                .await
                .context("add masquerade rule")?;
            self.host
                .set_link_master(&self.uplink, &project.bridge_name)
                .await
                .context("attach uplink")?;
            self.host.set_link_up(&project.bridge_name).await?;
            tracker.advance(OperationPhase::Addressed);

            self.store
                .save_configuration()
                .await
                .context("save configuration")?;
            Ok::<_, RolError>(())
        }
        .await;

        if let Err(error) = result {
            self.pool.lock().release(subnet);
            return Err(compensate(&*self.store, &mut tracker, error).await);
        }
        tracker.advance(OperationPhase::Reconciled);
        self.events.publish(NetworkEvent::ConfigurationSaved);
        tracing::info!(
            project = %project.name,
            bridge = %project.bridge_name,
            subnet = %project.subnet,
            "Created project network"
        );
        Ok(project)
    }

    /// Tear a project network down and save the configuration.
    ///
    /// The MASQUERADE rule is removed before the bridge, so a failure never
    /// leaves an orphaned rule behind a deleted bridge. A failure after the
    /// rule was removed resets the host to the saved configuration.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unmanaged or missing bridge.
    #[tracing::instrument(skip(self), fields(project = %project.name))]
    pub async fn delete_project(&self, project: &Project) -> RolResult<()> {
        if !self.naming.is_managed(&project.bridge_name) {
            return Err(RolError::not_found("bridge", &project.bridge_name));
        }
        let _guard = self.lock.acquire("delete_project").await?;

        let bridge = self.host.get_by_name(&project.bridge_name).await?;
        if !bridge.is_bridge() {
            return Err(RolError::not_found("bridge", &project.bridge_name));
        }
        let rule = project.masquerade_rule();

        let mut tracker = PhaseTracker::new(
            &self.events,
            "delete_project",
            &project.bridge_name,
            OperationPhase::Present,
        );
        let result = async {
            let rules = self.host.get_chain_rules(Table::Nat, &rule.chain).await?;
            if rules.contains(&rule) {
                self.host
                    .delete_traffic_rule(Table::Nat, &rule)
                    .await
                    .context("delete masquerade rule")?;
                tracker.record_mutation();
                tracker.advance(OperationPhase::RuleDeleted);
            } else {
                tracing::warn!(rule = %rule, "Masquerade rule already absent");
            }

            self.host
                .delete_link_by_name(&project.bridge_name)
                .await
                .context("delete bridge")?;
            tracker.record_mutation();

            self.store
                .save_configuration()
                .await
                .context("save configuration")?;
            tracker.advance(OperationPhase::Gone);
            Ok::<_, RolError>(())
        }
        .await;

        if let Err(error) = result {
            return Err(compensate(&*self.store, &mut tracker, error).await);
        }
        self.pool.lock().release(project.subnet);
        self.events.publish(NetworkEvent::ConfigurationSaved);
        tracing::info!(project = %project.name, bridge = %project.bridge_name, "Deleted project network");
        Ok(())
    }
}
