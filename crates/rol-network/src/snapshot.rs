//! Network configuration snapshots.
//!
//! A [`NetworkSnapshot`] records everything this system creates on the
//! host: managed links, every VLAN, unmanaged links attached to managed
//! bridges, and the rules of the tracked netfilter tables. Snapshots are
//! captured from and applied to a live [`HostNetwork`].

use std::collections::{BTreeMap, HashSet};

use ipnet::IpNet;
use rol_common::{ResultExt, RolError, RolResult, VlanId};
use serde::{Deserialize, Serialize};

use crate::inventory::LinkInventory;
use crate::link::{Link, LinkNaming, Vlan};
use crate::mutator::{HostNetwork, NetworkMutator};
use crate::reconcile::AddressReconciler;
use crate::rule::{Table, TrafficRule};

/// Structural kind of a snapshotted link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SnapshotKind {
    /// A managed bridge.
    Bridge,
    /// A VLAN on `parent`.
    Vlan {
        /// Lower device.
        parent: String,
        /// VLAN ID.
        id: u16,
    },
}

/// One link as recorded in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSnapshot {
    /// Link name.
    pub name: String,
    /// Bridge or VLAN.
    pub kind: SnapshotKind,
    /// Master bridge, if enslaved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,
    /// Addresses, sorted.
    #[serde(default)]
    pub addresses: Vec<IpNet>,
    /// Administrative state.
    pub up: bool,
}

/// An unmanaged link enslaved to a managed one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Attachment {
    /// Unmanaged slave, e.g. the uplink.
    pub slave: String,
    /// Managed master.
    pub master: String,
}

/// Persisted representation of the managed host network state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    /// Managed links and VLANs, sorted by name.
    #[serde(default)]
    pub links: Vec<LinkSnapshot>,
    /// Unmanaged slaves of managed links, sorted.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Rules per tracked table, in kernel order.
    #[serde(default)]
    pub rules: BTreeMap<Table, Vec<TrafficRule>>,
}

impl NetworkSnapshot {
    /// Sort links, addresses and attachments into canonical order.
    ///
    /// Rule order is significant and left alone.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        for link in &mut self.links {
            link.addresses.sort();
            link.addresses.dedup();
        }
        self.links.sort_by(|a, b| a.name.cmp(&b.name));
        self.attachments.sort();
        self.attachments.dedup();
        self.rules.retain(|_, rules| !rules.is_empty());
        self
    }

    /// Structural comparison, independent of link and address order.
    #[must_use]
    pub fn differs_from(&self, other: &Self) -> bool {
        self.clone().normalized() != other.clone().normalized()
    }

    /// Look up a link by name.
    #[must_use]
    pub fn link(&self, name: &str) -> Option<&LinkSnapshot> {
        self.links.iter().find(|l| l.name == name)
    }
}

/// Which part of the host a snapshot covers.
#[derive(Debug, Clone)]
pub struct SnapshotScope {
    naming: LinkNaming,
    tables: Vec<Table>,
}

impl SnapshotScope {
    /// Cover managed links under `naming` and rules of `tables`.
    #[must_use]
    pub fn new(naming: LinkNaming, tables: Vec<Table>) -> Self {
        Self { naming, tables }
    }

    /// Naming convention in use.
    #[must_use]
    pub fn naming(&self) -> &LinkNaming {
        &self.naming
    }

    /// Tracked netfilter tables.
    #[must_use]
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    fn kind_of(&self, link: &Link) -> Option<SnapshotKind> {
        if link.is_vlan() {
            let vlan = Vlan::try_from(link).ok()?;
            Some(SnapshotKind::Vlan {
                parent: vlan.parent,
                id: vlan.vlan_id,
            })
        } else if link.is_bridge() && link.is_managed(self.naming.prefix()) {
            Some(SnapshotKind::Bridge)
        } else {
            None
        }
    }

    /// Record the live state of `host`.
    ///
    /// # Errors
    ///
    /// Returns the first inventory or rule listing error.
    pub async fn capture(&self, host: &dyn HostNetwork) -> RolResult<NetworkSnapshot> {
        let links = host.get_list().await.context("capture links")?;

        let mut snapshot = NetworkSnapshot::default();
        for link in &links {
            if let Some(kind) = self.kind_of(link) {
                snapshot.links.push(LinkSnapshot {
                    name: link.name.clone(),
                    kind,
                    master: link.master_name.clone(),
                    addresses: link.addresses.clone(),
                    up: link.is_up,
                });
            }
        }
        let scoped: HashSet<&str> = snapshot.links.iter().map(|l| l.name.as_str()).collect();
        snapshot.attachments = links
            .iter()
            .filter(|l| !scoped.contains(l.name.as_str()))
            .filter_map(|l| {
                let master = l.master_name.as_deref()?;
                scoped.contains(master).then(|| Attachment {
                    slave: l.name.clone(),
                    master: master.to_string(),
                })
            })
            .collect();

        for table in &self.tables {
            let rules = host
                .get_table_rules(*table)
                .await
                .with_context(|| format!("capture {table} rules"))?;
            snapshot.rules.insert(*table, rules);
        }

        let snapshot = snapshot.normalized();
        tracing::debug!(
            links = snapshot.links.len(),
            attachments = snapshot.attachments.len(),
            "Captured network snapshot"
        );
        Ok(snapshot)
    }

    /// Make the live state of `host` match `target`.
    ///
    /// One pass, stopping at the first failure. A failure part-way leaves
    /// the host in an intermediate state. Links are never brought down:
    /// there is no primitive for it, so a link that is up stays up.
    ///
    /// # Errors
    ///
    /// Returns the first failing step, wrapped with what was being done.
    #[tracing::instrument(skip_all, fields(links = target.links.len()))]
    pub async fn apply(&self, host: &dyn HostNetwork, target: &NetworkSnapshot) -> RolResult<()> {
        let target = target.clone().normalized();

        for table in &self.tables {
            let desired = target.rules.get(table).map(Vec::as_slice).unwrap_or(&[]);
            sync_rules(host, *table, desired)
                .await
                .with_context(|| format!("apply {table} rules"))?;
        }

        let current = self.capture(host).await?;

        for attachment in &current.attachments {
            if !target.attachments.contains(attachment) {
                host.unset_link_master(&attachment.slave)
                    .await
                    .with_context(|| format!("detach {}", attachment.slave))?;
            }
        }

        let stale: Vec<&LinkSnapshot> = current
            .links
            .iter()
            .filter(|live| target.link(&live.name).is_none_or(|t| t.kind != live.kind))
            .collect();
        let (stale_vlans, stale_bridges): (Vec<_>, Vec<_>) = stale
            .into_iter()
            .partition(|l| matches!(l.kind, SnapshotKind::Vlan { .. }));
        for link in stale_vlans.iter().chain(&stale_bridges) {
            match host.delete_link_by_name(&link.name).await {
                Ok(()) => {}
                // Already removed together with its lower device.
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.context(format!("delete {}", link.name))),
            }
        }

        for link in &target.links {
            let missing = current.link(&link.name).is_none_or(|l| l.kind != link.kind);
            if missing && link.kind == SnapshotKind::Bridge {
                let created = host
                    .create_bridge(&link.name)
                    .await
                    .with_context(|| format!("create bridge {}", link.name))?;
                expect_name(&link.name, &created)?;
            }
        }
        for link in &target.links {
            let missing = current.link(&link.name).is_none_or(|l| l.kind != link.kind);
            if let (true, SnapshotKind::Vlan { parent, id }) = (missing, &link.kind) {
                let created = host
                    .create_vlan(parent, VlanId::new(*id)?)
                    .await
                    .with_context(|| format!("create vlan {}", link.name))?;
                expect_name(&link.name, &created)?;
            }
        }

        for link in &target.links {
            sync_link(host, link)
                .await
                .with_context(|| format!("configure {}", link.name))?;
        }

        for attachment in &target.attachments {
            let slave = host
                .get_by_name(&attachment.slave)
                .await
                .with_context(|| format!("attach {}", attachment.slave))?;
            if slave.master_name.as_deref() != Some(attachment.master.as_str()) {
                host.set_link_master(&attachment.slave, &attachment.master)
                    .await
                    .with_context(|| format!("attach {}", attachment.slave))?;
            }
        }

        tracing::info!(
            links = target.links.len(),
            attachments = target.attachments.len(),
            "Applied network snapshot"
        );
        Ok(())
    }
}

fn expect_name(expected: &str, created: &str) -> RolResult<()> {
    if expected == created {
        Ok(())
    } else {
        Err(RolError::validation(
            "snapshot",
            format!("link {expected} was recreated as {created}"),
        ))
    }
}

async fn sync_link(host: &dyn HostNetwork, target: &LinkSnapshot) -> RolResult<()> {
    let live = host.get_by_name(&target.name).await?;

    if live.master_name != target.master {
        match &target.master {
            Some(master) => host.set_link_master(&target.name, master).await?,
            None => host.unset_link_master(&target.name).await?,
        }
    }

    let diff = AddressReconciler::diff(&live.addresses, &target.addresses);
    for addr in diff.to_remove {
        host.addr_delete(&target.name, addr).await?;
    }
    for addr in diff.to_add {
        host.addr_add(&target.name, addr).await?;
    }

    if target.up && !live.is_up {
        host.set_link_up(&target.name).await?;
    }
    Ok(())
}

/// Reconcile one table as an ordered list.
///
/// Rules absent from `desired` are deleted first. The remaining live rules
/// are kept up to the longest common prefix with `desired`; everything
/// after it is deleted and `desired`'s tail is appended in order.
async fn sync_rules(host: &dyn HostNetwork, table: Table, desired: &[TrafficRule]) -> RolResult<()> {
    let live = host.get_table_rules(table).await?;
    let wanted: HashSet<&TrafficRule> = desired.iter().collect();

    let mut kept = Vec::with_capacity(live.len());
    for rule in live {
        if wanted.contains(&rule) {
            kept.push(rule);
        } else {
            host.delete_traffic_rule(table, &rule).await?;
        }
    }

    let common = kept
        .iter()
        .zip(desired)
        .take_while(|(a, b)| a == b)
        .count();
    for rule in kept[common..].iter().rev() {
        host.delete_traffic_rule(table, rule).await?;
    }
    for rule in &desired[common..] {
        host.create_traffic_rule(table, rule).await?;
    }
    Ok(())
}
