//! In-memory host network stack.
//!
//! [`MemoryHost`] behaves like a small Linux network namespace: links have
//! indices, VLANs need an existing parent, deleting a link releases its
//! slaves and removes the VLANs stacked on it, and adding a duplicate
//! address is an error. It keeps a journal of every mutating call and can
//! be told to fail specific primitives, which makes it the backend for
//! dry runs and for testing the managers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;
use rol_common::{LinkName, RolError, RolResult, VlanId};

use crate::inventory::LinkInventory;
use crate::link::{Link, LinkKind, LinkNaming};
use crate::mutator::NetworkMutator;
use crate::rule::{Table, TrafficRule};

/// Kind of host primitive, used to target failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    /// `get_list` / `get_by_name`.
    ReadLinks,
    /// `create_vlan`.
    CreateVlan,
    /// `create_bridge`.
    CreateBridge,
    /// `set_link_up`.
    SetLinkUp,
    /// `set_link_master`.
    SetLinkMaster,
    /// `unset_link_master`.
    UnsetLinkMaster,
    /// `delete_link_by_name`.
    DeleteLink,
    /// `addr_add`.
    AddrAdd,
    /// `addr_delete`.
    AddrDelete,
    /// `create_traffic_rule`.
    CreateRule,
    /// `delete_traffic_rule`.
    DeleteRule,
    /// `get_chain_rules` / `get_table_rules`.
    ReadRules,
}

/// A recorded mutating call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    /// VLAN creation.
    CreateVlan {
        /// Parent link.
        parent: String,
        /// VLAN ID.
        vlan_id: u16,
    },
    /// Bridge creation (requested name).
    CreateBridge {
        /// Requested name.
        name: String,
    },
    /// Link set up.
    SetLinkUp {
        /// Link name.
        name: String,
    },
    /// Slave attached to a master.
    SetLinkMaster {
        /// Slave link.
        slave: String,
        /// Master link.
        master: String,
    },
    /// Slave released.
    UnsetLinkMaster {
        /// Link name.
        name: String,
    },
    /// Link deleted.
    DeleteLink {
        /// Link name.
        name: String,
    },
    /// Address added.
    AddrAdd {
        /// Link name.
        name: String,
        /// Address.
        addr: IpNet,
    },
    /// Address removed.
    AddrDelete {
        /// Link name.
        name: String,
        /// Address.
        addr: IpNet,
    },
    /// Rule appended.
    CreateRule {
        /// Table.
        table: Table,
        /// Rule.
        rule: TrafficRule,
    },
    /// Rule deleted.
    DeleteRule {
        /// Table.
        table: Table,
        /// Rule.
        rule: TrafficRule,
    },
}

impl HostCall {
    /// The primitive this call used.
    #[must_use]
    pub const fn op(&self) -> HostOp {
        match self {
            Self::CreateVlan { .. } => HostOp::CreateVlan,
            Self::CreateBridge { .. } => HostOp::CreateBridge,
            Self::SetLinkUp { .. } => HostOp::SetLinkUp,
            Self::SetLinkMaster { .. } => HostOp::SetLinkMaster,
            Self::UnsetLinkMaster { .. } => HostOp::UnsetLinkMaster,
            Self::DeleteLink { .. } => HostOp::DeleteLink,
            Self::AddrAdd { .. } => HostOp::AddrAdd,
            Self::AddrDelete { .. } => HostOp::AddrDelete,
            Self::CreateRule { .. } => HostOp::CreateRule,
            Self::DeleteRule { .. } => HostOp::DeleteRule,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Failure {
    op: HostOp,
    /// Calls to let through before failing.
    skip: usize,
    /// Remaining failures; `None` fails forever.
    remaining: Option<usize>,
}

#[derive(Debug)]
struct MemoryState {
    next_index: u32,
    links: BTreeMap<String, Link>,
    rules: BTreeMap<Table, Vec<TrafficRule>>,
    journal: Vec<HostCall>,
    failures: Vec<Failure>,
}

impl MemoryState {
    fn link(&self, name: &str) -> RolResult<&Link> {
        self.links
            .get(name)
            .ok_or_else(|| RolError::not_found("link", name))
    }

    fn link_mut(&mut self, name: &str) -> RolResult<&mut Link> {
        self.links
            .get_mut(name)
            .ok_or_else(|| RolError::not_found("link", name))
    }

    fn insert(&mut self, mut link: Link) {
        if link.index == 0 {
            link.index = self.next_index;
        }
        self.next_index = self.next_index.max(link.index) + 1;
        self.links.insert(link.name.clone(), link);
    }

    fn check_failure(&mut self, op: HostOp) -> RolResult<()> {
        let Some(failure) = self.failures.iter_mut().find(|f| f.op == op) else {
            return Ok(());
        };
        if failure.skip > 0 {
            failure.skip -= 1;
            return Ok(());
        }
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining -= 1;
        }
        self.failures.retain(|f| f.remaining != Some(0));
        Err(RolError::io_failure(
            format!("{op:?}"),
            "injected failure",
        ))
    }
}

/// In-memory implementation of [`LinkInventory`] and [`NetworkMutator`].
#[derive(Debug)]
pub struct MemoryHost {
    state: Mutex<MemoryState>,
    naming: LinkNaming,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    /// Create a host with only the loopback interface.
    #[must_use]
    pub fn new() -> Self {
        let mut state = MemoryState {
            next_index: 1,
            links: BTreeMap::new(),
            rules: BTreeMap::new(),
            journal: Vec::new(),
            failures: Vec::new(),
        };
        let mut lo = Link::new(0, "lo", LinkKind::Physical);
        lo.is_up = true;
        state.insert(lo);
        Self {
            state: Mutex::new(state),
            naming: LinkNaming::default(),
        }
    }

    /// Use a different managed prefix for bridge names.
    #[must_use]
    pub fn with_naming(mut self, naming: LinkNaming) -> Self {
        self.naming = naming;
        self
    }

    /// Seed a physical interface that is up.
    #[must_use]
    pub fn with_physical(self, name: &str) -> Self {
        let mut link = Link::new(0, name, LinkKind::Physical);
        link.is_up = true;
        self.with_link(link)
    }

    /// Seed an arbitrary link. An index of 0 is replaced by the next free one.
    #[must_use]
    pub fn with_link(mut self, link: Link) -> Self {
        self.state.get_mut().insert(link);
        self
    }

    /// Seed a rule without journaling it.
    #[must_use]
    pub fn with_rule(mut self, table: Table, rule: TrafficRule) -> Self {
        self.state
            .get_mut()
            .rules
            .entry(table)
            .or_default()
            .push(rule);
        self
    }

    /// Fail every subsequent call of `op` with an `IoFailure`.
    pub fn fail_on(&self, op: HostOp) {
        self.push_failure(Failure {
            op,
            skip: 0,
            remaining: None,
        });
    }

    /// Fail the next call of `op` once.
    pub fn fail_once(&self, op: HostOp) {
        self.fail_nth(op, 0);
    }

    /// Let `skip` calls of `op` through, then fail the next one once.
    pub fn fail_nth(&self, op: HostOp, skip: usize) {
        self.push_failure(Failure {
            op,
            skip,
            remaining: Some(1),
        });
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    fn push_failure(&self, failure: Failure) {
        let mut state = self.state.lock();
        state.failures.retain(|f| f.op != failure.op);
        state.failures.push(failure);
    }

    /// Every mutating call made so far, in order, including failed ones.
    #[must_use]
    pub fn journal(&self) -> Vec<HostCall> {
        self.state.lock().journal.clone()
    }

    /// Number of mutating calls made so far.
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.state.lock().journal.len()
    }

    /// Number of recorded calls of `op`.
    #[must_use]
    pub fn count(&self, op: HostOp) -> usize {
        self.state
            .lock()
            .journal
            .iter()
            .filter(|call| call.op() == op)
            .count()
    }

    /// Forget recorded calls.
    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }

    fn mutate<T>(
        &self,
        call: HostCall,
        apply: impl FnOnce(&mut MemoryState) -> RolResult<T>,
    ) -> RolResult<T> {
        let mut state = self.state.lock();
        let op = call.op();
        tracing::debug!(call = ?call, "memory host mutation");
        state.journal.push(call);
        state.check_failure(op)?;
        apply(&mut state)
    }
}

#[async_trait]
impl LinkInventory for MemoryHost {
    async fn get_list(&self) -> RolResult<Vec<Link>> {
        let mut state = self.state.lock();
        state.check_failure(HostOp::ReadLinks)?;
        let mut links: Vec<Link> = state.links.values().cloned().collect();
        links.sort_by_key(|l| l.index);
        Ok(links)
    }

    async fn get_by_name(&self, name: &str) -> RolResult<Link> {
        let mut state = self.state.lock();
        state.check_failure(HostOp::ReadLinks)?;
        state.link(name).cloned()
    }
}

#[async_trait]
impl NetworkMutator for MemoryHost {
    async fn create_vlan(&self, parent: &str, vlan_id: VlanId) -> RolResult<String> {
        let call = HostCall::CreateVlan {
            parent: parent.to_string(),
            vlan_id: vlan_id.get(),
        };
        self.mutate(call, |state| {
            state.link(parent)?;
            let name = LinkName::new(LinkNaming::vlan_name(parent, vlan_id))?.to_string();
            if state.links.contains_key(&name) {
                return Err(RolError::already_exists("link", name));
            }
            let mut link = Link::new(0, name.clone(), LinkKind::Vlan);
            link.parent_name = Some(parent.to_string());
            link.vlan_id = Some(vlan_id.get());
            state.insert(link);
            Ok(name)
        })
    }

    async fn create_bridge(&self, name: &str) -> RolResult<String> {
        let call = HostCall::CreateBridge {
            name: name.to_string(),
        };
        let full = self.naming.bridge_name(name);
        self.mutate(call, |state| {
            let full = LinkName::new(full)?.to_string();
            if state.links.contains_key(&full) {
                return Err(RolError::already_exists("link", full));
            }
            state.insert(Link::new(0, full.clone(), LinkKind::Bridge));
            Ok(full)
        })
    }

    async fn set_link_up(&self, name: &str) -> RolResult<()> {
        let call = HostCall::SetLinkUp {
            name: name.to_string(),
        };
        self.mutate(call, |state| {
            state.link_mut(name)?.is_up = true;
            Ok(())
        })
    }

    async fn set_link_master(&self, slave: &str, master: &str) -> RolResult<()> {
        let call = HostCall::SetLinkMaster {
            slave: slave.to_string(),
            master: master.to_string(),
        };
        self.mutate(call, |state| {
            if !state.link(master)?.is_bridge() {
                return Err(RolError::io_failure(
                    "set link master",
                    format!("{master} is not a bridge"),
                ));
            }
            if slave == master {
                return Err(RolError::io_failure(
                    "set link master",
                    format!("{slave} cannot be its own master"),
                ));
            }
            state.link_mut(slave)?.master_name = Some(master.to_string());
            Ok(())
        })
    }

    async fn unset_link_master(&self, name: &str) -> RolResult<()> {
        let call = HostCall::UnsetLinkMaster {
            name: name.to_string(),
        };
        self.mutate(call, |state| {
            state.link_mut(name)?.master_name = None;
            Ok(())
        })
    }

    async fn delete_link_by_name(&self, name: &str) -> RolResult<()> {
        let call = HostCall::DeleteLink {
            name: name.to_string(),
        };
        self.mutate(call, |state| {
            let link = state
                .links
                .remove(name)
                .ok_or_else(|| RolError::not_found("link", name))?;
            // The kernel releases slaves and removes stacked VLANs.
            state
                .links
                .retain(|_, l| l.parent_name.as_deref() != Some(link.name.as_str()));
            for other in state.links.values_mut() {
                if other.master_name.as_deref() == Some(link.name.as_str()) {
                    other.master_name = None;
                }
            }
            Ok(())
        })
    }

    async fn addr_add(&self, name: &str, addr: IpNet) -> RolResult<()> {
        let call = HostCall::AddrAdd {
            name: name.to_string(),
            addr,
        };
        self.mutate(call, |state| {
            let link = state.link_mut(name)?;
            if link.addresses.contains(&addr) {
                return Err(RolError::already_exists("address", format!("{addr} on {name}")));
            }
            link.addresses.push(addr);
            Ok(())
        })
    }

    async fn addr_delete(&self, name: &str, addr: IpNet) -> RolResult<()> {
        let call = HostCall::AddrDelete {
            name: name.to_string(),
            addr,
        };
        self.mutate(call, |state| {
            let link = state.link_mut(name)?;
            let before = link.addresses.len();
            link.addresses.retain(|a| *a != addr);
            if link.addresses.len() == before {
                return Err(RolError::not_found("address", format!("{addr} on {name}")));
            }
            Ok(())
        })
    }

    async fn create_traffic_rule(&self, table: Table, rule: &TrafficRule) -> RolResult<()> {
        let call = HostCall::CreateRule {
            table,
            rule: rule.clone(),
        };
        self.mutate(call, |state| {
            rule.validate()?;
            state.rules.entry(table).or_default().push(rule.clone());
            Ok(())
        })
    }

    async fn delete_traffic_rule(&self, table: Table, rule: &TrafficRule) -> RolResult<()> {
        let call = HostCall::DeleteRule {
            table,
            rule: rule.clone(),
        };
        self.mutate(call, |state| {
            let rules = state.rules.entry(table).or_default();
            let position = rules
                .iter()
                .position(|r| r == rule)
                .ok_or_else(|| RolError::not_found("traffic rule", format!("{table} {rule}")))?;
            rules.remove(position);
            Ok(())
        })
    }

    async fn get_chain_rules(&self, table: Table, chain: &str) -> RolResult<Vec<TrafficRule>> {
        let mut state = self.state.lock();
        state.check_failure(HostOp::ReadRules)?;
        Ok(state
            .rules
            .get(&table)
            .map(|rules| rules.iter().filter(|r| r.chain == chain).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_table_rules(&self, table: Table) -> RolResult<Vec<TrafficRule>> {
        let mut state = self.state.lock();
        state.check_failure(HostOp::ReadRules)?;
        Ok(state.rules.get(&table).cloned().unwrap_or_default())
    }
}
