//! Network links as observed on the host.
//!
//! A [`Link`] is always a fresh read from the OS; nothing here caches.
//! The [`Vlan`] and [`Bridge`] views are typed projections of a link used
//! by the orchestrator's public API.

use std::fmt;

use ipnet::IpNet;
use rol_common::{RolError, RolResult, VlanId};
use serde::{Deserialize, Serialize};

/// Default prefix marking links created and owned by this system.
pub const DEFAULT_MANAGED_PREFIX: &str = "rol.";

/// Link type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    /// A physical device (no rtnetlink kind).
    Physical,
    /// An 802.1Q VLAN device.
    Vlan,
    /// A Linux bridge.
    Bridge,
    /// Any other virtual device (veth, dummy, ...).
    Other(String),
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Physical => write!(f, "physical"),
            Self::Vlan => write!(f, "vlan"),
            Self::Bridge => write!(f, "bridge"),
            Self::Other(kind) => write!(f, "{kind}"),
        }
    }
}

/// A network interface as observed from the OS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Kernel interface index.
    pub index: u32,
    /// Interface name, the unique key.
    pub name: String,
    /// Link type.
    pub kind: LinkKind,
    /// Assigned addresses in `ip/prefixlen` form.
    pub addresses: Vec<IpNet>,
    /// Name of the master (bridge) this link is enslaved to.
    pub master_name: Option<String>,
    /// Name of the lower device, for VLANs.
    pub parent_name: Option<String>,
    /// VLAN ID, for VLANs.
    pub vlan_id: Option<u16>,
    /// Administrative state.
    pub is_up: bool,
}

impl Link {
    /// Create a link record with no addresses, master or VLAN data.
    #[must_use]
    pub fn new(index: u32, name: impl Into<String>, kind: LinkKind) -> Self {
        Self {
            index,
            name: name.into(),
            kind,
            addresses: Vec::new(),
            master_name: None,
            parent_name: None,
            vlan_id: None,
            is_up: false,
        }
    }

    /// Returns true if the link name carries the managed prefix.
    #[must_use]
    pub fn is_managed(&self, prefix: &str) -> bool {
        is_managed_name(&self.name, prefix)
    }

    /// Returns true if this link is a VLAN.
    #[must_use]
    pub fn is_vlan(&self) -> bool {
        self.kind == LinkKind::Vlan
    }

    /// Returns true if this link is a bridge.
    #[must_use]
    pub fn is_bridge(&self) -> bool {
        self.kind == LinkKind::Bridge
    }
}

/// Returns true if `name` carries the managed `prefix`.
///
/// An empty prefix never matches; an unset prefix must not turn every host
/// interface into a managed one.
#[must_use]
pub fn is_managed_name(name: &str, prefix: &str) -> bool {
    !prefix.is_empty() && name.starts_with(prefix) && name.len() > prefix.len()
}

/// Naming convention for links created by this system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkNaming {
    prefix: String,
}

impl Default for LinkNaming {
    fn default() -> Self {
        Self::new(DEFAULT_MANAGED_PREFIX)
    }
}

impl LinkNaming {
    /// Create a naming convention with the given managed prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The managed prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns true if `name` belongs to a managed link.
    #[must_use]
    pub fn is_managed(&self, name: &str) -> bool {
        is_managed_name(name, &self.prefix)
    }

    /// Name of a managed bridge for the requested `name`.
    ///
    /// Already-prefixed names are returned unchanged.
    #[must_use]
    pub fn bridge_name(&self, name: &str) -> String {
        if self.is_managed(name) {
            name.to_string()
        } else {
            format!("{}{name}", self.prefix)
        }
    }

    /// Name of the VLAN `id` on `parent`.
    #[must_use]
    pub fn vlan_name(parent: &str, id: VlanId) -> String {
        format!("{parent}.{id}")
    }
}

/// Managed VLAN view of a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vlan {
    /// VLAN link name (`parent.id`).
    pub name: String,
    /// Lower device name.
    pub parent: String,
    /// VLAN ID.
    pub vlan_id: u16,
    /// Assigned addresses.
    pub addresses: Vec<IpNet>,
    /// Master bridge, if enslaved.
    pub master: Option<String>,
    /// Administrative state.
    pub is_up: bool,
}

impl TryFrom<&Link> for Vlan {
    type Error = RolError;

    fn try_from(link: &Link) -> RolResult<Self> {
        if !link.is_vlan() {
            return Err(RolError::not_found("vlan", &link.name));
        }
        let (parent, vlan_id) = match (&link.parent_name, link.vlan_id) {
            (Some(parent), Some(id)) => (parent.clone(), id),
            _ => {
                // Fall back to the naming convention when the kernel did not
                // report the lower device.
                let (parent, id) = link
                    .name
                    .rsplit_once('.')
                    .ok_or_else(|| RolError::not_found("vlan", &link.name))?;
                let id = id
                    .parse()
                    .map_err(|_| RolError::not_found("vlan", &link.name))?;
                (parent.to_string(), link.vlan_id.unwrap_or(id))
            }
        };
        Ok(Self {
            name: link.name.clone(),
            parent,
            vlan_id,
            addresses: link.addresses.clone(),
            master: link.master_name.clone(),
            is_up: link.is_up,
        })
    }
}

/// Managed bridge view of a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bridge {
    /// Bridge link name.
    pub name: String,
    /// Names of links enslaved to the bridge, sorted.
    pub slaves: Vec<String>,
    /// Assigned addresses.
    pub addresses: Vec<IpNet>,
    /// Administrative state.
    pub is_up: bool,
}

impl Bridge {
    /// Build a bridge view from the bridge link and the full link list.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `link` is not a bridge.
    pub fn from_link(link: &Link, all: &[Link]) -> RolResult<Self> {
        if !link.is_bridge() {
            return Err(RolError::not_found("bridge", &link.name));
        }
        let mut slaves: Vec<String> = all
            .iter()
            .filter(|l| l.master_name.as_deref() == Some(link.name.as_str()))
            .map(|l| l.name.clone())
            .collect();
        slaves.sort();
        Ok(Self {
            name: link.name.clone(),
            slaves,
            addresses: link.addresses.clone(),
            is_up: link.is_up,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vlan_link() -> Link {
        let mut link = Link::new(7, "rol.lab1.100", LinkKind::Vlan);
        link.parent_name = Some("rol.lab1".into());
        link.vlan_id = Some(100);
        link.addresses = vec!["10.0.0.1/24".parse().unwrap()];
        link
    }

    #[test]
    fn managed_predicate() {
        assert!(is_managed_name("rol.lab1", "rol."));
        assert!(!is_managed_name("enp0s8", "rol."));
        assert!(!is_managed_name("xrol.lab1", "rol."));
        assert!(!is_managed_name("rol.", "rol."));
        assert!(!is_managed_name("anything", ""));
    }

    #[test]
    fn bridge_naming() {
        let naming = LinkNaming::default();
        assert_eq!(naming.bridge_name("lab1"), "rol.lab1");
        assert_eq!(naming.bridge_name("rol.lab1"), "rol.lab1");
    }

    #[test]
    fn vlan_naming() {
        let id = VlanId::new(100).unwrap();
        assert_eq!(LinkNaming::vlan_name("enp0s3", id), "enp0s3.100");
    }

    #[test]
    fn vlan_view_from_link() {
        let vlan = Vlan::try_from(&vlan_link()).unwrap();
        assert_eq!(vlan.parent, "rol.lab1");
        assert_eq!(vlan.vlan_id, 100);
        assert_eq!(vlan.addresses.len(), 1);
    }

    #[test]
    fn vlan_view_falls_back_to_name() {
        let mut link = vlan_link();
        link.parent_name = None;
        link.vlan_id = None;
        let vlan = Vlan::try_from(&link).unwrap();
        assert_eq!(vlan.parent, "rol.lab1");
        assert_eq!(vlan.vlan_id, 100);
    }

    #[test]
    fn vlan_view_rejects_bridge() {
        let link = Link::new(3, "rol.lab1", LinkKind::Bridge);
        assert!(Vlan::try_from(&link).unwrap_err().is_not_found());
    }

    #[test]
    fn bridge_view_collects_slaves() {
        let bridge = Link::new(3, "rol.lab1", LinkKind::Bridge);
        let mut uplink = Link::new(2, "enp0s8", LinkKind::Physical);
        uplink.master_name = Some("rol.lab1".into());
        let other = Link::new(1, "lo", LinkKind::Physical);
        let all = vec![other, uplink, bridge.clone()];

        let view = Bridge::from_link(&bridge, &all).unwrap();
        assert_eq!(view.slaves, vec!["enp0s8".to_string()]);
    }
}
