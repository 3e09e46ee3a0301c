//! # rol-network
//!
//! Host network configuration for the ROL lab backend.
//!
//! This crate brings the host's live network state (links, VLANs, bridges,
//! addresses and netfilter rules) into agreement with a desired, persisted
//! configuration:
//!
//! - [`LinkInventory`] reads links fresh from the OS
//! - [`AddressReconciler`] diffs current and desired addresses
//! - [`NetworkMutator`] wraps one OS primitive per call
//! - [`ConfigurationStore`] keeps the saved and backup snapshots
//! - [`HostNetworkManager`] orchestrates VLAN, bridge and rule operations
//!   with rollback on partial failure
//! - [`ProjectNetworkManager`] provisions NATed project networks
//!
//! Two backends implement the OS seams: [`LinuxHost`] (rtnetlink and
//! iptables) and [`MemoryHost`] (an in-memory stack for dry runs and
//! tests).

#![warn(missing_docs)]

pub mod config;
pub mod events;
pub mod inventory;
pub mod link;
pub mod linux;
pub mod lock;
pub mod manager;
pub mod memory;
pub mod mutator;
pub mod project;
pub mod reconcile;
pub mod rule;
pub mod snapshot;
pub mod store;
pub mod subnet;

pub use config::NetworkConfig;
pub use events::{EventBus, NetworkEvent, OperationPhase};
pub use inventory::LinkInventory;
pub use link::{Bridge, Link, LinkKind, LinkNaming, Vlan};
pub use linux::LinuxHost;
pub use lock::HostLock;
pub use manager::HostNetworkManager;
pub use memory::{HostCall, HostOp, MemoryHost};
pub use mutator::{HostNetwork, NetworkMutator, SharedHost};
pub use project::{Project, ProjectNetworkManager};
pub use reconcile::{AddressReconciler, Diff};
pub use rule::{Table, TrafficRule};
pub use snapshot::{NetworkSnapshot, SnapshotScope};
pub use store::{ConfigurationStore, FileConfigurationStore};
pub use subnet::SubnetPool;
