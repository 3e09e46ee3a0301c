//! Links and addresses over a netlink route socket.

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use futures::TryStreamExt;
use ipnet::IpNet;
use rol_common::{RolError, RolResult, VlanId};
use rtnetlink::packet_route::address::{AddressAttribute, AddressMessage};
use rtnetlink::packet_route::link::{
    InfoData, InfoKind, InfoVlan, LinkAttribute, LinkFlags, LinkInfo, LinkMessage,
};
use rtnetlink::{Handle, LinkBridge, LinkUnspec, LinkVlan};

use crate::link::{Link, LinkKind};

/// Netlink route client with a bounded wait per request.
#[derive(Debug, Clone)]
pub(crate) struct Netlink {
    handle: Handle,
    timeout: Duration,
}

impl Netlink {
    /// Open a route socket and spawn its connection task on the current
    /// runtime.
    pub(crate) fn connect(timeout: Duration) -> RolResult<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| RolError::io_failure("netlink connect", e.to_string()))?;
        tokio::spawn(connection);
        Ok(Self { handle, timeout })
    }

    async fn run<T, F>(&self, operation: &str, what: &str, name: &str, request: F) -> RolResult<T>
    where
        F: Future<Output = Result<T, rtnetlink::Error>>,
    {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_error(operation, what, name, &e)),
            Err(_) => Err(RolError::io_failure(
                operation,
                format!("{name}: timed out after {:?}", self.timeout),
            )),
        }
    }

    pub(crate) async fn links(&self) -> RolResult<Vec<Link>> {
        let messages = self
            .run("link list", "link", "*", async {
                let mut stream = self.handle.link().get().execute();
                let mut messages = Vec::new();
                while let Some(message) = stream.try_next().await? {
                    messages.push(message);
                }
                Ok::<_, rtnetlink::Error>(messages)
            })
            .await?;
        let mut addresses = self.addresses().await?;

        let names: HashMap<u32, String> = messages
            .iter()
            .filter_map(|m| link_name(m).map(|n| (m.header.index, n.to_string())))
            .collect();
        Ok(messages
            .iter()
            .filter_map(|m| {
                let mut link = link_from_message(m, &names)?;
                link.addresses = addresses.remove(&link.index).unwrap_or_default();
                Some(link)
            })
            .collect())
    }

    async fn addresses(&self) -> RolResult<HashMap<u32, Vec<IpNet>>> {
        let messages = self
            .run("address list", "address", "*", async {
                let mut stream = self.handle.address().get().execute();
                let mut messages = Vec::new();
                while let Some(message) = stream.try_next().await? {
                    messages.push(message);
                }
                Ok::<_, rtnetlink::Error>(messages)
            })
            .await?;

        let mut by_index: HashMap<u32, Vec<IpNet>> = HashMap::new();
        for message in &messages {
            if let Some(net) = address_of(message) {
                by_index.entry(message.header.index).or_default().push(net);
            }
        }
        Ok(by_index)
    }

    pub(crate) async fn index_of(&self, name: &str) -> RolResult<u32> {
        let message = self
            .run("link get", "link", name, async {
                self.handle
                    .link()
                    .get()
                    .match_name(name.to_string())
                    .execute()
                    .try_next()
                    .await
            })
            .await?;
        message
            .map(|m| m.header.index)
            .ok_or_else(|| RolError::not_found("link", name))
    }

    pub(crate) async fn add_vlan(&self, name: &str, parent: u32, vlan_id: VlanId) -> RolResult<()> {
        let message = LinkVlan::new(name, parent, vlan_id.get()).build();
        self.run("vlan add", "link", name, self.handle.link().add(message).execute())
            .await
    }

    pub(crate) async fn add_bridge(&self, name: &str) -> RolResult<()> {
        let message = LinkBridge::new(name).build();
        self.run("bridge add", "link", name, self.handle.link().add(message).execute())
            .await
    }

    pub(crate) async fn set_up(&self, name: &str, index: u32) -> RolResult<()> {
        let message = LinkUnspec::new_with_index(index).up().build();
        self.run("link set up", "link", name, self.handle.link().set(message).execute())
            .await
    }

    pub(crate) async fn set_controller(&self, name: &str, index: u32, controller: Option<u32>) -> RolResult<()> {
        let message = match controller {
            Some(controller) => LinkUnspec::new_with_index(index).controller(controller).build(),
            None => LinkUnspec::new_with_index(index).nocontroller().build(),
        };
        self.run("link set master", "link", name, self.handle.link().set(message).execute())
            .await
    }

    pub(crate) async fn delete(&self, name: &str, index: u32) -> RolResult<()> {
        self.run("link delete", "link", name, self.handle.link().del(index).execute())
            .await
    }

    pub(crate) async fn add_address(&self, name: &str, index: u32, addr: IpNet) -> RolResult<()> {
        let subject = format!("{addr} on {name}");
        self.run(
            "address add",
            "address",
            &subject,
            self.handle
                .address()
                .add(index, addr.addr(), addr.prefix_len())
                .execute(),
        )
        .await
    }

    pub(crate) async fn delete_address(&self, name: &str, index: u32, addr: IpNet) -> RolResult<()> {
        let subject = format!("{addr} on {name}");
        let messages = self
            .run("address list", "address", &subject, async {
                let mut stream = self
                    .handle
                    .address()
                    .get()
                    .set_link_index_filter(index)
                    .execute();
                let mut messages = Vec::new();
                while let Some(message) = stream.try_next().await? {
                    messages.push(message);
                }
                Ok::<_, rtnetlink::Error>(messages)
            })
            .await?;
        let message = messages
            .into_iter()
            .find(|m| address_of(m) == Some(addr))
            .ok_or_else(|| RolError::not_found("address", &subject))?;
        self.run(
            "address delete",
            "address",
            &subject,
            self.handle.address().del(message).execute(),
        )
        .await
    }
}

/// Map a netlink error to an error kind by errno.
pub(crate) fn map_error(operation: &str, what: &str, name: &str, err: &rtnetlink::Error) -> RolError {
    if let rtnetlink::Error::NetlinkError(message) = err {
        match errno_kind(message.raw_code()) {
            Some(ErrnoKind::Exists) => return RolError::already_exists(what, name),
            Some(ErrnoKind::Missing) => return RolError::not_found(what, name),
            None => {}
        }
    }
    RolError::io_failure(operation, format!("{name}: {err}"))
}

#[derive(Debug, PartialEq, Eq)]
enum ErrnoKind {
    Exists,
    Missing,
}

/// Netlink reports errno negated.
fn errno_kind(raw: i32) -> Option<ErrnoKind> {
    match -raw {
        libc::EEXIST => Some(ErrnoKind::Exists),
        libc::ENODEV | libc::ENOENT | libc::ESRCH | libc::EADDRNOTAVAIL => Some(ErrnoKind::Missing),
        _ => None,
    }
}

fn link_name(message: &LinkMessage) -> Option<&str> {
    message.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(name.as_str()),
        _ => None,
    })
}

fn link_from_message(message: &LinkMessage, names: &HashMap<u32, String>) -> Option<Link> {
    let name = link_name(message)?;
    let mut link = Link::new(message.header.index, name, LinkKind::Physical);
    link.is_up = message.header.flags.contains(LinkFlags::Up);

    let mut lower = None;
    for attr in &message.attributes {
        match attr {
            LinkAttribute::Controller(index) => link.master_name = names.get(index).cloned(),
            LinkAttribute::Link(index) => lower = names.get(index).cloned(),
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    match info {
                        LinkInfo::Kind(InfoKind::Vlan) => link.kind = LinkKind::Vlan,
                        LinkInfo::Kind(InfoKind::Bridge) => link.kind = LinkKind::Bridge,
                        LinkInfo::Kind(InfoKind::Other(kind)) => {
                            link.kind = LinkKind::Other(kind.clone());
                        }
                        LinkInfo::Kind(other) => {
                            link.kind = LinkKind::Other(format!("{other:?}").to_lowercase());
                        }
                        LinkInfo::Data(InfoData::Vlan(data)) => {
                            link.vlan_id = data.iter().find_map(|d| match d {
                                InfoVlan::Id(id) => Some(*id),
                                _ => None,
                            });
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    if link.is_vlan() {
        link.parent_name = lower;
    }
    Some(link)
}

fn address_of(message: &AddressMessage) -> Option<IpNet> {
    let addr: IpAddr = message.attributes.iter().find_map(|attr| match attr {
        AddressAttribute::Address(addr) => Some(*addr),
        _ => None,
    })?;
    IpNet::new(addr, message.header.prefix_len).ok()
}
