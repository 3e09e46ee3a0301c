//! Read access to the host's links.

use async_trait::async_trait;
use rol_common::RolResult;

use crate::link::Link;

/// Queries the OS for the current set of links.
///
/// Every call is a fresh read. Implementations must not cache across calls,
/// since callers re-fetch after each mutation they depend on.
#[async_trait]
pub trait LinkInventory: Send + Sync {
    /// List all links on the host.
    async fn get_list(&self) -> RolResult<Vec<Link>>;

    /// Get a single link by name.
    ///
    /// A missing link yields a `NotFound` error, distinguishable from an
    /// `IoFailure` talking to the OS.
    async fn get_by_name(&self, name: &str) -> RolResult<Link>;

    /// Get a link by name, mapping `NotFound` to `None`.
    async fn find_by_name(&self, name: &str) -> RolResult<Option<Link>> {
        match self.get_by_name(name).await {
            Ok(link) => Ok(Some(link)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
