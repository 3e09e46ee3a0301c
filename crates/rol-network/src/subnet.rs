//! Pool of reserved project subnets.

use std::collections::BTreeSet;

use ipnet::Ipv4Net;
use rol_common::{RolError, RolResult};

/// Hands out project subnets from a fixed, ordered list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetPool {
    subnets: Vec<Ipv4Net>,
    used: BTreeSet<Ipv4Net>,
}

impl SubnetPool {
    /// Create a pool with every subnet free.
    #[must_use]
    pub fn new(subnets: Vec<Ipv4Net>) -> Self {
        Self {
            subnets: subnets.into_iter().map(|s| s.trunc()).collect(),
            used: BTreeSet::new(),
        }
    }

    /// Create a pool with `used` already taken, e.g. by existing projects.
    ///
    /// # Errors
    ///
    /// Returns the first reservation error.
    pub fn with_used(
        subnets: Vec<Ipv4Net>,
        used: impl IntoIterator<Item = Ipv4Net>,
    ) -> RolResult<Self> {
        let mut pool = Self::new(subnets);
        for subnet in used {
            pool.reserve(subnet)?;
        }
        Ok(pool)
    }

    /// Take the first free subnet.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if every subnet is taken.
    pub fn allocate(&mut self) -> RolResult<Ipv4Net> {
        let subnet = self
            .subnets
            .iter()
            .find(|s| !self.used.contains(*s))
            .copied()
            .ok_or_else(|| RolError::not_found("free project subnet", "subnet pool"))?;
        self.used.insert(subnet);
        tracing::debug!(subnet = %subnet, "Allocated project subnet");
        Ok(subnet)
    }

    /// Take a specific subnet.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the subnet is not part of the pool and
    /// `AlreadyExists` if it is taken.
    pub fn reserve(&mut self, subnet: Ipv4Net) -> RolResult<()> {
        let subnet = subnet.trunc();
        if !self.subnets.contains(&subnet) {
            return Err(RolError::validation(
                "subnet",
                format!("{subnet} is not a reserved project subnet"),
            ));
        }
        if !self.used.insert(subnet) {
            return Err(RolError::already_exists("project subnet", subnet.to_string()));
        }
        Ok(())
    }

    /// Return a subnet to the pool. Returns false if it was not taken.
    pub fn release(&mut self, subnet: Ipv4Net) -> bool {
        self.used.remove(&subnet.trunc())
    }

    /// Returns true if `subnet` is taken.
    #[must_use]
    pub fn is_used(&self, subnet: Ipv4Net) -> bool {
        self.used.contains(&subnet.trunc())
    }

    /// Free subnets, in pool order.
    #[must_use]
    pub fn available(&self) -> Vec<Ipv4Net> {
        self.subnets
            .iter()
            .filter(|s| !self.used.contains(*s))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn pool() -> SubnetPool {
        SubnetPool::new(NetworkConfig::default().project_subnets)
    }

    #[test]
    fn allocates_in_order() {
        let mut pool = pool();
        assert_eq!(pool.allocate().unwrap(), net("10.10.10.0/24"));
        assert_eq!(pool.allocate().unwrap(), net("10.10.11.0/24"));
        assert!(pool.release(net("10.10.10.0/24")));
        assert_eq!(pool.allocate().unwrap(), net("10.10.10.0/24"));
    }

    #[test]
    fn exhaustion_is_not_found() {
        let mut pool = SubnetPool::new(vec![net("10.10.10.0/24")]);
        pool.allocate().unwrap();
        assert!(pool.allocate().unwrap_err().is_not_found());
    }

    #[test]
    fn reserve_checks_membership_and_use() {
        let mut pool = pool();
        pool.reserve(net("10.10.12.0/24")).unwrap();
        assert_eq!(
            pool.reserve(net("10.10.12.0/24")).unwrap_err().kind(),
            rol_common::ErrorKind::AlreadyExists
        );
        assert_eq!(
            pool.reserve(net("192.168.0.0/24")).unwrap_err().kind(),
            rol_common::ErrorKind::Validation
        );
        assert!(pool.is_used(net("10.10.12.7/24")));
    }

    #[test]
    fn with_used_rebuilds_state() {
        let pool =
            SubnetPool::with_used(NetworkConfig::default().project_subnets, [net("10.10.10.0/24")])
                .unwrap();
        assert_eq!(pool.available().len(), 5);
        assert!(!pool.available().contains(&net("10.10.10.0/24")));
    }
}
