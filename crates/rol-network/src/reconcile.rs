//! Set differences between current and desired link state.
//!
//! Addresses are compared as parsed [`IpNet`] values (address plus prefix
//! length), so two textual spellings of the same address are equal.

use std::collections::HashSet;
use std::hash::Hash;

use ipnet::IpNet;
use rol_common::{RolError, RolResult};

/// Result of diffing a current set against a desired set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff<T> {
    /// Present now, not desired.
    pub to_remove: Vec<T>,
    /// Desired, not present now.
    pub to_add: Vec<T>,
}

impl<T> Diff<T> {
    /// Returns true if nothing needs to change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_remove.is_empty() && self.to_add.is_empty()
    }
}

/// Compute `(current - desired, desired - current)`.
///
/// Both inputs are treated as sets: duplicates are dropped, and each output
/// keeps the first-occurrence order of the slice it was filtered from.
#[must_use]
pub fn diff<T>(current: &[T], desired: &[T]) -> Diff<T>
where
    T: Clone + Eq + Hash,
{
    let current_set: HashSet<&T> = current.iter().collect();
    let desired_set: HashSet<&T> = desired.iter().collect();

    Diff {
        to_remove: ordered_difference(current, &desired_set),
        to_add: ordered_difference(desired, &current_set),
    }
}

fn ordered_difference<T>(items: &[T], exclude: &HashSet<&T>) -> Vec<T>
where
    T: Clone + Eq + Hash,
{
    let mut seen = HashSet::new();
    items
        .iter()
        .filter(|item| !exclude.contains(item) && seen.insert(*item))
        .cloned()
        .collect()
}

/// Address diffing for a single link.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressReconciler;

impl AddressReconciler {
    /// Diff parsed addresses.
    #[must_use]
    pub fn diff(current: &[IpNet], desired: &[IpNet]) -> Diff<IpNet> {
        diff(current, desired)
    }

    /// Parse and diff addresses given in `ip/prefixlen` notation.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the first malformed CIDR.
    pub fn diff_str<S: AsRef<str>>(current: &[S], desired: &[S]) -> RolResult<Diff<IpNet>> {
        let current = parse_cidrs(current)?;
        let desired = parse_cidrs(desired)?;
        Ok(Self::diff(&current, &desired))
    }
}

/// Parse a list of CIDR strings.
///
/// # Errors
///
/// Returns a validation error naming the first malformed entry.
pub fn parse_cidrs<S: AsRef<str>>(cidrs: &[S]) -> RolResult<Vec<IpNet>> {
    cidrs.iter().map(|c| parse_cidr(c.as_ref())).collect()
}

/// Parse one CIDR in `ip/prefixlen` notation.
///
/// # Errors
///
/// Returns a validation error if `cidr` is malformed.
pub fn parse_cidr(cidr: &str) -> RolResult<IpNet> {
    cidr.trim()
        .parse::<IpNet>()
        .map_err(|e| RolError::validation("address", format!("'{cidr}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nets(items: &[&str]) -> Vec<IpNet> {
        parse_cidrs(items).unwrap()
    }

    #[test]
    fn disjoint_sets() {
        let d = AddressReconciler::diff(&nets(&["10.0.0.1/24"]), &nets(&["10.0.1.1/24"]));
        assert_eq!(d.to_remove, nets(&["10.0.0.1/24"]));
        assert_eq!(d.to_add, nets(&["10.0.1.1/24"]));
    }

    #[test]
    fn equal_sets_are_empty() {
        let a = nets(&["10.0.0.1/24", "fd00::1/64"]);
        assert!(AddressReconciler::diff(&a, &a).is_empty());
        assert!(AddressReconciler::diff(&[], &[]).is_empty());
    }

    #[test]
    fn keeps_insertion_order() {
        let d = AddressReconciler::diff(
            &nets(&["10.0.0.3/24", "10.0.0.1/24", "10.0.0.2/24"]),
            &nets(&["10.0.0.2/24"]),
        );
        assert_eq!(d.to_remove, nets(&["10.0.0.3/24", "10.0.0.1/24"]));
        assert!(d.to_add.is_empty());
    }

    #[test]
    fn prefix_length_is_significant() {
        let d = AddressReconciler::diff(&nets(&["10.0.0.1/24"]), &nets(&["10.0.0.1/16"]));
        assert_eq!(d.to_remove.len(), 1);
        assert_eq!(d.to_add.len(), 1);
    }

    #[test]
    fn equivalent_spellings_match() {
        let d = AddressReconciler::diff_str(&["fd00:0:0::1/64"], &["fd00::1/64"]).unwrap();
        assert!(d.is_empty());
    }

    #[test]
    fn duplicates_collapse() {
        let d = AddressReconciler::diff(
            &[],
            &nets(&["10.0.0.1/24", "10.0.0.1/24", "10.0.0.2/24"]),
        );
        assert_eq!(d.to_add, nets(&["10.0.0.1/24", "10.0.0.2/24"]));
    }

    #[test]
    fn malformed_cidr_is_validation_error() {
        let err = AddressReconciler::diff_str(&["10.0.0.1/24"], &["10.0.0.300/24"]).unwrap_err();
        assert_eq!(err.kind(), rol_common::ErrorKind::Validation);
    }
}
