//! Link name and VLAN ID validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{RolError, RolResult};

/// A validated network interface name.
///
/// Link names must:
/// - Be 1-15 bytes long (the kernel's `IFNAMSIZ` minus the terminator)
/// - Not contain `/`, `:` or whitespace
/// - Not be `.` or `..`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LinkName(String);

impl LinkName {
    /// Maximum length of a link name.
    pub const MAX_LENGTH: usize = 15;

    /// Create a new link name, validating the format.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the name is not a legal interface name.
    pub fn new(name: impl Into<String>) -> RolResult<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Get the link name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> RolResult<()> {
        if name.is_empty() || name.len() > Self::MAX_LENGTH {
            return Err(RolError::validation(
                "name",
                format!(
                    "'{name}' must be 1-{} bytes long",
                    Self::MAX_LENGTH
                ),
            ));
        }

        if name == "." || name == ".." {
            return Err(RolError::validation("name", format!("'{name}' is reserved")));
        }

        if let Some(c) = name
            .chars()
            .find(|c| *c == '/' || *c == ':' || c.is_whitespace())
        {
            return Err(RolError::validation(
                "name",
                format!("'{name}' contains forbidden character {c:?}"),
            ));
        }

        Ok(())
    }
}

impl fmt::Display for LinkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LinkName {
    type Err = RolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for LinkName {
    type Error = RolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LinkName> for String {
    fn from(name: LinkName) -> Self {
        name.0
    }
}

impl AsRef<str> for LinkName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// An 802.1Q VLAN identifier in the range 1-4094.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct VlanId(u16);

impl VlanId {
    /// Smallest usable VLAN ID.
    pub const MIN: u16 = 1;
    /// Largest usable VLAN ID.
    pub const MAX: u16 = 4094;

    /// Create a VLAN ID, validating the range.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `id` is outside 1-4094.
    pub fn new(id: u16) -> RolResult<Self> {
        if (Self::MIN..=Self::MAX).contains(&id) {
            Ok(Self(id))
        } else {
            Err(RolError::validation(
                "vlan_id",
                format!("{id} is outside {}-{}", Self::MIN, Self::MAX),
            ))
        }
    }

    /// The raw VLAN ID.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u16> for VlanId {
    type Error = RolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<i64> for VlanId {
    type Error = RolError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u16::try_from(value)
            .map_err(|_| RolError::validation("vlan_id", format!("{value} is out of range")))
            .and_then(Self::new)
    }
}

impl From<VlanId> for u16 {
    fn from(id: VlanId) -> Self {
        id.0
    }
}

impl FromStr for VlanId {
    type Err = RolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id: u16 = s
            .parse()
            .map_err(|_| RolError::validation("vlan_id", format!("'{s}' is not a number")))?;
        Self::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn valid_link_names() {
        assert!(LinkName::new("eth0").is_ok());
        assert!(LinkName::new("enp0s8.100").is_ok());
        assert!(LinkName::new("rol.lab1").is_ok());
        assert!(LinkName::new("a".repeat(15)).is_ok());
    }

    #[test]
    fn invalid_link_names() {
        assert!(LinkName::new("").is_err());
        assert!(LinkName::new(".").is_err());
        assert!(LinkName::new("..").is_err());
        assert!(LinkName::new("eth/0").is_err());
        assert!(LinkName::new("eth:0").is_err());
        assert!(LinkName::new("eth 0").is_err());
        assert!(LinkName::new("a".repeat(16)).is_err());
    }

    #[test]
    fn link_name_error_is_validation() {
        let err = LinkName::new("").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn vlan_id_range() {
        assert!(VlanId::new(0).is_err());
        assert_eq!(VlanId::new(1).unwrap().get(), 1);
        assert_eq!(VlanId::new(4094).unwrap().get(), 4094);
        assert!(VlanId::new(4095).is_err());
        assert!(VlanId::try_from(-1_i64).is_err());
        assert!(VlanId::try_from(70_000_i64).is_err());
    }

    #[test]
    fn vlan_id_parsing() {
        let id: VlanId = "100".parse().unwrap();
        assert_eq!(id.to_string(), "100");
        assert!("abc".parse::<VlanId>().is_err());
    }

    #[test]
    fn serde_rejects_invalid() {
        let ok: LinkName = serde_json::from_str("\"rol.lab1\"").unwrap();
        assert_eq!(ok.as_str(), "rol.lab1");
        assert!(serde_json::from_str::<LinkName>("\"bad name\"").is_err());
        assert!(serde_json::from_str::<VlanId>("5000").is_err());
    }
}
