//! Netfilter traffic rules.
//!
//! A rule has no identity of its own: it is identified by the tuple
//! (table, chain, target, source, destination) and is created or deleted
//! as a whole.

use std::fmt;
use std::str::FromStr;

use ipnet::IpNet;
use rol_common::{RolError, RolResult};
use serde::{Deserialize, Serialize};

use crate::reconcile::parse_cidr;

/// Netfilter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    /// The default `filter` table.
    Filter,
    /// The `nat` table.
    Nat,
    /// The `mangle` table.
    Mangle,
    /// The `raw` table.
    Raw,
}

impl Table {
    /// Get the table name as used by iptables.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Nat => "nat",
            Self::Mangle => "mangle",
            Self::Raw => "raw",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Table {
    type Err = RolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "filter" => Ok(Self::Filter),
            "nat" => Ok(Self::Nat),
            "mangle" => Ok(Self::Mangle),
            "raw" => Ok(Self::Raw),
            other => Err(RolError::validation(
                "table",
                format!("unknown netfilter table '{other}'"),
            )),
        }
    }
}

/// A netfilter rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrafficRule {
    /// Chain name, e.g. `POSTROUTING`.
    pub chain: String,
    /// Jump target, e.g. `MASQUERADE`, `ACCEPT`, `DROP`.
    pub target: String,
    /// Source network; `None` matches any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<IpNet>,
    /// Destination network; `None` matches any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<IpNet>,
}

impl TrafficRule {
    /// Create a rule matching any source and destination.
    pub fn new(chain: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            target: target.into(),
            source: None,
            destination: None,
        }
    }

    /// A `POSTROUTING -s <subnet> -j MASQUERADE` rule.
    #[must_use]
    pub fn masquerade(subnet: IpNet) -> Self {
        Self::new("POSTROUTING", "MASQUERADE").from(subnet)
    }

    /// Set the source network. Host bits are cleared.
    #[must_use]
    pub fn from(mut self, source: IpNet) -> Self {
        self.source = Some(source.trunc());
        self
    }

    /// Set the destination network. Host bits are cleared.
    #[must_use]
    pub fn to(mut self, destination: IpNet) -> Self {
        self.destination = Some(destination.trunc());
        self
    }

    /// Clear host bits in source and destination.
    ///
    /// iptables stores and lists networks, so `10.0.0.1/8` and `10.0.0.0/8`
    /// are the same rule.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.source = self.source.map(|n| n.trunc());
        self.destination = self.destination.map(|n| n.trunc());
        self
    }

    /// Build a rule from the string form used by callers, where an empty
    /// source or destination means "any".
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed CIDR or an invalid chain
    /// or target.
    pub fn parse(chain: &str, target: &str, source: &str, destination: &str) -> RolResult<Self> {
        let rule = Self {
            chain: chain.to_string(),
            target: target.to_string(),
            source: parse_optional_cidr(source)?,
            destination: parse_optional_cidr(destination)?,
        };
        rule.validate()?;
        Ok(rule)
    }

    /// Check chain and target.
    ///
    /// # Errors
    ///
    /// Returns a validation error if either is empty or contains whitespace.
    pub fn validate(&self) -> RolResult<()> {
        validate_word("chain", &self.chain)?;
        validate_word("target", &self.target)
    }

    /// The `-s`/`-d`/`-j` match arguments in iptables syntax.
    #[must_use]
    pub fn match_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(6);
        if let Some(source) = &self.source {
            args.push("-s".to_string());
            args.push(source.to_string());
        }
        if let Some(destination) = &self.destination {
            args.push("-d".to_string());
            args.push(destination.to_string());
        }
        args.push("-j".to_string());
        args.push(self.target.clone());
        args
    }
}

impl fmt::Display for TrafficRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.chain, self.match_args().join(" "))
    }
}

fn parse_optional_cidr(value: &str) -> RolResult<Option<IpNet>> {
    if value.trim().is_empty() {
        Ok(None)
    } else {
        parse_cidr(value).map(|net| Some(net.trunc()))
    }
}

fn validate_word(field: &str, value: &str) -> RolResult<()> {
    if value.is_empty() {
        return Err(RolError::validation(field, "must not be empty"));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(RolError::validation(
            field,
            format!("'{value}' must not contain whitespace"),
        ));
    }
    Ok(())
}
