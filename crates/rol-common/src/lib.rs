//! # rol-common
//!
//! Shared utilities and types for the ROL lab management backend.
//!
//! This crate provides functionality used across the ROL crates:
//! - Validated link names and VLAN IDs
//! - Standard filesystem paths
//! - The common error type and its classification

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{ErrorKind, ResultExt, RolError, RolResult};
pub use id::{LinkName, VlanId};
pub use paths::RolPaths;
