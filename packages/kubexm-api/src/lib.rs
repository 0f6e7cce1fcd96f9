//! Declarative cluster model for kubexm.
//!
//! This crate owns the input side of the cluster lifecycle manager:
//! - `ClusterConfig` - the YAML cluster specification with typed accessors
//! - `Host` / `HostSpec` / `HostFacts` - roster records and probed OS facts
//! - `Role` - the closed set of node roles
//! - host range expansion (`node[01:05]` style patterns)
//! - the on-disk workspace layout (`<workdir>/.kubexm/<cluster>/...`)
//!
//! The planner and executor live in `kubexm-engine`; this crate is pure
//! data and carries no I/O beyond reading config files.

pub mod config;
pub mod error;
pub mod expand;
pub mod host;
pub mod layout;

pub use config::{ClusterConfig, ClusterSpec, EtcdKind, RuntimeKind};
pub use error::{ConfigError, Result};
pub use expand::expand;
pub use host::{Host, HostFacts, HostSpec, InitSystem, PackageManager, Role};
pub use layout::{BomKind, WorkspaceLayout, Zone};
