//! kvmgr - KVM virtual machine manager.
//!
//! kvmgr drives libvirt through `virsh` to provision and operate VMs, and
//! exports their disks to portable formats (qcow2, raw, vdi, vmdk, ova) as
//! background jobs.
//!
//! # Layout
//!
//! - [`vm`]: hypervisor driver, provisioning, cloud-init and templates
//! - [`export`]: job store, format converters and the export manager
//! - [`api`]: the HTTP surface
//! - [`command`]: external process execution with timeouts and cancellation

pub mod api;
pub mod command;
pub mod config;
pub mod error;
pub mod export;
pub mod host;
pub mod vm;
pub mod xml;

#[cfg(test)]
mod testing;

pub use config::ServiceConfig;
pub use error::{Error, Result};

/// Service version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
