//! VM orchestration layer.
//!
//! This module provides the abstractions the export pipeline and the HTTP API
//! use to reach the hypervisor:
//! - [`HypervisorDriver`]: domain lifecycle and snapshots
//! - [`VolumeManager`]: storage pool volumes
//! - [`VmOrchestrator`]: provisioning and lifecycle on top of both
//! - [`VirshDriver`]: the production driver, backed by `virsh`

pub mod cloud_init;
pub mod domain_xml;
pub mod info;
pub mod orchestrator;
pub mod params;
pub mod template;
pub mod virsh;

use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub use info::{CpuInfo, DiskInfo, MemoryInfo, NetInfo, Snapshot, SnapshotParams, VmInfo, VmStatus};
pub use orchestrator::VmOrchestrator;
pub use params::{DiskFormat, VmParams};
pub use template::{FileTemplateCatalog, TemplateCatalog};
pub use virsh::VirshDriver;

/// Pool used when a disk does not name one.
pub const DEFAULT_POOL: &str = "default";

/// Controls hypervisor domains.
///
/// Implementations must be safe to share between the export pipeline's
/// background tasks and request handlers.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Define and start a domain. The disk volume must already exist.
    async fn create(&self, params: &VmParams, cloud_init_iso: Option<&Path>) -> Result<VmInfo>;

    /// Look up a domain by name.
    ///
    /// Returns [`Error::VmNotFound`](crate::error::Error::VmNotFound) when the
    /// domain does not exist.
    async fn get(&self, name: &str) -> Result<VmInfo>;

    /// All defined domains.
    async fn list(&self) -> Result<Vec<VmInfo>>;

    /// Boot a stopped domain.
    async fn start(&self, name: &str) -> Result<()>;

    /// Ask the guest to shut down.
    async fn stop(&self, name: &str) -> Result<()>;

    /// Pull the plug.
    async fn force_stop(&self, name: &str) -> Result<()>;

    /// Undefine the domain. Volumes are left in place.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Take a snapshot.
    async fn create_snapshot(&self, vm: &str, params: &SnapshotParams) -> Result<Snapshot>;

    /// Snapshots of a domain.
    async fn list_snapshots(&self, vm: &str) -> Result<Vec<Snapshot>>;

    /// One snapshot by name.
    async fn get_snapshot(&self, vm: &str, snapshot: &str) -> Result<Snapshot>;

    /// Delete a snapshot.
    async fn delete_snapshot(&self, vm: &str, snapshot: &str) -> Result<()>;

    /// Roll the domain back to a snapshot.
    async fn revert_snapshot(&self, vm: &str, snapshot: &str) -> Result<()>;
}

/// Resolves and allocates storage pool volumes.
#[async_trait]
pub trait VolumeManager: Send + Sync {
    /// Filesystem path of `volume` in `pool`.
    async fn get_path(&self, pool: &str, volume: &str) -> Result<PathBuf>;

    /// Allocate an empty volume.
    async fn create(
        &self,
        pool: &str,
        volume: &str,
        capacity_bytes: u64,
        format: DiskFormat,
    ) -> Result<PathBuf>;

    /// Allocate a volume seeded from an image file.
    async fn create_from_image(
        &self,
        pool: &str,
        volume: &str,
        image: &Path,
        format: DiskFormat,
    ) -> Result<PathBuf>;

    /// Delete a volume.
    async fn delete(&self, pool: &str, volume: &str) -> Result<()>;
}
