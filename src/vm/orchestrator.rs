//! VM provisioning and lifecycle.
//!
//! [`VmOrchestrator`] sits above the hypervisor driver. Creation is a
//! sequence of template, validation, disk, cloud-init seed and domain steps,
//! each undoing the earlier ones on failure.

use crate::error::{Error, Result};
use crate::host::FileSystem;
use crate::vm::cloud_init::CloudInitBuilder;
use crate::vm::info::{Snapshot, SnapshotParams, VmInfo, VmStatus};
use crate::vm::params::{volume_name, VmParams};
use crate::vm::template::TemplateCatalog;
use crate::vm::{HypervisorDriver, VolumeManager};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Defaults applied to every new VM.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Pool new disks are allocated in.
    pub storage_pool: String,
    /// Network new NICs attach to.
    pub network: String,
    /// Directory holding cloud-init seed ISOs.
    pub cloud_init_dir: PathBuf,
}

/// Creates, operates and deletes VMs.
#[derive(Clone)]
pub struct VmOrchestrator {
    driver: Arc<dyn HypervisorDriver>,
    volumes: Arc<dyn VolumeManager>,
    templates: Option<Arc<dyn TemplateCatalog>>,
    cloud_init: CloudInitBuilder,
    fs: Arc<dyn FileSystem>,
    config: OrchestratorConfig,
}

impl VmOrchestrator {
    /// Wire the orchestrator to its collaborators.
    pub fn new(
        driver: Arc<dyn HypervisorDriver>,
        volumes: Arc<dyn VolumeManager>,
        cloud_init: CloudInitBuilder,
        fs: Arc<dyn FileSystem>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            driver,
            volumes,
            templates: None,
            cloud_init,
            fs,
            config,
        }
    }

    /// Resolve `VmParams::template` against `catalog`.
    pub fn with_templates(mut self, catalog: Arc<dyn TemplateCatalog>) -> Self {
        self.templates = Some(catalog);
        self
    }

    /// The underlying driver.
    pub fn driver(&self) -> &Arc<dyn HypervisorDriver> {
        &self.driver
    }

    /// The underlying volume manager.
    pub fn volumes(&self) -> &Arc<dyn VolumeManager> {
        &self.volumes
    }

    /// Path of the cloud-init seed for `name`.
    pub fn cloud_init_iso_path(&self, name: &str) -> PathBuf {
        self.config
            .cloud_init_dir
            .join(format!("{}-cloudinit.iso", name))
    }

    /// Provision and boot a new VM.
    pub async fn create(&self, mut params: VmParams) -> Result<VmInfo> {
        if let Some(template) = params.template.clone().filter(|t| !t.is_empty()) {
            let catalog = self
                .templates
                .as_ref()
                .ok_or_else(|| Error::Template("no template catalog configured".to_string()))?;
            catalog.apply(&template, &mut params)?;
        }
        params.validate()?;
        let params = params.with_defaults(&self.config.storage_pool, &self.config.network);

        let pool = params.storage_pool().to_string();
        let volume = volume_name(&params.name, 0);
        tracing::debug!(vm_name = %params.name, pool = %pool, volume = %volume, "creating vm disk");
        match &params.disk.source_image {
            Some(image) => {
                self.volumes
                    .create_from_image(&pool, &volume, Path::new(image), params.disk_format())
                    .await?;
            }
            None => {
                self.volumes
                    .create(&pool, &volume, params.disk.size_bytes, params.disk_format())
                    .await?;
            }
        }

        let iso = self.cloud_init_iso_path(&params.name);
        if let Err(e) = self.setup_cloud_init(&params, &iso).await {
            self.cleanup_disk(&pool, &volume).await;
            return Err(e);
        }

        match self.driver.create(&params, Some(&iso)).await {
            Ok(vm) => {
                tracing::info!(vm_name = %vm.name, "vm created");
                Ok(vm)
            }
            Err(e) => {
                self.cleanup_disk(&pool, &volume).await;
                self.cleanup_iso(&iso);
                Err(e)
            }
        }
    }

    /// Undefine a VM and release its disks and seed ISO.
    ///
    /// Volume and ISO removal failures are logged; the domain is gone either
    /// way.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let vm = self.driver.get(name).await?;
        self.driver.delete(name).await?;

        for disk in &vm.disks {
            let pool = if disk.storage_pool.is_empty() {
                self.config.storage_pool.as_str()
            } else {
                disk.storage_pool.as_str()
            };
            let Some(volume) = Path::new(&disk.path).file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            tracing::debug!(vm_name = name, pool, volume, "deleting disk volume");
            if let Err(e) = self.volumes.delete(pool, volume).await {
                tracing::warn!(vm_name = name, pool, volume, error = %e, "failed to delete disk volume");
            }
        }
        self.cleanup_iso(&self.cloud_init_iso_path(name));

        tracing::info!(vm_name = name, "vm deleted");
        Ok(())
    }

    /// Look up one VM.
    pub async fn get(&self, name: &str) -> Result<VmInfo> {
        self.driver.get(name).await
    }

    /// All VMs.
    pub async fn list(&self) -> Result<Vec<VmInfo>> {
        self.driver.list().await
    }

    /// Boot a VM.
    pub async fn start(&self, name: &str) -> Result<()> {
        self.driver.start(name).await?;
        tracing::info!(vm_name = name, "vm started");
        Ok(())
    }

    /// Gracefully shut a VM down.
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.driver.stop(name).await?;
        tracing::info!(vm_name = name, "vm stopped");
        Ok(())
    }

    /// Power a VM off immediately.
    pub async fn force_stop(&self, name: &str) -> Result<()> {
        self.driver.force_stop(name).await?;
        tracing::info!(vm_name = name, "vm force stopped");
        Ok(())
    }

    /// Stop the VM if it is running, then start it.
    pub async fn restart(&self, name: &str) -> Result<()> {
        let vm = self.driver.get(name).await?;
        if vm.status == VmStatus::Running {
            self.driver.stop(name).await?;
        }
        self.driver.start(name).await?;
        tracing::info!(vm_name = name, "vm restarted");
        Ok(())
    }

    /// Take a snapshot.
    pub async fn create_snapshot(&self, vm: &str, params: &SnapshotParams) -> Result<Snapshot> {
        require_snapshot_name(&params.name)?;
        self.driver.create_snapshot(vm, params).await
    }

    /// Snapshots of a VM.
    pub async fn list_snapshots(&self, vm: &str) -> Result<Vec<Snapshot>> {
        self.driver.list_snapshots(vm).await
    }

    /// One snapshot.
    pub async fn get_snapshot(&self, vm: &str, snapshot: &str) -> Result<Snapshot> {
        require_snapshot_name(snapshot)?;
        self.driver.get_snapshot(vm, snapshot).await
    }

    /// Delete a snapshot.
    pub async fn delete_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        require_snapshot_name(snapshot)?;
        self.driver.delete_snapshot(vm, snapshot).await
    }

    /// Revert to a snapshot.
    pub async fn revert_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        require_snapshot_name(snapshot)?;
        self.driver.revert_snapshot(vm, snapshot).await
    }

    async fn setup_cloud_init(&self, params: &VmParams, iso: &Path) -> Result<()> {
        let config = self.cloud_init.generate(params)?;
        tracing::debug!(vm_name = %params.name, path = %iso.display(), "creating cloud-init iso");
        self.cloud_init
            .build_iso(&CancellationToken::new(), &config, iso)
            .await
    }

    async fn cleanup_disk(&self, pool: &str, volume: &str) {
        if let Err(e) = self.volumes.delete(pool, volume).await {
            tracing::warn!(pool, volume, error = %e, "failed to clean up disk volume");
        }
    }

    fn cleanup_iso(&self, iso: &Path) {
        if let Err(e) = self.fs.remove_file(iso) {
            tracing::warn!(path = %iso.display(), error = %e, "failed to clean up cloud-init iso");
        }
    }
}

fn require_snapshot_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidParams("snapshot name is required".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::OsFileSystem;
    use crate::testing::{vm_info, FakeHypervisor, FakeVolumes, RecordingRunner};
    use crate::vm::params::{CpuParams, DiskParams, MemoryParams, MIN_DISK_BYTES};
    use crate::vm::template::FileTemplateCatalog;
    use std::collections::HashMap;

    struct Fixture {
        driver: Arc<FakeHypervisor>,
        volumes: Arc<FakeVolumes>,
        runner: Arc<RecordingRunner>,
        orchestrator: VmOrchestrator,
        _dir: tempfile::TempDir,
    }

    fn fixture(runner: RecordingRunner) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeHypervisor::new());
        let volumes = Arc::new(FakeVolumes::new());
        let runner = Arc::new(runner);
        let orchestrator = VmOrchestrator::new(
            driver.clone(),
            volumes.clone(),
            CloudInitBuilder::new(runner.clone()),
            Arc::new(OsFileSystem),
            OrchestratorConfig {
                storage_pool: "vms".into(),
                network: "lan".into(),
                cloud_init_dir: dir.path().to_path_buf(),
            },
        );
        Fixture {
            driver,
            volumes,
            runner,
            orchestrator,
            _dir: dir,
        }
    }

    fn params(name: &str) -> VmParams {
        VmParams {
            name: name.into(),
            cpu: CpuParams {
                count: 2,
                model: String::new(),
            },
            memory: MemoryParams {
                size_bytes: 1024 * 1024 * 1024,
            },
            disk: DiskParams {
                size_bytes: 5 * MIN_DISK_BYTES,
                ..DiskParams::default()
            },
            ..VmParams::default()
        }
    }

    #[tokio::test]
    async fn test_create_provisions_disk_seed_and_domain() {
        let f = fixture(RecordingRunner::new());
        let vm = f.orchestrator.create(params("web")).await.unwrap();

        assert_eq!(vm.name, "web");
        assert_eq!(vm.status, VmStatus::Running);
        assert!(f.volumes.contains("vms", "web-disk-0"));
        let iso = f.orchestrator.cloud_init_iso_path("web");
        let calls = f.runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].args.contains(&iso.display().to_string()));

        let created = f.driver.created_params();
        assert_eq!(created[0].network.source.as_deref(), Some("lan"));
        assert_eq!(created[0].cpu.model, "host-model");
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_params_without_side_effects() {
        let f = fixture(RecordingRunner::new());
        let mut p = params("web");
        p.cpu.count = 0;
        let err = f.orchestrator.create(p).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
        assert!(f.volumes.calls().is_empty());
    }

    #[tokio::test]
    async fn test_seed_failure_deletes_disk() {
        let f = fixture(RecordingRunner::new().fail("genisoimage", "I/O error"));
        let err = f.orchestrator.create(params("web")).await.unwrap_err();
        assert!(matches!(err, Error::CloudInit(_)), "unexpected error: {err}");
        assert!(!f.volumes.contains("vms", "web-disk-0"));
        assert!(f.driver.created_params().is_empty());
    }

    #[tokio::test]
    async fn test_domain_failure_deletes_disk_and_seed() {
        let f = fixture(RecordingRunner::new());
        f.driver.fail("create");
        let iso = f.orchestrator.cloud_init_iso_path("web");
        std::fs::write(&iso, b"seed").unwrap();

        assert!(f.orchestrator.create(params("web")).await.is_err());
        assert!(!f.volumes.contains("vms", "web-disk-0"));
        assert!(!iso.exists());
    }

    #[tokio::test]
    async fn test_create_applies_template() {
        let f = fixture(RecordingRunner::new());
        let mut templates = HashMap::new();
        templates.insert("large".to_string(), params("ignored"));
        let orchestrator = f
            .orchestrator
            .clone()
            .with_templates(Arc::new(FileTemplateCatalog::from_templates(templates)));

        let request = VmParams {
            name: "db".into(),
            template: Some("large".into()),
            ..VmParams::default()
        };
        let vm = orchestrator.create(request).await.unwrap();
        assert_eq!(vm.name, "db");
        assert_eq!(vm.cpu.count, 2);
    }

    #[tokio::test]
    async fn test_delete_releases_volumes() {
        let f = fixture(RecordingRunner::new());
        let mut vm = vm_info("old", "/pool/vms/old-disk-0");
        vm.disks[0].storage_pool = String::new();
        f.driver.insert(vm);
        f.volumes.insert("vms", "old-disk-0", "/pool/vms/old-disk-0");

        f.orchestrator.delete("old").await.unwrap();

        assert!(matches!(f.driver.get("old").await, Err(Error::VmNotFound(_))));
        assert!(!f.volumes.contains("vms", "old-disk-0"));
    }

    #[tokio::test]
    async fn test_restart_stops_running_vm_first() {
        let f = fixture(RecordingRunner::new());
        f.driver.insert(vm_info("web", "/pool/web-disk-0"));
        f.orchestrator.restart("web").await.unwrap();
        assert_eq!(f.driver.calls(), vec!["stop:web", "start:web"]);
    }

    #[tokio::test]
    async fn test_snapshot_name_required() {
        let f = fixture(RecordingRunner::new());
        let err = f
            .orchestrator
            .create_snapshot("web", &SnapshotParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
    }
}
