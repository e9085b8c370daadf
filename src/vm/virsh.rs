//! Hypervisor driver backed by the `virsh` command line client.

use crate::command::{CommandOptions, CommandOutput, CommandRunner};
use crate::error::{Error, Result};
use crate::host::FileSystem;
use crate::vm::domain_xml::{parse_domain, render_domain};
use crate::vm::info::{Snapshot, SnapshotParams, VmInfo, VmStatus};
use crate::vm::params::{volume_name, DiskFormat, VmParams};
use crate::vm::{HypervisorDriver, VolumeManager};
use crate::xml::parse_dom;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default limit for a single virsh invocation.
pub const DEFAULT_VIRSH_TIMEOUT: Duration = Duration::from_secs(60);

const NOT_FOUND_MARKERS: [&str; 3] = [
    "failed to get domain",
    "Domain not found",
    "domain not found",
];

/// [`HypervisorDriver`] and [`VolumeManager`] on top of `virsh`.
#[derive(Clone)]
pub struct VirshDriver {
    runner: Arc<dyn CommandRunner>,
    fs: Arc<dyn FileSystem>,
    uri: Option<String>,
    timeout: Duration,
}

impl VirshDriver {
    /// Create a driver connecting to `uri` (libvirt's default when `None`).
    pub fn new(runner: Arc<dyn CommandRunner>, fs: Arc<dyn FileSystem>, uri: Option<String>) -> Self {
        Self {
            runner,
            fs,
            uri,
            timeout: DEFAULT_VIRSH_TIMEOUT,
        }
    }

    /// Override the per-invocation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn virsh(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut argv: Vec<String> = Vec::with_capacity(args.len() + 2);
        if let Some(uri) = &self.uri {
            argv.push("-c".to_string());
            argv.push(uri.clone());
        }
        argv.extend(args.iter().map(|a| a.to_string()));

        // virsh calls are short; the export pipeline handles cancellation
        // around them.
        let token = CancellationToken::new();
        self.runner
            .run(&token, "virsh", &argv, &CommandOptions::with_timeout(self.timeout))
            .await
            .map_err(|e| match e {
                Error::CommandNotFound(_) => Error::hypervisor("virsh is not installed"),
                Error::CommandFailed { message, .. } => {
                    Error::hypervisor(format!("virsh {}: {}", args.first().unwrap_or(&""), message))
                }
                other => other,
            })
    }

    /// Run a command about domain `name`, mapping lookup failures to
    /// [`Error::VmNotFound`].
    async fn domain_cmd(&self, name: &str, args: &[&str]) -> Result<CommandOutput> {
        self.virsh(args).await.map_err(|e| match e {
            Error::Hypervisor(msg) if NOT_FOUND_MARKERS.iter().any(|m| msg.contains(m)) => {
                Error::VmNotFound(name.to_string())
            }
            other => other,
        })
    }

    async fn state(&self, name: &str) -> Result<VmStatus> {
        let out = self.domain_cmd(name, &["domstate", name]).await?;
        Ok(VmStatus::from_domstate(&out.stdout_lossy()))
    }

    async fn current_snapshot(&self, vm: &str) -> Option<String> {
        match self.domain_cmd(vm, &["snapshot-current", vm, "--name"]).await {
            Ok(out) => Some(out.stdout_lossy().trim().to_string()).filter(|s| !s.is_empty()),
            Err(_) => None,
        }
    }
}

#[async_trait]
impl HypervisorDriver for VirshDriver {
    async fn create(&self, params: &VmParams, cloud_init_iso: Option<&Path>) -> Result<VmInfo> {
        let disk = self
            .get_path(params.storage_pool(), &volume_name(&params.name, 0))
            .await?;
        let xml = render_domain(params, &disk, cloud_init_iso)?;

        let file = tempfile::Builder::new()
            .prefix("kvmgr-domain-")
            .suffix(".xml")
            .tempfile_in(self.fs.temp_dir())?;
        self.fs.write_file(file.path(), xml.as_bytes(), 0o600)?;
        let path = file.path().display().to_string();

        self.virsh(&["define", &path]).await?;
        tracing::info!(vm_name = %params.name, "defined domain");

        if let Err(e) = self.domain_cmd(&params.name, &["start", &params.name]).await {
            if let Err(undefine) = self.virsh(&["undefine", &params.name]).await {
                tracing::warn!(vm_name = %params.name, error = %undefine, "failed to undefine domain after start failure");
            }
            return Err(e);
        }
        tracing::info!(vm_name = %params.name, "started domain");
        self.get(&params.name).await
    }

    async fn get(&self, name: &str) -> Result<VmInfo> {
        let out = self.domain_cmd(name, &["dumpxml", name]).await?;
        let mut vm = parse_domain(&out.stdout_lossy())?;
        vm.status = self.state(name).await?;
        Ok(vm)
    }

    async fn list(&self) -> Result<Vec<VmInfo>> {
        let out = self.virsh(&["list", "--all", "--name"]).await?;
        let mut vms = Vec::new();
        for name in out.stdout_lossy().lines().map(str::trim).filter(|l| !l.is_empty()) {
            match self.get(name).await {
                Ok(vm) => vms.push(vm),
                // Undefined between list and dumpxml.
                Err(Error::VmNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(vms)
    }

    async fn start(&self, name: &str) -> Result<()> {
        if self.state(name).await? == VmStatus::Running {
            tracing::info!(vm_name = name, "domain already running");
            return Ok(());
        }
        self.domain_cmd(name, &["start", name]).await?;
        tracing::info!(vm_name = name, "started domain");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        if self.state(name).await? == VmStatus::Stopped {
            tracing::info!(vm_name = name, "domain already stopped");
            return Ok(());
        }
        self.domain_cmd(name, &["shutdown", name]).await?;
        tracing::info!(vm_name = name, "shut down domain");
        Ok(())
    }

    async fn force_stop(&self, name: &str) -> Result<()> {
        if self.state(name).await? == VmStatus::Stopped {
            tracing::info!(vm_name = name, "domain already stopped");
            return Ok(());
        }
        self.domain_cmd(name, &["destroy", name]).await?;
        tracing::info!(vm_name = name, "force stopped domain");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        if self.state(name).await?.is_active() {
            self.domain_cmd(name, &["destroy", name]).await?;
        }
        self.domain_cmd(name, &["undefine", name, "--snapshots-metadata"])
            .await?;
        tracing::info!(vm_name = name, "deleted domain");
        Ok(())
    }

    async fn create_snapshot(&self, vm: &str, params: &SnapshotParams) -> Result<Snapshot> {
        let mut args = vec!["snapshot-create-as", "--domain", vm, "--name", params.name.as_str()];
        if !params.description.is_empty() {
            args.push("--description");
            args.push(&params.description);
        }
        if !params.include_memory {
            args.push("--disk-only");
        }
        args.push("--atomic");
        self.domain_cmd(vm, &args).await?;
        tracing::info!(vm_name = vm, snapshot = %params.name, "created snapshot");
        self.get_snapshot(vm, &params.name).await
    }

    async fn list_snapshots(&self, vm: &str) -> Result<Vec<Snapshot>> {
        let out = self.domain_cmd(vm, &["snapshot-list", vm, "--name"]).await?;
        let current = self.current_snapshot(vm).await;
        let mut snapshots = Vec::new();
        for name in out.stdout_lossy().lines().map(str::trim).filter(|l| !l.is_empty()) {
            let xml = self
                .domain_cmd(vm, &["snapshot-dumpxml", vm, name])
                .await?;
            let mut snapshot = parse_snapshot(&xml.stdout_lossy())?;
            snapshot.is_current = current.as_deref() == Some(name);
            snapshots.push(snapshot);
        }
        Ok(snapshots)
    }

    async fn get_snapshot(&self, vm: &str, snapshot: &str) -> Result<Snapshot> {
        let xml = self
            .domain_cmd(vm, &["snapshot-dumpxml", vm, snapshot])
            .await?;
        let mut parsed = parse_snapshot(&xml.stdout_lossy())?;
        let info = self
            .domain_cmd(vm, &["snapshot-info", vm, "--snapshotname", snapshot])
            .await?;
        parsed.is_current = info
            .stdout_lossy()
            .lines()
            .filter_map(|l| l.split_once(':'))
            .any(|(k, v)| k.trim() == "Current" && v.trim() == "yes");
        Ok(parsed)
    }

    async fn delete_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        self.domain_cmd(vm, &["snapshot-delete", vm, "--snapshotname", snapshot])
            .await?;
        tracing::info!(vm_name = vm, snapshot, "deleted snapshot");
        Ok(())
    }

    async fn revert_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        self.domain_cmd(vm, &["snapshot-revert", vm, "--snapshotname", snapshot])
            .await?;
        tracing::info!(vm_name = vm, snapshot, "reverted to snapshot");
        Ok(())
    }
}

#[async_trait]
impl VolumeManager for VirshDriver {
    async fn get_path(&self, pool: &str, volume: &str) -> Result<PathBuf> {
        let out = self
            .virsh(&["vol-path", "--pool", pool, volume])
            .await
            .map_err(|e| Error::storage(format!("volume {}/{}: {}", pool, volume, e)))?;
        let path = out.stdout_lossy().trim().to_string();
        if path.is_empty() {
            return Err(Error::storage(format!("volume {}/{} has no path", pool, volume)));
        }
        Ok(PathBuf::from(path))
    }

    async fn create(
        &self,
        pool: &str,
        volume: &str,
        capacity_bytes: u64,
        format: DiskFormat,
    ) -> Result<PathBuf> {
        let capacity = capacity_bytes.to_string();
        self.virsh(&[
            "vol-create-as",
            pool,
            volume,
            &capacity,
            "--format",
            format.as_str(),
        ])
        .await
        .map_err(|e| Error::storage(format!("creating volume {}/{}: {}", pool, volume, e)))?;
        tracing::info!(pool, volume, capacity_bytes, "created volume");
        self.get_path(pool, volume).await
    }

    async fn create_from_image(
        &self,
        pool: &str,
        volume: &str,
        image: &Path,
        format: DiskFormat,
    ) -> Result<PathBuf> {
        let size = std::fs::metadata(image)
            .map_err(|e| Error::storage(format!("source image {}: {}", image.display(), e)))?
            .len();
        let path = VolumeManager::create(self, pool, volume, size, format).await?;
        let image = image.display().to_string();
        if let Err(e) = self
            .virsh(&["vol-upload", "--pool", pool, volume, &image])
            .await
        {
            if let Err(cleanup) = VolumeManager::delete(self, pool, volume).await {
                tracing::warn!(pool, volume, error = %cleanup, "failed to delete volume after upload failure");
            }
            return Err(Error::storage(format!("uploading {} to {}/{}: {}", image, pool, volume, e)));
        }
        Ok(path)
    }

    async fn delete(&self, pool: &str, volume: &str) -> Result<()> {
        self.virsh(&["vol-delete", "--pool", pool, volume])
            .await
            .map_err(|e| Error::storage(format!("deleting volume {}/{}: {}", pool, volume, e)))?;
        tracing::info!(pool, volume, "deleted volume");
        Ok(())
    }
}

/// Parse `virsh snapshot-dumpxml` output.
fn parse_snapshot(xml: &str) -> Result<Snapshot> {
    let dom = parse_dom(xml)?;
    let text = |name: &str| {
        dom.child(name)
            .map(|n| n.text.trim().to_string())
            .unwrap_or_default()
    };
    let name = text("name");
    if name.is_empty() {
        return Err(Error::Xml("snapshot has no name".to_string()));
    }
    let created_at: DateTime<Utc> = text("creationTime")
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_default();
    let parent = dom
        .child("parent")
        .and_then(|p| p.child("name"))
        .map(|n| n.text.trim().to_string())
        .filter(|n| !n.is_empty());

    Ok(Snapshot {
        name,
        description: text("description"),
        state: text("state"),
        parent,
        created_at,
        is_current: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::OsFileSystem;
    use crate::testing::RecordingRunner;
    use crate::vm::params::{CpuParams, MemoryParams};
    use parking_lot::Mutex;

    const DOMAIN: &str = "<domain type='kvm'><name>alpha</name><uuid>u-1</uuid>\
        <memory unit='KiB'>1048576</memory><vcpu>1</vcpu><devices>\
        <disk type='file' device='disk'><driver name='qemu' type='qcow2'/>\
        <source file='/pool/alpha-disk-0'/><target dev='vda' bus='virtio'/></disk>\
        </devices></domain>";

    const SNAPSHOT: &str = "<domainsnapshot><name>before-upgrade</name>\
        <description>pre 2.0</description><state>running</state>\
        <parent><name>base</name></parent><creationTime>1700000000</creationTime>\
        </domainsnapshot>";

    fn driver(runner: &Arc<RecordingRunner>) -> VirshDriver {
        VirshDriver::new(runner.clone(), Arc::new(OsFileSystem), Some("qemu:///system".into()))
    }

    /// Records `write_file` calls and forwards them to the real filesystem.
    #[derive(Default)]
    struct RecordingFs {
        writes: Mutex<Vec<(PathBuf, String, u32)>>,
    }

    impl FileSystem for RecordingFs {
        fn create_dir_all(&self, path: &Path) -> Result<()> {
            OsFileSystem.create_dir_all(path)
        }

        fn remove_dir_all(&self, path: &Path) -> Result<()> {
            OsFileSystem.remove_dir_all(path)
        }

        fn remove_file(&self, path: &Path) -> Result<()> {
            OsFileSystem.remove_file(path)
        }

        fn exists(&self, path: &Path) -> bool {
            OsFileSystem.exists(path)
        }

        fn file_size(&self, path: &Path) -> Result<u64> {
            OsFileSystem.file_size(path)
        }

        fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> Result<()> {
            self.writes.lock().push((
                path.to_path_buf(),
                String::from_utf8_lossy(contents).into_owned(),
                mode,
            ));
            OsFileSystem.write_file(path, contents, mode)
        }

        fn temp_dir(&self) -> PathBuf {
            OsFileSystem.temp_dir()
        }
    }

    #[tokio::test]
    async fn test_create_defines_domain_from_written_xml() {
        let runner = Arc::new(
            RecordingRunner::new()
                .respond("vol-path", "/pool/alpha-disk-0\n")
                .respond("dumpxml", DOMAIN)
                .respond("domstate", "running\n"),
        );
        let fs = Arc::new(RecordingFs::default());
        let driver = VirshDriver::new(runner.clone(), fs.clone(), None);
        let params = VmParams {
            name: "alpha".into(),
            cpu: CpuParams {
                count: 1,
                model: String::new(),
            },
            memory: MemoryParams {
                size_bytes: 1024 * 1024 * 1024,
            },
            ..VmParams::default()
        }
        .with_defaults("default", "default");

        let vm = HypervisorDriver::create(&driver, &params, None).await.unwrap();
        assert_eq!(vm.name, "alpha");

        let writes = fs.writes.lock().clone();
        assert_eq!(writes.len(), 1);
        let (path, xml, mode) = &writes[0];
        assert_eq!(*mode, 0o600);
        assert!(xml.contains("<name>alpha</name>"), "{}", xml);
        assert!(xml.contains("/pool/alpha-disk-0"));
        assert!(!path.exists());

        let define = runner
            .calls()
            .into_iter()
            .find(|c| c.args.first().map(String::as_str) == Some("define"))
            .unwrap();
        assert_eq!(define.args[1], path.display().to_string());
    }

    #[tokio::test]
    async fn test_get_combines_dumpxml_and_domstate() {
        let runner = Arc::new(
            RecordingRunner::new()
                .respond("dumpxml", DOMAIN)
                .respond("domstate", "running\n"),
        );
        let vm = driver(&runner).get("alpha").await.unwrap();
        assert_eq!(vm.name, "alpha");
        assert_eq!(vm.status, VmStatus::Running);

        let calls = runner.calls();
        assert_eq!(calls[0].program, "virsh");
        assert_eq!(calls[0].args, vec!["-c", "qemu:///system", "dumpxml", "alpha"]);
    }

    #[tokio::test]
    async fn test_missing_domain_maps_to_vm_not_found() {
        let runner = Arc::new(RecordingRunner::new().fail(
            "dumpxml",
            "error: failed to get domain 'ghost'",
        ));
        let err = driver(&runner).get("ghost").await.unwrap_err();
        assert!(matches!(err, Error::VmNotFound(ref n) if n == "ghost"), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_stop_is_noop_when_already_stopped() {
        let runner = Arc::new(RecordingRunner::new().respond("domstate", "shut off\n"));
        driver(&runner).stop("alpha").await.unwrap();
        let subcommands: Vec<String> = runner.calls().iter().map(|c| c.args[2].clone()).collect();
        assert_eq!(subcommands, vec!["domstate"]);
    }

    #[tokio::test]
    async fn test_vol_path() {
        let runner = Arc::new(RecordingRunner::new().respond("vol-path", "/pool/alpha-disk-0\n"));
        let path = driver(&runner).get_path("default", "alpha-disk-0").await.unwrap();
        assert_eq!(path, PathBuf::from("/pool/alpha-disk-0"));
        assert_eq!(
            runner.calls()[0].args[2..],
            ["vol-path", "--pool", "default", "alpha-disk-0"]
        );
    }

    #[tokio::test]
    async fn test_vol_path_failure_is_storage_error() {
        let runner = Arc::new(RecordingRunner::new().fail("vol-path", "Storage volume not found"));
        let err = driver(&runner).get_path("custom", "z.qcow2").await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_snapshot_lookup() {
        let runner = Arc::new(
            RecordingRunner::new()
                .respond("snapshot-dumpxml", SNAPSHOT)
                .respond("snapshot-info", "Name:           before-upgrade\nCurrent:        yes\n"),
        );
        let snapshot = driver(&runner).get_snapshot("alpha", "before-upgrade").await.unwrap();
        assert_eq!(snapshot.name, "before-upgrade");
        assert_eq!(snapshot.description, "pre 2.0");
        assert_eq!(snapshot.parent.as_deref(), Some("base"));
        assert_eq!(snapshot.created_at.timestamp(), 1_700_000_000);
        assert!(snapshot.is_current);
    }
}
