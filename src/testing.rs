//! Test doubles for the host capabilities, the command runner and the
//! hypervisor traits.

use crate::command::{display_command, CommandOptions, CommandOutput, CommandRunner};
use crate::error::{Error, Result};
use crate::host::{Clock, IdGenerator};
use crate::vm::info::{CpuInfo, DiskInfo, MemoryInfo, Snapshot, SnapshotParams, VmInfo, VmStatus};
use crate::vm::params::{DiskFormat, VmParams};
use crate::vm::{HypervisorDriver, VolumeManager};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Clock frozen at 2024-03-01T12:00:00Z.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Default for FixedClock {
    fn default() -> Self {
        Self(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Ids `id-1`, `id-2`, ...
#[derive(Debug, Default)]
pub struct SequentialIds(AtomicUsize);

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> String {
        format!("id-{}", self.0.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// One invocation seen by [`RecordingRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
enum Behavior {
    Respond(String),
    Fail(String),
    Missing,
    Block,
}

/// Scripted [`CommandRunner`].
///
/// Rules are keyed by a program name or any single argument; the first
/// matching rule applies and unmatched commands succeed with empty output.
/// Successful `qemu-img` and `tar` runs create their output file so callers
/// that inspect the artifact see one.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    rules: Vec<(String, Behavior)>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Succeed with `stdout`.
    pub fn respond(mut self, key: &str, stdout: &str) -> Self {
        self.rules.push((key.to_string(), Behavior::Respond(stdout.to_string())));
        self
    }

    /// Exit nonzero with `stderr`.
    pub fn fail(mut self, key: &str, stderr: &str) -> Self {
        self.rules.push((key.to_string(), Behavior::Fail(stderr.to_string())));
        self
    }

    /// Report the program as not installed.
    pub fn missing(mut self, program: &str) -> Self {
        self.rules.push((program.to_string(), Behavior::Missing));
        self
    }

    /// Hang until canceled.
    pub fn block(mut self, key: &str) -> Self {
        self.rules.push((key.to_string(), Behavior::Block));
        self
    }

    /// Every invocation so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Wait until at least `n` invocations were recorded.
    pub async fn wait_for_calls(&self, n: usize) {
        for _ in 0..500 {
            if self.calls.lock().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} command invocations, saw {:?}", n, self.calls());
    }

    fn behavior(&self, program: &str, args: &[String]) -> Option<Behavior> {
        self.rules
            .iter()
            .find(|(key, _)| key == program || args.iter().any(|a| a == key))
            .map(|(_, b)| b.clone())
    }
}

fn artifact_path(program: &str, args: &[String]) -> Option<PathBuf> {
    let tool = if program == "sudo" {
        args.first().map(String::as_str)?
    } else {
        program
    };
    match tool {
        "qemu-img" => args.last().map(PathBuf::from),
        "tar" => args
            .iter()
            .position(|a| a == "-cf")
            .and_then(|i| args.get(i + 1))
            .map(PathBuf::from),
        _ => None,
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
        _options: &CommandOptions,
    ) -> Result<CommandOutput> {
        self.calls.lock().push(RecordedCall {
            program: program.to_string(),
            args: args.to_vec(),
        });
        let command = display_command(program, args);
        if cancel.is_cancelled() {
            return Err(Error::Canceled(command));
        }

        match self.behavior(program, args) {
            Some(Behavior::Fail(stderr)) => Err(Error::command_failed(command, stderr)),
            Some(Behavior::Missing) => Err(Error::CommandNotFound(program.to_string())),
            Some(Behavior::Block) => {
                cancel.cancelled().await;
                Err(Error::Canceled(command))
            }
            behavior => {
                if let Some(path) = artifact_path(program, args) {
                    if path.parent().map(Path::is_dir).unwrap_or(false) {
                        std::fs::write(&path, b"artifact")?;
                    }
                }
                let stdout = match behavior {
                    Some(Behavior::Respond(stdout)) => stdout.into_bytes(),
                    _ => Vec::new(),
                };
                Ok(CommandOutput {
                    stdout,
                    stderr: Vec::new(),
                })
            }
        }
    }
}

/// A running VM with one qcow2 disk at `disk_path` in the default pool.
pub fn vm_info(name: &str, disk_path: &str) -> VmInfo {
    VmInfo {
        name: name.to_string(),
        uuid: format!("uuid-{}", name),
        status: VmStatus::Running,
        cpu: CpuInfo {
            count: 2,
            ..CpuInfo::default()
        },
        memory: MemoryInfo {
            size_bytes: 2048 * 1024 * 1024,
        },
        disks: vec![DiskInfo {
            path: disk_path.to_string(),
            storage_pool: "default".to_string(),
            volume_name: Path::new(disk_path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            format: "qcow2".to_string(),
            ..DiskInfo::default()
        }],
        ..VmInfo::default()
    }
}

/// In-memory [`HypervisorDriver`].
#[derive(Debug, Default)]
pub struct FakeHypervisor {
    vms: Mutex<HashMap<String, VmInfo>>,
    snapshots: Mutex<HashMap<String, Vec<Snapshot>>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    created: Mutex<Vec<VmParams>>,
    stop_delay: Mutex<Option<Duration>>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, vm: VmInfo) {
        self.vms.lock().insert(vm.name.clone(), vm);
    }

    pub fn remove(&self, name: &str) {
        self.vms.lock().remove(name);
    }

    /// Let `stop` return only `delay` after the VM went down.
    pub fn delay_stop(&self, delay: Duration) {
        *self.stop_delay.lock() = Some(delay);
    }

    /// Make operation `op` (e.g. `"stop"`) fail from now on.
    pub fn fail(&self, op: &str) {
        self.failing.lock().insert(op.to_string());
    }

    /// Mutating operations as `op:vm`, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn created_params(&self) -> Vec<VmParams> {
        self.created.lock().clone()
    }

    pub fn status(&self, name: &str) -> Option<VmStatus> {
        self.vms.lock().get(name).map(|vm| vm.status)
    }

    fn record(&self, op: &str, vm: &str) -> Result<()> {
        self.calls.lock().push(format!("{}:{}", op, vm));
        if self.failing.lock().contains(op) {
            return Err(Error::hypervisor(format!("{} {}: injected failure", op, vm)));
        }
        Ok(())
    }

    fn set_status(&self, name: &str, status: VmStatus) -> Result<()> {
        let mut vms = self.vms.lock();
        let vm = vms
            .get_mut(name)
            .ok_or_else(|| Error::VmNotFound(name.to_string()))?;
        vm.status = status;
        Ok(())
    }

    fn snapshot(&self, vm: &str, snapshot: &str) -> Result<Snapshot> {
        self.snapshots
            .lock()
            .get(vm)
            .and_then(|list| list.iter().find(|s| s.name == snapshot).cloned())
            .ok_or_else(|| Error::hypervisor(format!("snapshot {} not found", snapshot)))
    }
}

#[async_trait]
impl HypervisorDriver for FakeHypervisor {
    async fn create(&self, params: &VmParams, _cloud_init_iso: Option<&Path>) -> Result<VmInfo> {
        self.record("create", &params.name)?;
        self.created.lock().push(params.clone());
        let vm = VmInfo {
            name: params.name.clone(),
            uuid: format!("uuid-{}", params.name),
            status: VmStatus::Running,
            cpu: CpuInfo {
                count: params.cpu.count,
                model: params.cpu.model.clone(),
                ..CpuInfo::default()
            },
            memory: MemoryInfo {
                size_bytes: params.memory.size_bytes,
            },
            ..VmInfo::default()
        };
        self.insert(vm.clone());
        Ok(vm)
    }

    async fn get(&self, name: &str) -> Result<VmInfo> {
        self.vms
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::VmNotFound(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<VmInfo>> {
        let mut vms: Vec<VmInfo> = self.vms.lock().values().cloned().collect();
        vms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vms)
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.record("start", name)?;
        self.set_status(name, VmStatus::Running)
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.record("stop", name)?;
        self.set_status(name, VmStatus::Stopped)?;
        let delay = *self.stop_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn force_stop(&self, name: &str) -> Result<()> {
        self.record("force_stop", name)?;
        self.set_status(name, VmStatus::Stopped)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.record("delete", name)?;
        self.snapshots.lock().remove(name);
        self.vms
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::VmNotFound(name.to_string()))
    }

    async fn create_snapshot(&self, vm: &str, params: &SnapshotParams) -> Result<Snapshot> {
        self.record("create_snapshot", vm)?;
        let state = self.get(vm).await?.status.to_string();
        let mut snapshots = self.snapshots.lock();
        let list = snapshots.entry(vm.to_string()).or_default();
        let parent = list.iter().find(|s| s.is_current).map(|s| s.name.clone());
        for s in list.iter_mut() {
            s.is_current = false;
        }
        let snapshot = Snapshot {
            name: params.name.clone(),
            description: params.description.clone(),
            state,
            parent,
            created_at: FixedClock::default().now(),
            is_current: true,
        };
        list.push(snapshot.clone());
        Ok(snapshot)
    }

    async fn list_snapshots(&self, vm: &str) -> Result<Vec<Snapshot>> {
        self.get(vm).await?;
        Ok(self.snapshots.lock().get(vm).cloned().unwrap_or_default())
    }

    async fn get_snapshot(&self, vm: &str, snapshot: &str) -> Result<Snapshot> {
        self.get(vm).await?;
        self.snapshot(vm, snapshot)
    }

    async fn delete_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        self.record("delete_snapshot", vm)?;
        self.snapshot(vm, snapshot)?;
        if let Some(list) = self.snapshots.lock().get_mut(vm) {
            list.retain(|s| s.name != snapshot);
        }
        Ok(())
    }

    async fn revert_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        self.record("revert_snapshot", vm)?;
        self.snapshot(vm, snapshot)?;
        if let Some(list) = self.snapshots.lock().get_mut(vm) {
            for s in list.iter_mut() {
                s.is_current = s.name == snapshot;
            }
        }
        Ok(())
    }
}

/// In-memory [`VolumeManager`]. Lookups of unknown volumes fail.
#[derive(Debug, Default)]
pub struct FakeVolumes {
    volumes: Mutex<HashMap<(String, String), PathBuf>>,
    calls: Mutex<Vec<String>>,
}

impl FakeVolumes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pool: &str, volume: &str, path: impl Into<PathBuf>) {
        self.volumes
            .lock()
            .insert((pool.to_string(), volume.to_string()), path.into());
    }

    pub fn contains(&self, pool: &str, volume: &str) -> bool {
        self.volumes
            .lock()
            .contains_key(&(pool.to_string(), volume.to_string()))
    }

    /// Operations as `op:pool/volume`, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, op: &str, pool: &str, volume: &str) {
        self.calls.lock().push(format!("{}:{}/{}", op, pool, volume));
    }

    fn allocate(&self, pool: &str, volume: &str) -> PathBuf {
        let path = PathBuf::from(format!("/fake/{}/{}", pool, volume));
        self.insert(pool, volume, path.clone());
        path
    }
}

#[async_trait]
impl VolumeManager for FakeVolumes {
    async fn get_path(&self, pool: &str, volume: &str) -> Result<PathBuf> {
        self.record("get_path", pool, volume);
        self.volumes
            .lock()
            .get(&(pool.to_string(), volume.to_string()))
            .cloned()
            .ok_or_else(|| Error::storage(format!("volume {} not found in pool {}", volume, pool)))
    }

    async fn create(
        &self,
        pool: &str,
        volume: &str,
        _capacity_bytes: u64,
        _format: DiskFormat,
    ) -> Result<PathBuf> {
        self.record("create", pool, volume);
        Ok(self.allocate(pool, volume))
    }

    async fn create_from_image(
        &self,
        pool: &str,
        volume: &str,
        _image: &Path,
        _format: DiskFormat,
    ) -> Result<PathBuf> {
        self.record("create_from_image", pool, volume);
        Ok(self.allocate(pool, volume))
    }

    async fn delete(&self, pool: &str, volume: &str) -> Result<()> {
        self.record("delete", pool, volume);
        self.volumes
            .lock()
            .remove(&(pool.to_string(), volume.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::storage(format!("volume {} not found in pool {}", volume, pool)))
    }
}
