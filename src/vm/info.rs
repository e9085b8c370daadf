//! Read-only VM views returned by the hypervisor driver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// VM power state as reported by libvirt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    /// Guest is running.
    Running,
    /// Guest is shut off.
    Stopped,
    /// Guest is paused.
    Paused,
    /// Guest is shutting down.
    Shutdown,
    /// Guest crashed.
    Crashed,
    /// State could not be determined.
    #[default]
    Unknown,
}

impl VmStatus {
    /// Parse the output of `virsh domstate`.
    pub fn from_domstate(state: &str) -> Self {
        match state.trim() {
            "running" | "idle" | "blocked" => VmStatus::Running,
            "shut off" | "shutoff" => VmStatus::Stopped,
            "paused" | "pmsuspended" => VmStatus::Paused,
            "in shutdown" | "shutdown" => VmStatus::Shutdown,
            "crashed" => VmStatus::Crashed,
            _ => VmStatus::Unknown,
        }
    }

    /// Running or paused guests still hold their disks open.
    pub fn is_active(&self) -> bool {
        matches!(self, VmStatus::Running | VmStatus::Paused)
    }

    /// Get the state name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            VmStatus::Running => "running",
            VmStatus::Stopped => "stopped",
            VmStatus::Paused => "paused",
            VmStatus::Shutdown => "shutdown",
            VmStatus::Crashed => "crashed",
            VmStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// CPU allocation and topology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfo {
    /// Number of vCPUs.
    pub count: u32,
    /// CPU model or mode (e.g. `host-model`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    /// Sockets, if a topology is defined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sockets: Option<u32>,
    /// Cores per socket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    /// Threads per core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
}

/// Memory allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    /// Memory in bytes.
    pub size_bytes: u64,
}

impl MemoryInfo {
    /// Memory in MiB, truncated.
    pub fn size_mb(&self) -> u64 {
        self.size_bytes / (1024 * 1024)
    }
}

/// One disk attached to a VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    /// Host path of the backing file.
    pub path: String,
    /// Storage pool the volume lives in, if known.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_pool: String,
    /// Volume name inside the pool, if known.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub volume_name: String,
    /// Image format (`qcow2`, `raw`).
    #[serde(default)]
    pub format: String,
    /// Virtual size in bytes (0 when unknown).
    #[serde(default)]
    pub size_bytes: u64,
    /// Bus (`virtio`, `sata`, ...).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bus: String,
    /// Guest device name (`vda`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device: String,
}

/// One network interface attached to a VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInfo {
    /// Interface type (`network`, `bridge`).
    pub kind: String,
    /// Network or bridge name.
    pub source: String,
    /// MAC address.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    /// NIC model (`virtio`, `e1000`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
}

/// Snapshot of a VM's configuration and state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    /// Unique VM name.
    pub name: String,
    /// Libvirt UUID.
    pub uuid: String,
    /// Power state.
    pub status: VmStatus,
    /// CPU configuration.
    pub cpu: CpuInfo,
    /// Memory configuration.
    pub memory: MemoryInfo,
    /// Disks, in definition order.
    pub disks: Vec<DiskInfo>,
    /// Network interfaces, in definition order.
    pub networks: Vec<NetInfo>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// A VM snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Domain state captured by the snapshot.
    pub state: String,
    /// Parent snapshot, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Whether this is the current snapshot.
    pub is_current: bool,
}

/// Parameters for creating a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotParams {
    /// Snapshot name (required).
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: String,
    /// Capture guest memory as well as disks.
    #[serde(default)]
    pub include_memory: bool,
}
