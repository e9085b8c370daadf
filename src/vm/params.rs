//! VM creation parameters.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Smallest accepted memory allocation.
pub const MIN_MEMORY_BYTES: u64 = 64 * 1024 * 1024;

/// Smallest accepted disk.
pub const MIN_DISK_BYTES: u64 = 1024 * 1024 * 1024;

/// Disk image formats a VM can be created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    /// QEMU copy-on-write image.
    #[default]
    Qcow2,
    /// Raw image.
    Raw,
}

impl DiskFormat {
    /// Format name as libvirt spells it.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
        }
    }
}

impl std::fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuParams {
    /// Number of vCPUs.
    #[serde(default)]
    pub count: u32,
    /// CPU mode/model.
    #[serde(default)]
    pub model: String,
}

/// Memory request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryParams {
    /// Memory in bytes.
    #[serde(default)]
    pub size_bytes: u64,
}

/// Disk request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskParams {
    /// Disk size in bytes (ignored when cloning a source image).
    #[serde(default)]
    pub size_bytes: u64,
    /// Image format.
    #[serde(default)]
    pub format: Option<DiskFormat>,
    /// Image to seed the disk from.
    #[serde(default)]
    pub source_image: Option<String>,
    /// Storage pool to allocate in.
    #[serde(default)]
    pub storage_pool: Option<String>,
}

/// Network request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetParams {
    /// `network` or `bridge`.
    #[serde(default)]
    pub kind: Option<String>,
    /// Network or bridge name.
    #[serde(default)]
    pub source: Option<String>,
    /// NIC model.
    #[serde(default)]
    pub model: Option<String>,
}

/// Cloud-init documents. Empty documents are generated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInitParams {
    /// `user-data` document.
    #[serde(default)]
    pub user_data: String,
    /// `meta-data` document.
    #[serde(default)]
    pub meta_data: String,
    /// `network-config` document.
    #[serde(default)]
    pub network_config: String,
    /// Public keys injected into the default user.
    #[serde(default)]
    pub ssh_keys: Vec<String>,
}

/// Everything needed to create a VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmParams {
    /// Unique VM name.
    #[serde(default)]
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// CPU request.
    #[serde(default)]
    pub cpu: CpuParams,
    /// Memory request.
    #[serde(default)]
    pub memory: MemoryParams,
    /// Disk request.
    #[serde(default)]
    pub disk: DiskParams,
    /// Network request.
    #[serde(default)]
    pub network: NetParams,
    /// Cloud-init documents.
    #[serde(default)]
    pub cloud_init: CloudInitParams,
    /// Template to fill unset fields from.
    #[serde(default)]
    pub template: Option<String>,
}

impl VmParams {
    /// Check the request against the hypervisor's hard limits.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if self.cpu.count < 1 {
            return Err(Error::InvalidParams("cpu count must be at least 1".into()));
        }
        if self.memory.size_bytes < MIN_MEMORY_BYTES {
            return Err(Error::InvalidParams("memory size must be at least 64 MB".into()));
        }
        if self.disk.source_image.is_none() && self.disk.size_bytes < MIN_DISK_BYTES {
            return Err(Error::InvalidParams("disk size must be at least 1 GB".into()));
        }
        if let Some(image) = &self.disk.source_image {
            let ext = std::path::Path::new(image)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("");
            if !matches!(ext, "qcow2" | "img" | "raw") {
                return Err(Error::InvalidParams(format!(
                    "invalid source image format: {}",
                    image
                )));
            }
        }
        if let Some(kind) = &self.network.kind {
            if kind != "network" && kind != "bridge" {
                return Err(Error::InvalidParams(format!("invalid network type: {}", kind)));
            }
            if self.network.source.as_deref().unwrap_or("").is_empty() {
                return Err(Error::InvalidParams("network source is required".into()));
            }
        }
        Ok(())
    }

    /// Fill unset fields with service defaults.
    pub fn with_defaults(mut self, storage_pool: &str, network: &str) -> Self {
        if self.cpu.model.is_empty() {
            self.cpu.model = "host-model".to_string();
        }
        if self.disk.format.is_none() {
            self.disk.format = Some(DiskFormat::Qcow2);
        }
        if self.disk.storage_pool.as_deref().unwrap_or("").is_empty() {
            self.disk.storage_pool = Some(storage_pool.to_string());
        }
        if self.network.kind.is_none() {
            self.network.kind = Some("network".to_string());
            self.network.source = Some(network.to_string());
        }
        if self.network.model.is_none() {
            self.network.model = Some("virtio".to_string());
        }
        self
    }

    /// Disk format after defaults.
    pub fn disk_format(&self) -> DiskFormat {
        self.disk.format.unwrap_or_default()
    }

    /// Storage pool after defaults.
    pub fn storage_pool(&self) -> &str {
        self.disk.storage_pool.as_deref().unwrap_or("default")
    }
}

/// Conventional volume name of a VM's n-th disk.
pub fn volume_name(vm_name: &str, index: usize) -> String {
    format!("{}-disk-{}", vm_name, index)
}

/// Hostname-style names: lowercase alphanumerics and `-`, not leading or
/// trailing `-`, at most 63 characters.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidParams("vm name is required".into()));
    }
    let valid = name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return Err(Error::InvalidParams(format!("invalid vm name: {}", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> VmParams {
        VmParams {
            name: "web-1".into(),
            cpu: CpuParams {
                count: 2,
                model: String::new(),
            },
            memory: MemoryParams {
                size_bytes: 2 * 1024 * 1024 * 1024,
            },
            disk: DiskParams {
                size_bytes: 10 * MIN_DISK_BYTES,
                ..DiskParams::default()
            },
            ..VmParams::default()
        }
    }

    #[test]
    fn test_valid_params() {
        params().validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_names() {
        for name in ["", "Web", "-web", "web-", "web_1"] {
            let mut p = params();
            p.name = name.into();
            assert!(p.validate().is_err(), "{name:?} should be rejected");
        }
    }

    #[test]
    fn test_limits() {
        let mut p = params();
        p.cpu.count = 0;
        assert!(p.validate().unwrap_err().to_string().contains("cpu"));

        let mut p = params();
        p.memory.size_bytes = MIN_MEMORY_BYTES - 1;
        assert!(p.validate().unwrap_err().to_string().contains("memory"));

        let mut p = params();
        p.disk.size_bytes = 1024;
        assert!(p.validate().unwrap_err().to_string().contains("disk"));
    }

    #[test]
    fn test_source_image_extension() {
        let mut p = params();
        p.disk.source_image = Some("/images/base.iso".into());
        assert!(p.validate().is_err());
        p.disk.source_image = Some("/images/base.qcow2".into());
        p.disk.size_bytes = 0;
        p.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let p = params().with_defaults("vms", "lan");
        assert_eq!(p.cpu.model, "host-model");
        assert_eq!(p.disk_format(), DiskFormat::Qcow2);
        assert_eq!(p.storage_pool(), "vms");
        assert_eq!(p.network.source.as_deref(), Some("lan"));
        assert_eq!(p.network.model.as_deref(), Some("virtio"));
    }

    #[test]
    fn test_volume_name() {
        assert_eq!(volume_name("alpha", 0), "alpha-disk-0");
    }
}
