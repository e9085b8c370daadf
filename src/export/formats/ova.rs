//! OVA export: a streamOptimized VMDK plus an OVF descriptor, archived with
//! tar. The descriptor is the first archive member so streaming importers can
//! read it before the disk.

use super::ovf::OvfGenerator;
use super::{qemu_convert_args, run_tool, FormatConverter, QEMU_IMG};
use crate::command::CommandRunner;
use crate::error::{Error, Result};
use crate::export::job::{ExportFormat, ExportOptions};
use crate::host::FileSystem;
use crate::vm::info::{CpuInfo, MemoryInfo, VmInfo};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DISK_FILE: &str = "disk.vmdk";
const OVF_FILE: &str = "vm.ovf";
const TEMP_PREFIX: &str = "ova-export-";

const DEFAULT_CPU_COUNT: u32 = 1;
const DEFAULT_MEMORY_MB: u64 = 1024;

/// Builds an OVA appliance.
pub struct OvaConverter {
    runner: Arc<dyn CommandRunner>,
    fs: Arc<dyn FileSystem>,
    ovf: OvfGenerator,
}

impl OvaConverter {
    pub fn new(runner: Arc<dyn CommandRunner>, fs: Arc<dyn FileSystem>, ovf: OvfGenerator) -> Self {
        Self { runner, fs, ovf }
    }
}

/// VM description for the descriptor, taken from the export options.
fn vm_from_options(options: &ExportOptions) -> VmInfo {
    let cpu_count = options
        .get("cpu_count")
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|c| *c > 0)
        .unwrap_or(DEFAULT_CPU_COUNT);
    let memory_mb = options
        .get("memory_mb")
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|m| *m > 0)
        .unwrap_or(DEFAULT_MEMORY_MB);
    VmInfo {
        name: options.get("vm_name").cloned().unwrap_or_default(),
        uuid: options.get("vm_uuid").cloned().unwrap_or_default(),
        cpu: CpuInfo {
            count: cpu_count,
            ..CpuInfo::default()
        },
        memory: MemoryInfo {
            size_bytes: memory_mb * 1024 * 1024,
        },
        ..VmInfo::default()
    }
}

#[async_trait]
impl FormatConverter for OvaConverter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Ova
    }

    fn validate_options(&self, options: &ExportOptions) -> Result<()> {
        match options.get("vm_name") {
            Some(name) if !name.trim().is_empty() => Ok(()),
            _ => Err(Error::invalid_options("vm_name", "required for OVA export")),
        }
    }

    async fn convert(
        &self,
        cancel: &CancellationToken,
        src: &Path,
        dest: &Path,
        options: &ExportOptions,
    ) -> Result<()> {
        let format = self.format();
        let staging = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempdir_in(self.fs.temp_dir())
            .map_err(|e| Error::conversion_failed(format.as_str(), format!("creating temp dir: {}", e)))?;
        let disk_path = staging.path().join(DISK_FILE);
        let ovf_path = staging.path().join(OVF_FILE);

        run_tool(
            self.runner.as_ref(),
            self.fs.as_ref(),
            cancel,
            format,
            QEMU_IMG,
            qemu_convert_args(
                "vmdk",
                &["-o", "adapter_type=lsilogic,subformat=streamOptimized"],
                src,
                &disk_path,
            ),
            &disk_path,
        )
        .await?;

        let disk_size = self
            .fs
            .file_size(&disk_path)
            .map_err(|e| Error::conversion_failed(format.as_str(), format!("reading disk size: {}", e)))?;
        let vm = vm_from_options(options);
        self.ovf
            .generate(&vm, &disk_path, disk_size)
            .and_then(|xml| self.ovf.write_to_file(&xml, &ovf_path))
            .map_err(|e| Error::conversion_failed(format.as_str(), format!("writing OVF descriptor: {}", e)))?;

        let args = vec![
            "-cf".to_string(),
            dest.display().to_string(),
            "-C".to_string(),
            staging.path().display().to_string(),
            OVF_FILE.to_string(),
            DISK_FILE.to_string(),
        ];
        run_tool(self.runner.as_ref(), self.fs.as_ref(), cancel, format, "tar", args, dest).await?;

        tracing::debug!(vm_name = %vm.name, disk_size, path = %dest.display(), "ova archive written");
        Ok(())
    }
}
