//! VMware VMDK export.

use super::{qemu_convert_args, run_tool, FormatConverter, QEMU_IMG};
use crate::command::CommandRunner;
use crate::error::{Error, Result};
use crate::export::job::{ExportFormat, ExportOptions};
use crate::host::FileSystem;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Accepted `adapter_type` values.
pub const ADAPTER_TYPES: [&str; 4] = ["ide", "buslogic", "lsilogic", "legacyESX"];

/// Accepted `disk_type` values.
pub const DISK_TYPES: [&str; 4] = [
    "monolithicSparse",
    "monolithicFlat",
    "twoGbMaxExtent",
    "streamOptimized",
];

pub const DEFAULT_ADAPTER_TYPE: &str = "lsilogic";
pub const DEFAULT_DISK_TYPE: &str = "monolithicSparse";

/// Converts to VMDK with a configurable adapter and subformat.
pub struct VmdkConverter {
    runner: Arc<dyn CommandRunner>,
    fs: Arc<dyn FileSystem>,
}

impl VmdkConverter {
    pub fn new(runner: Arc<dyn CommandRunner>, fs: Arc<dyn FileSystem>) -> Self {
        Self { runner, fs }
    }
}

fn check_one_of(options: &ExportOptions, key: &str, allowed: &[&str]) -> Result<()> {
    match options.get(key) {
        Some(value) if !allowed.contains(&value.as_str()) => Err(Error::invalid_options(
            key,
            format!("must be one of {}, got {:?}", allowed.join(", "), value),
        )),
        _ => Ok(()),
    }
}

#[async_trait]
impl FormatConverter for VmdkConverter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Vmdk
    }

    fn validate_options(&self, options: &ExportOptions) -> Result<()> {
        check_one_of(options, "adapter_type", &ADAPTER_TYPES)?;
        check_one_of(options, "disk_type", &DISK_TYPES)
    }

    async fn convert(
        &self,
        cancel: &CancellationToken,
        src: &Path,
        dest: &Path,
        options: &ExportOptions,
    ) -> Result<()> {
        let adapter = options
            .get("adapter_type")
            .map(String::as_str)
            .unwrap_or(DEFAULT_ADAPTER_TYPE);
        let subformat = options
            .get("disk_type")
            .map(String::as_str)
            .unwrap_or(DEFAULT_DISK_TYPE);
        let spec = format!("adapter_type={},subformat={}", adapter, subformat);
        run_tool(
            self.runner.as_ref(),
            self.fs.as_ref(),
            cancel,
            self.format(),
            QEMU_IMG,
            qemu_convert_args("vmdk", &["-o", spec.as_str()], src, dest),
            dest,
        )
        .await
    }
}
