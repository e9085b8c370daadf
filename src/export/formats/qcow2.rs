//! QCOW2 export.

use super::{qemu_convert_args, run_tool, FormatConverter, QEMU_IMG};
use crate::command::CommandRunner;
use crate::error::{Error, Result};
use crate::export::job::{option_enabled, ExportFormat, ExportOptions};
use crate::host::FileSystem;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Compression level used when none is given.
pub const DEFAULT_COMPRESSION: &str = "1";

/// Re-compresses a qcow2 image.
pub struct Qcow2Converter {
    runner: Arc<dyn CommandRunner>,
    fs: Arc<dyn FileSystem>,
}

impl Qcow2Converter {
    pub fn new(runner: Arc<dyn CommandRunner>, fs: Arc<dyn FileSystem>) -> Self {
        Self { runner, fs }
    }
}

#[async_trait]
impl FormatConverter for Qcow2Converter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Qcow2
    }

    fn validate_options(&self, options: &ExportOptions) -> Result<()> {
        if let Some(level) = options.get("compression") {
            match level.parse::<u8>() {
                Ok(0..=9) => {}
                _ => {
                    return Err(Error::invalid_options(
                        "compression",
                        format!("must be an integer between 0 and 9, got {:?}", level),
                    ))
                }
            }
        }
        Ok(())
    }

    async fn convert(
        &self,
        cancel: &CancellationToken,
        src: &Path,
        dest: &Path,
        options: &ExportOptions,
    ) -> Result<()> {
        let level = options
            .get("compression")
            .map(String::as_str)
            .unwrap_or(DEFAULT_COMPRESSION);
        tracing::debug!(compression = level, "qcow2 compression requested");

        let mut args = qemu_convert_args("qcow2", &["-c"], src, dest);
        let program = if option_enabled(options, "use_sudo") {
            args.insert(0, QEMU_IMG.to_string());
            "sudo"
        } else {
            QEMU_IMG
        };
        run_tool(
            self.runner.as_ref(),
            self.fs.as_ref(),
            cancel,
            self.format(),
            program,
            args,
            dest,
        )
        .await
    }
}
