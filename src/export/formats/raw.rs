//! Raw export.

use super::{qemu_convert_args, run_tool, FormatConverter, QEMU_IMG};
use crate::command::CommandRunner;
use crate::error::Result;
use crate::export::job::{ExportFormat, ExportOptions};
use crate::host::FileSystem;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Flattens the image into a raw disk. Takes no options.
pub struct RawConverter {
    runner: Arc<dyn CommandRunner>,
    fs: Arc<dyn FileSystem>,
}

impl RawConverter {
    pub fn new(runner: Arc<dyn CommandRunner>, fs: Arc<dyn FileSystem>) -> Self {
        Self { runner, fs }
    }
}

#[async_trait]
impl FormatConverter for RawConverter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Raw
    }

    fn validate_options(&self, _options: &ExportOptions) -> Result<()> {
        Ok(())
    }

    async fn convert(
        &self,
        cancel: &CancellationToken,
        src: &Path,
        dest: &Path,
        _options: &ExportOptions,
    ) -> Result<()> {
        run_tool(
            self.runner.as_ref(),
            self.fs.as_ref(),
            cancel,
            self.format(),
            QEMU_IMG,
            qemu_convert_args("raw", &[], src, dest),
            dest,
        )
        .await
    }
}
