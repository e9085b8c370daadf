//! Disk format converters.
//!
//! Each target format is a [`FormatConverter`]. The [`ConverterRegistry`] is
//! built once, at manager construction, and indexed by [`ExportFormat`].

pub mod ova;
pub mod ovf;
pub mod qcow2;
pub mod raw;
pub mod vdi;
pub mod vmdk;

pub use ova::OvaConverter;
pub use ovf::{OvfGenerator, OvfTemplateData};
pub use qcow2::Qcow2Converter;
pub use raw::RawConverter;
pub use vdi::VdiConverter;
pub use vmdk::VmdkConverter;

use crate::command::{display_command, CommandOptions, CommandRunner};
use crate::error::{Error, Result};
use crate::export::job::{ExportFormat, ExportOptions};
use crate::host::{Clock, FileSystem, IdGenerator};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Name of the disk conversion tool.
pub const QEMU_IMG: &str = "qemu-img";

/// Converts a qcow2 source disk into one export format.
#[async_trait]
pub trait FormatConverter: Send + Sync {
    /// Format produced by this converter.
    fn format(&self) -> ExportFormat;

    /// Stable name used in API surfaces and error messages.
    fn format_name(&self) -> &'static str {
        self.format().as_str()
    }

    /// Check the options this converter recognizes. Unknown keys are ignored.
    fn validate_options(&self, options: &ExportOptions) -> Result<()>;

    /// Write `dest` from `src`.
    ///
    /// On failure no partial artifact is left at `dest`.
    async fn convert(
        &self,
        cancel: &CancellationToken,
        src: &Path,
        dest: &Path,
        options: &ExportOptions,
    ) -> Result<()>;
}

/// Static set of converters, one per [`ExportFormat`].
#[derive(Clone)]
pub struct ConverterRegistry {
    converters: HashMap<ExportFormat, Arc<dyn FormatConverter>>,
}

impl ConverterRegistry {
    /// Registry with every supported format.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let ovf = OvfGenerator::new(clock, ids, fs.clone());
        let converters: [Arc<dyn FormatConverter>; 5] = [
            Arc::new(Qcow2Converter::new(runner.clone(), fs.clone())),
            Arc::new(RawConverter::new(runner.clone(), fs.clone())),
            Arc::new(VdiConverter::new(runner.clone(), fs.clone())),
            Arc::new(VmdkConverter::new(runner.clone(), fs.clone())),
            Arc::new(OvaConverter::new(runner, fs, ovf)),
        ];
        Self {
            converters: converters.into_iter().map(|c| (c.format(), c)).collect(),
        }
    }

    /// Converter for `format`.
    pub fn get(&self, format: ExportFormat) -> Result<Arc<dyn FormatConverter>> {
        self.converters
            .get(&format)
            .cloned()
            .ok_or_else(|| Error::UnsupportedFormat(format.to_string()))
    }

    /// Registered formats, sorted.
    pub fn formats(&self) -> Vec<ExportFormat> {
        let mut formats: Vec<_> = self.converters.keys().copied().collect();
        formats.sort();
        formats
    }
}

/// Run one conversion tool invocation for `format`, writing `dest`.
///
/// Creates the parent of `dest` first and removes `dest` if the tool fails.
/// Cancellation is passed through untouched; any other failure becomes
/// [`Error::ConversionFailed`] carrying the tool output.
pub(crate) async fn run_tool(
    runner: &dyn CommandRunner,
    fs: &dyn FileSystem,
    cancel: &CancellationToken,
    format: ExportFormat,
    program: &str,
    args: Vec<String>,
    dest: &Path,
) -> Result<()> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs.create_dir_all(parent)
            .map_err(|e| Error::conversion_failed(format.as_str(), format!("creating {}: {}", parent.display(), e)))?;
    }

    tracing::debug!(format = %format, command = %display_command(program, &args), "running conversion");
    let options = CommandOptions {
        combined_output: true,
        ..CommandOptions::untimed()
    };
    match runner.run(cancel, program, &args, &options).await {
        Ok(_) => Ok(()),
        Err(e) => {
            if let Err(rm) = fs.remove_file(dest) {
                tracing::warn!(path = %dest.display(), error = %rm, "failed to remove partial artifact");
            }
            if e.is_canceled() {
                Err(e)
            } else {
                Err(Error::conversion_failed(format.as_str(), e.to_string()))
            }
        }
    }
}

/// `qemu-img convert` arguments from a qcow2 source.
pub(crate) fn qemu_convert_args(target: &str, extra: &[&str], src: &Path, dest: &Path) -> Vec<String> {
    let mut args: Vec<String> = ["convert", "-f", "qcow2", "-O", target]
        .into_iter()
        .map(String::from)
        .collect();
    args.extend(extra.iter().map(|s| s.to_string()));
    args.push(src.display().to_string());
    args.push(dest.display().to_string());
    args
}
