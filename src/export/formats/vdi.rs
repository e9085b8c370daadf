//! VirtualBox VDI export.

use super::{qemu_convert_args, run_tool, FormatConverter, QEMU_IMG};
use crate::command::CommandRunner;
use crate::error::{Error, Result};
use crate::export::job::{option_enabled, ExportFormat, ExportOptions};
use crate::host::FileSystem;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const STATIC_VALUES: [&str; 4] = ["true", "false", "1", "0"];

/// Converts to VDI, dynamically allocated unless `static` is set.
pub struct VdiConverter {
    runner: Arc<dyn CommandRunner>,
    fs: Arc<dyn FileSystem>,
}

impl VdiConverter {
    pub fn new(runner: Arc<dyn CommandRunner>, fs: Arc<dyn FileSystem>) -> Self {
        Self { runner, fs }
    }
}

#[async_trait]
impl FormatConverter for VdiConverter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Vdi
    }

    fn validate_options(&self, options: &ExportOptions) -> Result<()> {
        match options.get("static") {
            Some(value) if !STATIC_VALUES.contains(&value.as_str()) => Err(Error::invalid_options(
                "static",
                format!("must be one of {}, got {:?}", STATIC_VALUES.join(", "), value),
            )),
            _ => Ok(()),
        }
    }

    async fn convert(
        &self,
        cancel: &CancellationToken,
        src: &Path,
        dest: &Path,
        options: &ExportOptions,
    ) -> Result<()> {
        let extra: &[&str] = if option_enabled(options, "static") {
            &["-o", "preallocation=metadata"]
        } else {
            &[]
        };
        run_tool(
            self.runner.as_ref(),
            self.fs.as_ref(),
            cancel,
            self.format(),
            QEMU_IMG,
            qemu_convert_args("vdi", extra, src, dest),
            dest,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::OsFileSystem;
    use crate::testing::RecordingRunner;

    fn with_static(value: &str) -> ExportOptions {
        let mut options = ExportOptions::new();
        options.insert("static".into(), value.into());
        options
    }

    #[test]
    fn test_static_values() {
        let converter = VdiConverter::new(Arc::new(RecordingRunner::new()), Arc::new(OsFileSystem));
        for value in STATIC_VALUES {
            assert!(converter.validate_options(&with_static(value)).is_ok());
        }
        let err = converter.validate_options(&with_static("yes")).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions { ref key, .. } if key == "static"));
    }

    #[tokio::test]
    async fn test_preallocation_only_when_static() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("d.vdi");
        let runner = Arc::new(RecordingRunner::new());
        let converter = VdiConverter::new(runner.clone(), Arc::new(OsFileSystem));
        let cancel = CancellationToken::new();
        let src = Path::new("/vol/d.qcow2");

        converter.convert(&cancel, src, &dest, &with_static("1")).await.unwrap();
        converter.convert(&cancel, src, &dest, &with_static("false")).await.unwrap();

        let calls = runner.calls();
        assert_eq!(
            calls[0].args.join(" "),
            format!("convert -f qcow2 -O vdi -o preallocation=metadata /vol/d.qcow2 {}", dest.display())
        );
        assert_eq!(
            calls[1].args.join(" "),
            format!("convert -f qcow2 -O vdi /vol/d.qcow2 {}", dest.display())
        );
    }
}
