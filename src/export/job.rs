//! Export job model.

use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Format-specific export options. Keys are case-sensitive.
pub type ExportOptions = BTreeMap<String, String>;

/// Lifecycle state of an export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, not yet picked up.
    Pending,
    /// Pipeline in progress.
    Running,
    /// Artifact written.
    Completed,
    /// Pipeline failed; see the job error.
    Failed,
    /// Canceled by a caller.
    Canceled,
}

impl JobStatus {
    /// Completed, failed or canceled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Get the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target format of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// QEMU copy-on-write v2.
    Qcow2,
    /// VMware virtual disk.
    Vmdk,
    /// VirtualBox disk image.
    Vdi,
    /// Open Virtual Appliance (OVF + VMDK in a tar).
    Ova,
    /// Raw disk image.
    Raw,
}

impl ExportFormat {
    /// Every supported format.
    pub const ALL: [ExportFormat; 5] = [
        ExportFormat::Qcow2,
        ExportFormat::Vmdk,
        ExportFormat::Vdi,
        ExportFormat::Ova,
        ExportFormat::Raw,
    ];

    /// Lowercase format name, also used as the file extension.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Qcow2 => "qcow2",
            ExportFormat::Vmdk => "vmdk",
            ExportFormat::Vdi => "vdi",
            ExportFormat::Ova => "ova",
            ExportFormat::Raw => "raw",
        }
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExportFormat::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| Error::UnsupportedFormat(s.to_string()))
    }
}

/// Request to export a VM's disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    /// Target format name. Parsed late so unknown names surface as
    /// [`Error::UnsupportedFormat`].
    pub format: String,
    /// Format-specific options.
    #[serde(default)]
    pub options: ExportOptions,
    /// Artifact file name inside the export directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl ExportRequest {
    /// Request for `format` with no options.
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            ..Self::default()
        }
    }

    /// Add an option.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Set the artifact file name.
    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }
}

/// One export attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique, URL-safe id.
    pub id: String,
    /// VM being exported.
    pub vm_name: String,
    /// Target format.
    pub format: ExportFormat,
    /// Options as submitted (the pipeline enriches its own copy).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: ExportOptions,
    /// Lifecycle state.
    pub status: JobStatus,
    /// 0..=100.
    pub progress: u8,
    /// Creation time.
    pub start_time: DateTime<Utc>,
    /// Set once, when the job reaches a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Failure reason; non-empty iff failed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Artifact path. Final once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

/// Whether an option is set to `"true"` or `"1"`.
pub fn option_enabled(options: &ExportOptions, key: &str) -> bool {
    matches!(options.get(key).map(String::as_str), Some("true") | Some("1"))
}
