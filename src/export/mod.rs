//! Disk export pipeline.
//!
//! An export copies a VM's primary disk into one of the supported formats
//! (`qcow2`, `raw`, `vdi`, `vmdk`, `ova`) under the export directory. Jobs
//! run in the background and are observed through the [`ExportManager`].

pub mod formats;
pub mod job;
pub mod manager;
pub mod store;

pub use formats::{ConverterRegistry, FormatConverter, OvfGenerator};
pub use job::{ExportFormat, ExportOptions, ExportRequest, Job, JobStatus};
pub use manager::ExportManager;
pub use store::{JobStore, MemoryJobStore};
