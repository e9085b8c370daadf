//! JSON request and response types for the API.
//!
//! VM, snapshot and job bodies reuse the domain types directly; this module
//! only holds the envelopes around them.

use serde::{Deserialize, Serialize};

use crate::export::Job;
use crate::vm::{Snapshot, VmInfo};

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"`.
    pub status: String,
    /// Service version.
    pub version: String,
}

/// List VMs response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListVmsResponse {
    pub vms: Vec<VmInfo>,
}

/// List snapshots response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListSnapshotsResponse {
    pub snapshots: Vec<Snapshot>,
}

/// List export jobs response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<Job>,
}

/// Query parameters for stopping a VM.
#[derive(Debug, Default, Deserialize)]
pub struct StopQuery {
    /// Power off immediately instead of a guest shutdown.
    #[serde(default)]
    pub force: bool,
}
