//! API server state.

use crate::export::ExportManager;
use crate::vm::VmOrchestrator;

/// Shared API server state.
#[derive(Clone)]
pub struct ApiState {
    /// VM provisioning and lifecycle.
    pub vms: VmOrchestrator,
    /// Export jobs.
    pub exports: ExportManager,
}

impl ApiState {
    /// Bundle the services behind the API.
    pub fn new(vms: VmOrchestrator, exports: ExportManager) -> Self {
        Self { vms, exports }
    }
}
