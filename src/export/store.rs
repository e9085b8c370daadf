//! Export job custody.
//!
//! The store is the only writer of [`Job`] records. Every mutation happens
//! under one write lock, and records that reached a terminal state are frozen:
//! the first terminal write wins and later updates are ignored.

use crate::error::{Error, Result};
use crate::export::job::{ExportFormat, ExportOptions, Job, JobStatus};
use crate::host::{Clock, IdGenerator};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Storage for export jobs.
///
/// Kept narrow so a durable implementation can replace [`MemoryJobStore`]
/// without touching the export manager.
pub trait JobStore: Send + Sync {
    /// Insert a new pending job. `cancel` is fired when the job is canceled.
    fn create(
        &self,
        vm_name: &str,
        format: ExportFormat,
        options: &ExportOptions,
        cancel: CancellationToken,
    ) -> Job;

    /// Snapshot of one job.
    fn get(&self, id: &str) -> Option<Job>;

    /// Snapshot of every job, in no particular order.
    fn list(&self) -> Vec<Job>;

    /// Move a job to `status`.
    ///
    /// Progress never decreases while running, except that a failure may
    /// reset it to the failing phase's floor. Returns `false` iff `id` is
    /// unknown.
    fn update_status(&self, id: &str, status: JobStatus, progress: u8, error: Option<String>) -> bool;

    /// Record where the artifact is being written. Returns `false` iff `id`
    /// is unknown.
    fn set_output_path(&self, id: &str, path: PathBuf) -> bool;

    /// Mark a job completed with its final artifact path, atomically.
    fn complete(&self, id: &str, output_path: PathBuf) -> bool;

    /// Cancel a pending or running job and fire its token.
    fn cancel(&self, id: &str) -> Result<Job>;
}

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
}

/// In-memory [`JobStore`]. Jobs live as long as the process.
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, JobEntry>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl MemoryJobStore {
    /// Create an empty store.
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            clock,
            ids,
        }
    }

    /// Strictly after `start`, even if the clock did not advance.
    fn end_time(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        let now = self.clock.now();
        let earliest = start + chrono::Duration::nanoseconds(1);
        now.max(earliest)
    }
}

fn rank(status: JobStatus) -> u8 {
    match status {
        JobStatus::Pending => 0,
        JobStatus::Running => 1,
        JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled => 2,
    }
}

impl JobStore for MemoryJobStore {
    fn create(
        &self,
        vm_name: &str,
        format: ExportFormat,
        options: &ExportOptions,
        cancel: CancellationToken,
    ) -> Job {
        let job = Job {
            id: self.ids.next_id(),
            vm_name: vm_name.to_string(),
            format,
            options: options.clone(),
            status: JobStatus::Pending,
            progress: 0,
            start_time: self.clock.now(),
            end_time: None,
            error: String::new(),
            output_path: None,
        };
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.id) {
            // An id collision would silently replace another job's record.
            tracing::error!(job_id = %job.id, "duplicate job id generated");
        }
        jobs.insert(
            job.id.clone(),
            JobEntry {
                job: job.clone(),
                cancel,
            },
        );
        job
    }

    fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().get(id).map(|e| e.job.clone())
    }

    fn list(&self) -> Vec<Job> {
        self.jobs.read().values().map(|e| e.job.clone()).collect()
    }

    fn update_status(&self, id: &str, status: JobStatus, progress: u8, error: Option<String>) -> bool {
        let mut jobs = self.jobs.write();
        let Some(entry) = jobs.get_mut(id) else {
            return false;
        };
        let job = &mut entry.job;
        if job.status.is_terminal() || rank(status) < rank(job.status) {
            tracing::debug!(job_id = id, from = %job.status, to = %status, "ignoring status update");
            return true;
        }

        let progress = progress.min(100);
        job.progress = match status {
            JobStatus::Running if job.status == JobStatus::Running => job.progress.max(progress),
            JobStatus::Completed => 100,
            _ => progress,
        };
        if let Some(error) = error {
            job.error = error;
        }
        if status == JobStatus::Failed && job.error.is_empty() {
            job.error = "export failed".to_string();
        }
        job.status = status;
        if status.is_terminal() {
            job.end_time = Some(self.end_time(job.start_time));
        }
        true
    }

    fn set_output_path(&self, id: &str, path: PathBuf) -> bool {
        let mut jobs = self.jobs.write();
        let Some(entry) = jobs.get_mut(id) else {
            return false;
        };
        if !entry.job.status.is_terminal() {
            entry.job.output_path = Some(path);
        }
        true
    }

    fn complete(&self, id: &str, output_path: PathBuf) -> bool {
        let mut jobs = self.jobs.write();
        let Some(entry) = jobs.get_mut(id) else {
            return false;
        };
        let job = &mut entry.job;
        if job.status.is_terminal() {
            return true;
        }
        job.status = JobStatus::Completed;
        job.progress = 100;
        job.error.clear();
        job.output_path = Some(output_path);
        job.end_time = Some(self.end_time(job.start_time));
        true
    }

    fn cancel(&self, id: &str) -> Result<Job> {
        let mut jobs = self.jobs.write();
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| Error::JobNotFound(id.to_string()))?;
        if entry.job.status.is_terminal() {
            return Err(Error::IllegalTransition(format!(
                "cannot cancel job in {} state",
                entry.job.status
            )));
        }
        entry.job.status = JobStatus::Canceled;
        entry.job.end_time = Some(self.end_time(entry.job.start_time));
        entry.cancel.cancel();
        Ok(entry.job.clone())
    }
}
