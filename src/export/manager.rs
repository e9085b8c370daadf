//! Export manager.
//!
//! Accepts export requests, records them in the [`JobStore`] and runs each
//! one as a tracked background task. A job moves through fixed phases, each
//! with its own progress value:
//!
//! | phase                 | progress | failure floor |
//! |-----------------------|----------|---------------|
//! | running, scratch dir  | 5        | 0             |
//! | vm lookup             | 10       | 0             |
//! | source disk           | 20       | 10            |
//! | option enrichment     | 30       | 30            |
//! | conversion            | 40       | 50            |
//! | completed             | 100      |               |

use crate::error::{Error, Result};
use crate::export::formats::ConverterRegistry;
use crate::export::job::{option_enabled, ExportFormat, ExportOptions, ExportRequest, Job, JobStatus};
use crate::export::store::JobStore;
use crate::host::{Clock, FileSystem};
use crate::vm::info::{VmInfo, VmStatus};
use crate::vm::params::volume_name;
use crate::vm::{HypervisorDriver, VolumeManager, DEFAULT_POOL};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

/// Runs disk exports in the background.
#[derive(Clone)]
pub struct ExportManager {
    store: Arc<dyn JobStore>,
    converters: Arc<ConverterRegistry>,
    driver: Arc<dyn HypervisorDriver>,
    volumes: Arc<dyn VolumeManager>,
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    base_dir: PathBuf,
    root: CancellationToken,
    tasks: TaskTracker,
}

/// A pipeline error together with the progress the job is left at.
struct Failure {
    progress: u8,
    error: Error,
}

fn at(progress: u8) -> impl FnOnce(Error) -> Failure {
    move |error| Failure { progress, error }
}

/// Per-job scratch directory, removed when dropped.
struct ScratchDir {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl ScratchDir {
    fn create(fs: Arc<dyn FileSystem>, path: PathBuf) -> Result<Self> {
        fs.create_dir_all(&path)?;
        Ok(Self { fs, path })
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = self.fs.remove_dir_all(&self.path) {
            tracing::warn!(dir = %self.path.display(), error = %e, "failed to remove export scratch directory");
        }
    }
}

impl ExportManager {
    /// Create a manager writing artifacts under `base_dir`, which is created
    /// if missing.
    pub fn new(
        store: Arc<dyn JobStore>,
        converters: ConverterRegistry,
        driver: Arc<dyn HypervisorDriver>,
        volumes: Arc<dyn VolumeManager>,
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
        base_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let base_dir = base_dir.into();
        fs.create_dir_all(&base_dir).map_err(|e| {
            Error::Config(format!("creating export directory {}: {}", base_dir.display(), e))
        })?;
        Ok(Self {
            store,
            converters: Arc::new(converters),
            driver,
            volumes,
            fs,
            clock,
            base_dir,
            root: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Directory final artifacts are written to.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Validate `request` and schedule an export of `vm_name`.
    ///
    /// Returns the pending job immediately. Nothing is recorded when the
    /// request is rejected.
    pub async fn create_export_job(&self, vm_name: &str, request: ExportRequest) -> Result<Job> {
        if self.root.is_cancelled() {
            return Err(Error::internal("export manager is shutting down"));
        }
        self.driver.get(vm_name).await.map_err(|e| match e {
            Error::VmNotFound(_) => e,
            other => {
                tracing::debug!(vm_name, error = %other, "vm lookup failed");
                Error::VmNotFound(vm_name.to_string())
            }
        })?;

        let format: ExportFormat = request.format.parse()?;
        let converter = self.converters.get(format)?;
        converter.validate_options(&request.options)?;

        let file_name = match request.file_name.as_deref() {
            Some(name) => {
                check_file_name(name)?;
                name.to_string()
            }
            None => format!(
                "{}-{}.{}",
                vm_name,
                self.clock.now().format("%Y%m%d-%H%M%S"),
                format
            ),
        };

        let cancel = self.root.child_token();
        let job = self
            .store
            .create(vm_name, format, &request.options, cancel.clone());
        tracing::info!(job_id = %job.id, vm_name, format = %format, file_name = %file_name, "export job created");

        let span = tracing::info_span!("export", job_id = %job.id, vm_name = %job.vm_name, format = %format);
        let this = self.clone();
        let pending = job.clone();
        self.tasks.spawn(
            async move {
                this.process(pending, file_name, cancel).await;
            }
            .instrument(span),
        );
        Ok(job)
    }

    /// Look up one job.
    pub fn get_job(&self, id: &str) -> Result<Job> {
        self.store
            .get(id)
            .ok_or_else(|| Error::JobNotFound(id.to_string()))
    }

    /// Every known job, in no particular order.
    pub fn list_jobs(&self) -> Vec<Job> {
        self.store.list()
    }

    /// Cancel a pending or running job and remove any partial artifact.
    pub fn cancel_job(&self, id: &str) -> Result<Job> {
        let job = self.store.cancel(id)?;
        tracing::info!(job_id = id, progress = job.progress, "export job canceled");
        if let Some(path) = job.output_path.as_deref() {
            if self.fs.exists(path) {
                if let Err(e) = self.fs.remove_file(path) {
                    tracing::warn!(job_id = id, path = %path.display(), error = %e, "failed to remove partial export");
                }
            }
        }
        Ok(job)
    }

    /// Wait for every in-flight job to finish.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Cancel every in-flight job and wait for the tasks to exit.
    pub async fn shutdown(&self) {
        tracing::info!(in_flight = self.tasks.len(), "shutting down export manager");
        self.root.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn process(&self, job: Job, file_name: String, cancel: CancellationToken) {
        match self.run_pipeline(&job, &file_name, &cancel).await {
            Ok(path) => {
                tracing::info!(output = %path.display(), "export job completed");
            }
            Err(Failure { progress, error }) => {
                if error.is_canceled() {
                    tracing::info!(error = %error, "export job stopped by cancellation");
                } else {
                    tracing::error!(error = %error, "export job failed");
                }
                self.store
                    .update_status(&job.id, JobStatus::Failed, progress, Some(error.to_string()));
            }
        }
    }

    async fn run_pipeline(
        &self,
        job: &Job,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<PathBuf, Failure> {
        let id = job.id.as_str();
        self.advance(id, 5);
        let _scratch = ScratchDir::create(self.fs.clone(), self.base_dir.join(id)).map_err(at(0))?;

        check_canceled(cancel).map_err(at(0))?;
        let vm = until_canceled(cancel, self.driver.get(&job.vm_name))
            .await
            .map_err(at(0))?;
        self.advance(id, 10);

        let source = self.resolve_source_disk(cancel, &vm, &job.options).await.map_err(at(10))?;
        tracing::debug!(source = %source.display(), "resolved source disk");
        self.advance(id, 20);

        let mut options = job.options.clone();
        options.insert("vm_name".to_string(), vm.name.clone());
        options.insert("vm_uuid".to_string(), vm.uuid.clone());
        options.insert("cpu_count".to_string(), vm.cpu.count.to_string());
        options.insert("memory_mb".to_string(), vm.memory.size_mb().to_string());
        self.advance(id, 30);

        check_canceled(cancel).map_err(at(30))?;
        let mut stopped = false;
        if vm.status == VmStatus::Running {
            if option_enabled(&options, "stop_vm") {
                tracing::info!("stopping vm for export");
                // Not raced against cancellation: a stop that lands must be
                // paired with the restart below.
                self.driver.stop(&vm.name).await.map_err(at(30))?;
                stopped = true;
            } else {
                tracing::warn!("exporting a running vm, the disk image may be inconsistent");
            }
        }

        let dest = self.base_dir.join(file_name);
        self.advance(id, 40);
        self.store.set_output_path(id, dest.clone());

        let converted = match self.converters.get(job.format) {
            Ok(converter) => {
                tracing::info!(source = %source.display(), destination = %dest.display(), "starting conversion");
                match check_canceled(cancel) {
                    Ok(()) => converter.convert(cancel, &source, &dest, &options).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        match &converted {
            Ok(()) => {
                self.store.complete(id, dest.clone());
            }
            Err(_) => {
                if let Err(e) = self.fs.remove_file(&dest) {
                    tracing::warn!(path = %dest.display(), error = %e, "failed to remove partial export");
                }
            }
        }

        if stopped {
            // The VM is restarted even when the job was canceled.
            if let Err(e) = self.driver.start(&vm.name).await {
                tracing::error!(error = %e, "failed to restart vm after export");
            }
        }

        converted.map(|()| dest).map_err(at(50))
    }

    fn advance(&self, id: &str, progress: u8) {
        self.store.update_status(id, JobStatus::Running, progress, None);
    }

    async fn resolve_source_disk(
        &self,
        cancel: &CancellationToken,
        vm: &VmInfo,
        options: &ExportOptions,
    ) -> Result<PathBuf> {
        if let Some(volume) = options.get("source_volume").filter(|v| !v.is_empty()) {
            tracing::info!(pool = DEFAULT_POOL, volume = %volume, "using requested source volume");
            return self.volume_path(cancel, DEFAULT_POOL, volume).await;
        }

        let conventional = volume_name(&vm.name, 0);
        match self.volume_path(cancel, DEFAULT_POOL, &conventional).await {
            Ok(path) => return Ok(path),
            Err(e) if e.is_canceled() => return Err(e),
            Err(e) => {
                tracing::debug!(volume = %conventional, error = %e, "conventional volume name not found");
            }
        }

        let disk = vm
            .disks
            .first()
            .ok_or_else(|| Error::storage("VM has no disks"))?;
        let volume = Path::new(&disk.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::storage("could not determine valid disk volume name"))?;
        let pool = if disk.storage_pool.is_empty() {
            DEFAULT_POOL
        } else {
            disk.storage_pool.as_str()
        };

        match self.volume_path(cancel, pool, &volume).await {
            Err(e) if pool != DEFAULT_POOL && !e.is_canceled() => {
                tracing::warn!(pool, volume = %volume, error = %e, "volume lookup failed, retrying in default pool");
                self.volume_path(cancel, DEFAULT_POOL, &volume).await
            }
            result => result,
        }
    }

    async fn volume_path(&self, cancel: &CancellationToken, pool: &str, volume: &str) -> Result<PathBuf> {
        until_canceled(cancel, self.volumes.get_path(pool, volume)).await
    }
}

/// Reject anything but a plain file name.
fn check_file_name(name: &str) -> Result<()> {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains(std::path::MAIN_SEPARATOR);
    if plain {
        Ok(())
    } else {
        Err(Error::invalid_options(
            "file_name",
            format!("{:?} is not a plain file name", name),
        ))
    }
}

fn check_canceled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Canceled("export job canceled".to_string()))
    } else {
        Ok(())
    }
}

/// Run `fut`, giving up early if `cancel` fires.
async fn until_canceled<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Canceled("export job canceled".to_string())),
        result = fut => result,
    }
}
