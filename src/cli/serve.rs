//! HTTP API server command.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use kvmgr::api::state::ApiState;
use kvmgr::command::{CommandRunner, TokioCommandRunner};
use kvmgr::error::Error;
use kvmgr::export::{ConverterRegistry, ExportManager, MemoryJobStore};
use kvmgr::host::{Clock, FileSystem, IdGenerator, OsFileSystem, SystemClock, UuidGenerator};
use kvmgr::vm::cloud_init::CloudInitBuilder;
use kvmgr::vm::orchestrator::OrchestratorConfig;
use kvmgr::vm::{FileTemplateCatalog, VirshDriver, VmOrchestrator};
use kvmgr::{Result, ServiceConfig};

/// Start the HTTP API server.
#[derive(Parser, Debug)]
#[command(about = "Start the HTTP API server for VM management and disk exports")]
#[command(after_long_help = "\
VMs persist independently of the server. Export jobs live in memory and are \
failed when the server shuts down.

API ENDPOINTS:
  GET    /health                                   Health check
  GET    /api/v1/vms                               List VMs
  POST   /api/v1/vms                               Create VM
  GET    /api/v1/vms/:name                         Get VM
  DELETE /api/v1/vms/:name                         Delete VM
  POST   /api/v1/vms/:name/start                   Start VM
  POST   /api/v1/vms/:name/stop[?force=true]       Stop VM
  POST   /api/v1/vms/:name/restart                 Restart VM
  GET    /api/v1/vms/:name/snapshots               List snapshots
  POST   /api/v1/vms/:name/snapshots               Create snapshot
  GET    /api/v1/vms/:name/snapshots/:snap         Get snapshot
  DELETE /api/v1/vms/:name/snapshots/:snap         Delete snapshot
  POST   /api/v1/vms/:name/snapshots/:snap/revert  Revert to snapshot
  POST   /api/v1/vms/:name/export                  Start export job
  GET    /api/v1/exports                           List export jobs
  GET    /api/v1/exports/:id                       Get export job
  DELETE /api/v1/exports/:id                       Cancel export job

EXAMPLES:
  kvmgr serve                              Listen on 127.0.0.1:8080 (default)
  kvmgr serve -l 0.0.0.0:9000              Listen on all interfaces, port 9000
  kvmgr serve -c /etc/kvmgr/kvmgr.toml     Use a config file
  kvmgr serve -v                           Enable verbose logging")]
pub struct ServeCmd {
    /// Path to a TOML config file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address and port to listen on, overriding the config file
    #[arg(short, long, value_name = "ADDR:PORT")]
    listen: Option<String>,

    /// Enable debug logging (or set RUST_LOG=debug)
    #[arg(short, long)]
    verbose: bool,
}

impl ServeCmd {
    /// Run the serve command.
    pub fn run(self) -> Result<()> {
        let mut config = ServiceConfig::load(self.config.as_deref())?;
        if let Some(listen) = self.listen.clone() {
            config.server.listen = listen;
        }
        config.validate()?;

        super::init_logging(&config.logging, self.verbose);
        tracing::debug!(version = kvmgr::VERSION, "starting kvmgr");

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(Error::Io)?;

        runtime.block_on(run_server(config))
    }
}

async fn run_server(config: ServiceConfig) -> Result<()> {
    let addr = config.listen_addr()?;

    if addr.ip().is_unspecified() {
        eprintln!(
            "WARNING: Server is listening on all interfaces ({}).",
            addr.ip()
        );
        eprintln!("         The API has no authentication - any network client can control this host.");
        eprintln!("         Consider using --listen 127.0.0.1:8080 for local-only access.");
    }

    let runner: Arc<dyn CommandRunner> =
        Arc::new(TokioCommandRunner::new(config.export.stop_grace_period));
    let fs: Arc<dyn FileSystem> = Arc::new(OsFileSystem);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids: Arc<dyn IdGenerator> = Arc::new(UuidGenerator);

    let virsh = Arc::new(
        VirshDriver::new(runner.clone(), fs.clone(), config.libvirt.uri.clone())
            .with_timeout(config.libvirt.command_timeout),
    );

    let mut vms = VmOrchestrator::new(
        virsh.clone(),
        virsh.clone(),
        CloudInitBuilder::new(runner.clone()),
        fs.clone(),
        OrchestratorConfig {
            storage_pool: config.libvirt.storage_pool.clone(),
            network: config.libvirt.network.clone(),
            cloud_init_dir: config.vm.cloud_init_dir.clone(),
        },
    );
    if let Some(dir) = &config.vm.template_dir {
        let catalog = FileTemplateCatalog::load(dir)?;
        tracing::info!(dir = %dir.display(), "loaded vm templates");
        vms = vms.with_templates(Arc::new(catalog));
    }

    let exports = ExportManager::new(
        Arc::new(MemoryJobStore::new(clock.clone(), ids.clone())),
        ConverterRegistry::new(runner, fs.clone(), clock.clone(), ids),
        virsh.clone(),
        virsh,
        fs,
        clock,
        config.export.base_dir.clone(),
    )?;

    let state = Arc::new(ApiState::new(vms, exports.clone()));
    let app = kvmgr::api::create_router(state, config.server.request_timeout);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(Error::Io)?;

    tracing::info!(address = %addr, base_dir = %exports.base_dir().display(), "starting HTTP API server");
    println!("kvmgr API server listening on http://{}", addr);

    // VMs keep running after shutdown; in-flight exports do not.
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(Error::Io)?;

    exports.shutdown().await;
    tracing::info!("export jobs drained");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
    eprintln!("\nShutting down server (VMs continue running)...");
}
