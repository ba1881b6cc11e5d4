//! gpuadmit daemon
//!
//! Main daemon process that admits ML jobs onto GPUs.

use anyhow::Context;
use clap::Parser;
use gpuadmit_api::create_router;
use gpuadmit_core::{detect_gpus, DaemonConfig, RetentionConfig};
use gpuadmit_runtime::{ProcessRuntime, ProcessRuntimeConfig};
use gpuadmit_scheduler::{AdmissionController, ControllerOptions};
use gpuadmit_store::{FileSettingsStore, MemorySettingsStore, SettingsStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// gpuadmit daemon - admission control for GPU-bound ML jobs
#[derive(Parser, Debug)]
#[command(name = "gpuadmitd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// File holding persisted scheduler settings
    #[arg(long)]
    state_path: Option<PathBuf>,

    /// Worker executable spawned for each job
    #[arg(long)]
    worker_command: Option<PathBuf>,
}

/// Load the config file, if any, and apply command-line overrides
fn resolve_config(args: &Args) -> anyhow::Result<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => DaemonConfig::default(),
    };

    if let Some(address) = &args.address {
        config.api.address = address.clone();
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(path) = &args.state_path {
        config.storage.state_path = Some(path.clone());
    }
    if let Some(command) = &args.worker_command {
        config.runtime.worker_command = command.clone();
    }

    Ok(config)
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Periodically drop finished jobs older than the retention age
fn spawn_retention_sweep(controller: AdmissionController, retention: RetentionConfig) {
    if retention.sweep_interval_secs == 0 {
        warn!("Retention sweep disabled, finished jobs are kept forever");
        return;
    }

    let max_age = Duration::from_secs(retention.max_age_secs);
    let mut interval = tokio::time::interval(Duration::from_secs(retention.sweep_interval_secs));

    tokio::spawn(async move {
        loop {
            interval.tick().await;
            controller.purge_finished(max_age).await;
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = resolve_config(&args)?;

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(&config.logging.level))
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting gpuadmit daemon v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn SettingsStore> = match &config.storage.state_path {
        Some(path) => {
            info!(path = %path.display(), "Persisting scheduler settings to file");
            Arc::new(FileSettingsStore::new(path.clone()))
        }
        None => {
            warn!("No state path configured, settings changes will not survive a restart");
            Arc::new(MemorySettingsStore::new())
        }
    };

    let gpus = tokio::task::spawn_blocking(detect_gpus)
        .await
        .context("GPU detection failed")?;
    for gpu in &gpus.devices {
        info!(index = gpu.index, name = %gpu.name, vendor = %gpu.vendor, "Detected GPU");
    }
    if gpus.devices.is_empty() {
        info!(
            cpu_fallback = config.scheduler.cpu_fallback,
            "No GPUs detected"
        );
    }

    let runtime = Arc::new(ProcessRuntime::new(ProcessRuntimeConfig::from(
        &config.runtime,
    )));
    let options = ControllerOptions::from_config(&config.scheduler, gpus)
        .context("Invalid scheduler configuration")?;
    let controller = AdmissionController::new(options, runtime, store)
        .await
        .context("Failed to start admission controller")?;

    spawn_retention_sweep(controller.clone(), config.retention.clone());

    // Create API router
    let router = create_router(controller);

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("Invalid API address")?;

    info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("Server error")?;

    Ok(())
}
