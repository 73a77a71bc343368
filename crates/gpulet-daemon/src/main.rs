//! gpulet daemon
//!
//! Advertises NVIDIA GPUs and MIG devices to the kubelet and serves the
//! HTTP control surface.

use anyhow::{bail, Context};
use clap::Parser;
use gpulet_api::create_router;
use gpulet_core::{
    DaemonConfig, DeviceBackend, DeviceLib, LoggingConfig, MigStrategy, StaticDeviceLib,
};
use gpulet_plugin::{ManagerHandle, PluginManager};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// gpulet daemon - Kubernetes device plugin for NVIDIA GPUs
#[derive(Parser, Debug)]
#[command(name = "gpuletd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// How MIG devices are exposed (none, single, mixed)
    #[arg(long)]
    mig_strategy: Option<MigStrategy>,

    /// Log level or filter directive
    #[arg(long)]
    log_level: Option<String>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,
}

fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("invalid log level '{}'", config.level))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let installed = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "text" => builder.try_init(),
        other => bail!("unknown log format '{}'", other),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}

fn device_lib(config: &DaemonConfig) -> anyhow::Result<Arc<dyn DeviceLib>> {
    match config.devices.backend {
        DeviceBackend::Static => {
            info!(gpus = config.devices.static_devices.len(), "Using static device backend");
            let lib = StaticDeviceLib::new(config.devices.static_devices.clone())
                .with_links(config.devices.links.clone());
            Ok(Arc::new(lib))
        }
        #[cfg(feature = "nvml")]
        DeviceBackend::Nvml => {
            info!("Using NVML device backend");
            Ok(Arc::new(gpulet_core::NvmlDeviceLib::new()))
        }
        #[cfg(not(feature = "nvml"))]
        DeviceBackend::Nvml => {
            bail!("the nvml backend requires gpuletd built with the `nvml` feature")
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

async fn serve_api(addr: SocketAddr, handle: ManagerHandle) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind API server on {}", addr))?;
    info!("API server listening on {}", addr);

    let shutdown = handle.clone();
    axum::serve(listener, create_router(handle))
        .with_graceful_shutdown(async move { shutdown.wait_shutdown().await })
        .await
        .context("API server error")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = DaemonConfig::load(args.config.as_deref()).context("failed to load config")?;
    if let Some(strategy) = args.mig_strategy {
        config.plugin.mig_strategy = strategy;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(address) = args.address {
        config.api.address = address;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }

    init_tracing(&config.logging)?;
    info!("Starting gpulet daemon v{}", env!("CARGO_PKG_VERSION"));
    info!(strategy = %config.plugin.mig_strategy, plugin_dir = %config.plugin.plugin_dir.display(), "Device plugin settings");

    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .with_context(|| format!("invalid API address {}:{}", config.api.address, config.api.port))?;

    let lib = device_lib(&config)?;
    let manager = PluginManager::new(lib, config.plugin.clone(), config.sharing.clone());
    let handle = manager.handle();
    let mut run = tokio::spawn(manager.run());

    let signals = handle.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signals.shutdown();
    });

    tokio::select! {
        _ = handle.wait_ready() => {}
        result = &mut run => {
            result.context("plugin manager panicked")??;
            return Ok(());
        }
    }

    let api = tokio::spawn(serve_api(addr, handle.clone()));
    let result = run.await.context("plugin manager panicked")?;
    handle.shutdown();
    match api.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task failed"),
    }

    if let Err(e) = result {
        error!(error = %e, "Device plugin manager exited with an error");
        return Err(e.into());
    }
    info!("gpulet daemon stopped");
    Ok(())
}
