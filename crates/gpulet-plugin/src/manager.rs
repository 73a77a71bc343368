//! Plugin manager: builds one server per resource and keeps them registered

use crate::readiness::Readiness;
use crate::server::{PluginServer, ServerFailure, ServerState};
use crate::uds;
use crate::watcher::{FsEvent, PluginDirWatcher};
use gpulet_core::{
    resources_for_strategy, DeviceLib, DeviceMap, DeviceMapBuilder, GpuletError, GpuletResult,
    LinkTopology, PluginConfig, SharingConfig,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Status of one advertised resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceStatus {
    pub resource: String,
    pub devices: usize,
    pub started: bool,
}

/// Snapshot published for the control surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStatus {
    pub ready: bool,
    pub resources: Vec<ResourceStatus>,
}

/// Cloneable control handle for a running [`PluginManager`]
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    restart: Arc<Notify>,
    shutdown: Arc<watch::Sender<bool>>,
    status: Arc<RwLock<Vec<ResourceStatus>>>,
    readiness: Readiness,
}

impl ManagerHandle {
    /// Ask the manager to stop, reload and start every server
    pub fn request_restart(&self) {
        self.restart.notify_one();
    }

    /// Stop every server and end the manager loop
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Resolves once shutdown has been requested
    pub async fn wait_shutdown(&self) {
        uds::stopped(self.shutdown.subscribe()).await
    }

    pub async fn status(&self) -> ManagerStatus {
        ManagerStatus {
            ready: self.readiness.is_ready(),
            resources: self.status.read().await.clone(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    /// Wait for the first start pass to complete
    pub async fn wait_ready(&self) {
        self.readiness.wait().await
    }
}

/// Owns the plugin servers and reacts to restart triggers.
///
/// Triggers are the kubelet socket being (re)created, an explicit restart
/// request and the retry timer armed by a failed start pass.
pub struct PluginManager {
    lib: Arc<dyn DeviceLib>,
    config: PluginConfig,
    sharing: SharingConfig,
    servers: Vec<PluginServer>,
    handle: ManagerHandle,
    shutdown_rx: watch::Receiver<bool>,
    failures_tx: mpsc::UnboundedSender<ServerFailure>,
    failures_rx: Option<mpsc::UnboundedReceiver<ServerFailure>>,
}

impl PluginManager {
    pub fn new(lib: Arc<dyn DeviceLib>, config: PluginConfig, sharing: SharingConfig) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let handle = ManagerHandle {
            restart: Arc::new(Notify::new()),
            shutdown: Arc::new(shutdown),
            status: Arc::new(RwLock::new(Vec::new())),
            readiness: Readiness::new(),
        };
        Self {
            lib,
            config,
            sharing,
            servers: Vec::new(),
            handle,
            shutdown_rx,
            failures_tx,
            failures_rx: Some(failures_rx),
        }
    }

    pub fn handle(&self) -> ManagerHandle {
        self.handle.clone()
    }

    pub fn servers(&self) -> &[PluginServer] {
        &self.servers
    }

    /// Query the adapter and rebuild one server per resource.
    ///
    /// Servers from a previous load are replaced, callers stop them first.
    pub fn load_plugins(&mut self) -> GpuletResult<()> {
        self.lib.init()?;
        let loaded = self.build_device_map();
        if let Err(e) = self.lib.shutdown() {
            warn!(error = %e, "Failed to shut down device library");
        }
        let (map, topology) = loaded?;
        self.install_plugins(map.with_sharing(&self.sharing)?, topology);
        Ok(())
    }

    fn build_device_map(&self) -> GpuletResult<(DeviceMap, LinkTopology)> {
        let strategy = self.config.mig_strategy;
        let resources = resources_for_strategy(&*self.lib, strategy)?;
        let map = DeviceMapBuilder::new(&*self.lib, &resources, strategy).build()?;
        let topology = self.lib.link_topology()?;
        Ok((map, topology))
    }

    /// Replace the servers with one per entry of `map`
    pub fn install_plugins(&mut self, map: DeviceMap, topology: LinkTopology) {
        self.servers = map
            .into_iter()
            .map(|(resource, devices)| {
                debug!(resource = %resource, devices = devices.len(), "Creating device plugin");
                PluginServer::new(
                    resource,
                    devices,
                    topology.clone(),
                    &self.config,
                    self.failures_tx.clone(),
                )
            })
            .collect();
    }

    /// Start every non-empty server; returns whether any of them failed
    pub async fn start_plugins(&mut self) -> bool {
        let mut failed = false;
        for server in &mut self.servers {
            if server.is_empty() {
                info!(resource = %server.resource(), "No devices found, skipping");
                continue;
            }
            if let Err(e) = server.stop().await {
                warn!(resource = %server.resource(), error = %e, "Failed to stop device plugin");
            }
            if let Err(e) = server.start().await {
                error!(resource = %server.resource(), error = %e, "Failed to start device plugin");
                failed = true;
            }
        }
        self.publish_status().await;
        failed
    }

    pub async fn stop_plugins(&mut self) {
        info!("Stopping device plugins");
        for server in &mut self.servers {
            if let Err(e) = server.stop().await {
                warn!(resource = %server.resource(), error = %e, "Failed to stop device plugin");
            }
        }
        self.publish_status().await;
    }

    /// Stop, reload and start; returns when to retry if anything failed
    pub async fn restart_plugins(&mut self) -> Option<Instant> {
        self.stop_plugins().await;
        self.servers.clear();
        self.publish_status().await;
        if let Err(e) = self.load_plugins() {
            error!(error = %e, "Failed to load device plugins");
            return Some(self.retry_deadline());
        }
        self.start_pass().await
    }

    async fn start_pass(&mut self) -> Option<Instant> {
        if self.start_plugins().await {
            let deadline = self.retry_deadline();
            info!(
                backoff_secs = self.config.restart_backoff().as_secs(),
                "Failed to start one or more device plugins, retrying later"
            );
            Some(deadline)
        } else {
            None
        }
    }

    fn retry_deadline(&self) -> Instant {
        Instant::now() + self.config.restart_backoff()
    }

    async fn publish_status(&self) {
        let status = self
            .servers
            .iter()
            .map(|s| ResourceStatus {
                resource: s.resource().to_string(),
                devices: s.device_count(),
                started: s.state() == ServerState::Registered,
            })
            .collect();
        *self.handle.status.write().await = status;
    }

    /// Run until shutdown or until a server reports a fatal failure.
    ///
    /// A load failure before the first start pass is returned immediately.
    pub async fn run(mut self) -> GpuletResult<()> {
        let (fs_tx, mut fs_rx) = mpsc::channel(16);
        let _watcher = PluginDirWatcher::new(&self.config.plugin_dir, fs_tx)?;
        let mut failures = self
            .failures_rx
            .take()
            .ok_or_else(|| GpuletError::Internal("plugin manager already ran".to_string()))?;

        self.load_plugins()?;
        let mut retry_at = self.start_pass().await;
        self.handle.readiness.fire();
        info!(resources = self.servers.len(), "Device plugin manager ready");

        let kubelet_socket = self.config.kubelet_socket();
        let restart = self.handle.restart.clone();
        let stopped = uds::stopped(self.shutdown_rx.clone());
        tokio::pin!(stopped);

        let result = loop {
            tokio::select! {
                _ = &mut stopped => break Ok(()),
                failure = failures.recv() => {
                    if let Some(failure) = failure {
                        error!(resource = %failure.resource, error = %failure.error, "Device plugin failed");
                        break Err(failure.error);
                    }
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    info!("Retrying device plugin start");
                    retry_at = self.restart_plugins().await;
                }
                _ = restart.notified() => {
                    info!("Restart requested, restarting device plugins");
                    retry_at = self.restart_plugins().await;
                }
                event = fs_rx.recv() => match event {
                    Some(FsEvent::Created(path)) if path.file_name() == kubelet_socket.file_name() => {
                        info!(path = %path.display(), "Kubelet socket created, restarting device plugins");
                        retry_at = self.restart_plugins().await;
                    }
                    Some(FsEvent::Created(_)) => {}
                    Some(FsEvent::Error(e)) => warn!(error = %e, "Plugin directory watch error"),
                    None => break Err(GpuletError::Watch("plugin directory watch ended".to_string())),
                },
            }
        };

        self.stop_plugins().await;
        result
    }
}
