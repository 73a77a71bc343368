//! Device plugin server for one advertised resource

use crate::crashloop::CrashLoopGuard;
use crate::proto::v1beta1::device_plugin_server::{DevicePlugin, DevicePluginServer};
use crate::proto::v1beta1::registration_client::RegistrationClient;
use crate::proto::v1beta1::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse,
    ContainerPreferredAllocationResponse, DevicePluginOptions, Empty, ListAndWatchResponse,
    PreStartContainerRequest, PreStartContainerResponse, PreferredAllocationRequest,
    PreferredAllocationResponse, RegisterRequest,
};
use crate::proto::{plugin_devices, plugin_options, VERSION, VISIBLE_DEVICES_ENV};
use crate::uds;
use gpulet_allocator::Allocator;
use gpulet_core::{
    Devices, GpuletError, GpuletResult, Health, LinkTopology, PluginConfig, ResourceName,
};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tokio_stream::Stream;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

/// Capacity of the per-server health broadcast
const HEALTH_CHANNEL_CAPACITY: usize = 64;

/// Socket file name for a resource, e.g. `nvidia-gpu.sock`
pub fn socket_name(resource: &ResourceName) -> String {
    format!("nvidia-{}.sock", resource.short_name())
}

/// Lifecycle of a [`PluginServer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Serving,
    Registered,
}

/// Reported to the manager when a serving loop gives up
#[derive(Debug)]
pub struct ServerFailure {
    pub resource: ResourceName,
    pub error: GpuletError,
}

/// Marks devices of one resource unhealthy and wakes every watch session
#[derive(Debug, Clone)]
pub struct HealthReporter {
    resource: ResourceName,
    inventory: Arc<RwLock<Devices>>,
    events: broadcast::Sender<String>,
}

impl HealthReporter {
    /// Flip a device to unhealthy; returns whether this was a transition
    pub async fn mark_unhealthy(&self, id: &str) -> GpuletResult<bool> {
        let mut inventory = self.inventory.write().await;
        let device = inventory
            .get_by_id_mut(id)
            .ok_or_else(|| GpuletError::UnknownDevice {
                resource: self.resource.to_string(),
                id: id.to_string(),
            })?;
        if device.health == Health::Unhealthy {
            return Ok(false);
        }
        device.health = Health::Unhealthy;
        drop(inventory);
        // No receivers simply means no open watch session.
        let _ = self.events.send(id.to_string());
        Ok(true)
    }
}

/// gRPC side of a server, rebuilt on every start
struct PluginService {
    resource: ResourceName,
    inventory: Arc<RwLock<Devices>>,
    allocator: Arc<Allocator>,
    health: broadcast::Sender<String>,
    stop: watch::Receiver<bool>,
}

type DeviceListStream = Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

impl PluginService {
    async fn device_list(&self) -> ListAndWatchResponse {
        let inventory = self.inventory.read().await;
        ListAndWatchResponse {
            devices: plugin_devices(&inventory),
        }
    }
}

fn allocation_status(e: GpuletError) -> Status {
    match e {
        GpuletError::Allocation(_) | GpuletError::UnknownDevice { .. } => {
            Status::invalid_argument(e.to_string())
        }
        other => Status::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl DevicePlugin for PluginService {
    type ListAndWatchStream = DeviceListStream;

    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(plugin_options()))
    }

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        let (tx, rx) = mpsc::channel(4);
        let initial = self.device_list().await;
        let inventory = self.inventory.clone();
        let mut health = self.health.subscribe();
        let stop = self.stop.clone();
        let resource = self.resource.clone();

        tokio::spawn(async move {
            if tx.send(Ok(initial)).await.is_err() {
                return;
            }
            let stop = uds::stopped(stop);
            tokio::pin!(stop);
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = tx.closed() => break,
                    event = health.recv() => {
                        match event {
                            Ok(id) => {
                                info!(resource = %resource, device = %id, "Device marked unhealthy");
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(resource = %resource, missed, "Health events lagged, resending device list");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                        let devices = plugin_devices(&*inventory.read().await);
                        if tx.send(Ok(ListAndWatchResponse { devices })).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(resource = %resource, "ListAndWatch session ended");
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> Result<Response<PreferredAllocationResponse>, Status> {
        let mut response = PreferredAllocationResponse::default();
        for req in request.into_inner().container_requests {
            let size = usize::try_from(req.allocation_size).map_err(|_| {
                Status::invalid_argument(format!("invalid allocation size {}", req.allocation_size))
            })?;
            let device_ids = self
                .allocator
                .allocate(&req.available_device_ids, &req.must_include_device_ids, size)
                .map_err(|e| {
                    warn!(resource = %self.resource, error = %e, "Preferred allocation failed");
                    allocation_status(e)
                })?;
            response
                .container_responses
                .push(ContainerPreferredAllocationResponse { device_ids });
        }
        Ok(Response::new(response))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let inventory = self.inventory.read().await;
        let mut response = AllocateResponse::default();
        for req in request.into_inner().container_requests {
            if let Some(unknown) = req
                .devices_ids
                .iter()
                .find(|id| inventory.get_by_id(id).is_none())
            {
                return Err(allocation_status(GpuletError::UnknownDevice {
                    resource: self.resource.to_string(),
                    id: unknown.clone(),
                }));
            }

            info!(resource = %self.resource, devices = ?req.devices_ids, "Allocating devices");
            let mut envs = HashMap::new();
            envs.insert(VISIBLE_DEVICES_ENV.to_string(), req.devices_ids.join(","));
            response.container_responses.push(ContainerAllocateResponse {
                envs,
                ..Default::default()
            });
        }
        Ok(Response::new(response))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

/// Serves and registers one resource with the kubelet
pub struct PluginServer {
    resource: ResourceName,
    inventory: Arc<RwLock<Devices>>,
    allocator: Arc<Allocator>,
    device_count: usize,
    health: broadcast::Sender<String>,
    socket: PathBuf,
    kubelet_socket: PathBuf,
    dial_timeout: Duration,
    failures: mpsc::UnboundedSender<ServerFailure>,
    state: ServerState,
    stop_tx: Option<watch::Sender<bool>>,
    serve_task: Option<JoinHandle<()>>,
}

impl PluginServer {
    pub fn new(
        resource: ResourceName,
        devices: Devices,
        topology: LinkTopology,
        config: &PluginConfig,
        failures: mpsc::UnboundedSender<ServerFailure>,
    ) -> Self {
        let socket = config.plugin_dir.join(socket_name(&resource));
        let allocator = Allocator::new(resource.to_string(), devices.clone(), topology);
        let (health, _) = broadcast::channel(HEALTH_CHANNEL_CAPACITY);
        Self {
            device_count: devices.len(),
            inventory: Arc::new(RwLock::new(devices)),
            allocator: Arc::new(allocator),
            health,
            socket,
            kubelet_socket: config.kubelet_socket(),
            dial_timeout: config.dial_timeout(),
            failures,
            resource,
            state: ServerState::Stopped,
            stop_tx: None,
            serve_task: None,
        }
    }

    pub fn resource(&self) -> &ResourceName {
        &self.resource
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    pub fn is_empty(&self) -> bool {
        self.device_count == 0
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Listening socket of this server
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Snapshot of the inventory including current health
    pub async fn devices(&self) -> Devices {
        self.inventory.read().await.clone()
    }

    pub fn health_reporter(&self) -> HealthReporter {
        HealthReporter {
            resource: self.resource.clone(),
            inventory: self.inventory.clone(),
            events: self.health.clone(),
        }
    }

    /// Serve on the plugin socket, then register with the kubelet.
    ///
    /// A registration failure stops the server again before returning.
    pub async fn start(&mut self) -> GpuletResult<()> {
        if self.state != ServerState::Stopped {
            self.stop().await?;
        }

        if let Err(e) = self.serve().await {
            info!(resource = %self.resource, error = %e, "Could not start device plugin");
            self.cleanup().await;
            if let Err(remove_err) = uds::remove_socket(&self.socket) {
                warn!(resource = %self.resource, error = %remove_err, "Failed to remove socket");
            }
            return Err(e);
        }
        info!(resource = %self.resource, socket = %self.socket.display(), "Starting to serve");

        if let Err(e) = self.register().await {
            info!(resource = %self.resource, error = %e, "Could not register device plugin");
            if let Err(stop_err) = self.stop().await {
                warn!(resource = %self.resource, error = %stop_err, "Failed to stop device plugin");
            }
            return Err(e);
        }
        self.state = ServerState::Registered;
        info!(resource = %self.resource, "Registered device plugin");
        Ok(())
    }

    /// Halt serving, remove the socket and end every watch session
    pub async fn stop(&mut self) -> GpuletResult<()> {
        if self.state == ServerState::Stopped && self.serve_task.is_none() {
            return Ok(());
        }
        info!(resource = %self.resource, socket = %self.socket.display(), "Stopping to serve");
        self.cleanup().await;
        uds::remove_socket(&self.socket)
    }

    async fn cleanup(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(mut task) = self.serve_task.take() {
            if tokio::time::timeout(self.dial_timeout, &mut task).await.is_err() {
                warn!(resource = %self.resource, "gRPC server did not shut down in time, aborting");
                task.abort();
            }
        }
        self.state = ServerState::Stopped;
    }

    async fn serve(&mut self) -> GpuletResult<()> {
        let listener = uds::bind(&self.socket)?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let service = Arc::new(PluginService {
            resource: self.resource.clone(),
            inventory: self.inventory.clone(),
            allocator: self.allocator.clone(),
            health: self.health.clone(),
            stop: stop_rx.clone(),
        });

        let task = tokio::spawn(serve_loop(
            self.resource.clone(),
            self.socket.clone(),
            listener,
            stop_rx,
            self.failures.clone(),
            grpc_transport(service),
        ));
        self.stop_tx = Some(stop_tx);
        self.serve_task = Some(task);
        self.state = ServerState::Serving;

        // Make sure the socket accepts connections before advertising it.
        uds::dial(&self.socket, self.dial_timeout).await?;
        Ok(())
    }

    async fn register(&self) -> GpuletResult<()> {
        let channel = uds::dial(&self.kubelet_socket, self.dial_timeout)
            .await
            .map_err(|e| GpuletError::Registration(e.to_string()))?;
        let endpoint = self
            .socket
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let request = RegisterRequest {
            version: VERSION.to_string(),
            endpoint,
            resource_name: self.resource.to_string(),
            options: Some(plugin_options()),
        };
        let mut client = RegistrationClient::new(channel);
        match tokio::time::timeout(self.dial_timeout, client.register(request)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(status)) => Err(GpuletError::Registration(status.message().to_string())),
            Err(_) => Err(GpuletError::Registration(format!(
                "timed out registering with {}",
                self.kubelet_socket.display()
            ))),
        }
    }
}

type TransportFuture = Pin<Box<dyn Future<Output = GpuletResult<()>> + Send>>;

/// Serves the device plugin service on one listener until `stop` fires
fn grpc_transport(
    service: Arc<PluginService>,
) -> impl FnMut(UnixListener, watch::Receiver<bool>) -> TransportFuture + Send + 'static {
    move |listener, stop| {
        let service = service.clone();
        Box::pin(async move {
            tonic::transport::Server::builder()
                .add_service(DevicePluginServer::from_arc(service))
                .serve_with_incoming_shutdown(
                    UnixListenerStream::new(listener),
                    uds::stopped(stop),
                )
                .await
                .map_err(|e| GpuletError::Internal(e.to_string()))
        })
    }
}

/// Serve until stopped, rebinding the socket after a transport failure.
///
/// Once the crash-loop guard gives up, the failure is reported to the manager.
async fn serve_loop<T>(
    resource: ResourceName,
    socket: PathBuf,
    listener: UnixListener,
    stop: watch::Receiver<bool>,
    failures: mpsc::UnboundedSender<ServerFailure>,
    mut transport: T,
) where
    T: FnMut(UnixListener, watch::Receiver<bool>) -> TransportFuture,
{
    let mut guard = CrashLoopGuard::new(Instant::now());
    let mut listener = Some(listener);

    loop {
        let result = match listener.take().map(Ok).unwrap_or_else(|| uds::bind(&socket)) {
            Ok(listener) => {
                info!(resource = %resource, "Starting gRPC server");
                transport(listener, stop.clone()).await
            }
            Err(e) => Err(e),
        };

        let e = match result {
            Ok(()) => break,
            Err(e) => e,
        };
        if *stop.borrow() {
            break;
        }
        error!(resource = %resource, error = %e, "gRPC server crashed");
        if let Err(fatal) = guard.record_crash(Instant::now()) {
            error!(resource = %resource, "gRPC server has repeatedly crashed recently, giving up");
            let _ = failures.send(ServerFailure {
                resource: resource.clone(),
                error: fatal,
            });
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::v1beta1::device_plugin_client::DevicePluginClient;
    use crate::proto::v1beta1::{ContainerAllocateRequest, ContainerPreferredAllocationRequest};
    use crate::testing::{device, FakeKubelet};

    fn devices(n: usize) -> Devices {
        (0..n).map(|i| device(&format!("GPU-{}", i), i)).collect()
    }

    fn server(config: &PluginConfig, devices: Devices) -> PluginServer {
        let (failures, _) = mpsc::unbounded_channel();
        PluginServer::new(
            ResourceName::new("gpu").unwrap(),
            devices,
            LinkTopology::new(),
            config,
            failures,
        )
    }

    async fn client(server: &PluginServer) -> DevicePluginClient<tonic::transport::Channel> {
        let channel = uds::dial(server.socket(), Duration::from_secs(5)).await.unwrap();
        DevicePluginClient::new(channel)
    }

    #[tokio::test]
    async fn test_start_registers_with_kubelet() {
        let dir = tempfile::tempdir().unwrap();
        let config = PluginConfig::with_plugin_dir(dir.path());
        let kubelet = FakeKubelet::start(&config.kubelet_socket()).await;

        let mut server = server(&config, devices(2));
        server.start().await.unwrap();
        assert_eq!(server.state(), ServerState::Registered);
        assert!(dir.path().join("nvidia-gpu.sock").exists());

        let requests = kubelet.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].resource_name, "nvidia.com/gpu");
        assert_eq!(requests[0].endpoint, "nvidia-gpu.sock");
        assert_eq!(requests[0].version, "v1beta1");
        assert!(requests[0].options.as_ref().unwrap().get_preferred_allocation_available);

        server.stop().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(!dir.path().join("nvidia-gpu.sock").exists());
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_registration_failure_stops_server() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PluginConfig::with_plugin_dir(dir.path());
        config.dial_timeout_secs = 1;

        let mut server = server(&config, devices(1));
        let result = server.start().await;
        assert!(matches!(result, Err(GpuletError::Registration(_))));
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(!server.socket().exists());
    }

    #[tokio::test]
    async fn test_stop_never_started_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let config = PluginConfig::with_plugin_dir(dir.path());
        let mut server = server(&config, devices(1));
        server.stop().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_allocate() {
        let dir = tempfile::tempdir().unwrap();
        let config = PluginConfig::with_plugin_dir(dir.path());
        let _kubelet = FakeKubelet::start(&config.kubelet_socket()).await;
        let mut server = server(&config, devices(3));
        server.start().await.unwrap();
        let mut client = client(&server).await;

        let response = client
            .allocate(AllocateRequest {
                container_requests: vec![ContainerAllocateRequest {
                    devices_ids: vec!["GPU-2".to_string(), "GPU-0".to_string()],
                }],
            })
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            response.container_responses[0].envs.get("NVIDIA_VISIBLE_DEVICES"),
            Some(&"GPU-2,GPU-0".to_string())
        );

        let status = client
            .allocate(AllocateRequest {
                container_requests: vec![ContainerAllocateRequest {
                    devices_ids: vec!["GPU-0".to_string(), "GPU-7".to_string()],
                }],
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_preferred_allocation_and_options() {
        let dir = tempfile::tempdir().unwrap();
        let config = PluginConfig::with_plugin_dir(dir.path());
        let _kubelet = FakeKubelet::start(&config.kubelet_socket()).await;
        let mut server = server(&config, devices(2).with_replicas(2));
        server.start().await.unwrap();
        let mut client = client(&server).await;

        let options = client.get_device_plugin_options(Empty {}).await.unwrap().into_inner();
        assert!(options.get_preferred_allocation_available);

        let response = client
            .get_preferred_allocation(PreferredAllocationRequest {
                container_requests: vec![ContainerPreferredAllocationRequest {
                    available_device_ids: server.devices().await.ids(),
                    must_include_device_ids: vec![],
                    allocation_size: 2,
                }],
            })
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            response.container_responses[0].device_ids,
            vec!["GPU-0::0", "GPU-1::0"]
        );

        let status = client
            .get_preferred_allocation(PreferredAllocationRequest {
                container_requests: vec![ContainerPreferredAllocationRequest {
                    available_device_ids: vec!["GPU-0::0".to_string()],
                    must_include_device_ids: vec![],
                    allocation_size: 2,
                }],
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        client
            .pre_start_container(PreStartContainerRequest {
                devices_ids: vec!["GPU-0::0".to_string()],
            })
            .await
            .unwrap();

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_and_watch_resends_on_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let config = PluginConfig::with_plugin_dir(dir.path());
        let _kubelet = FakeKubelet::start(&config.kubelet_socket()).await;
        let mut server = server(&config, devices(2));
        server.start().await.unwrap();

        let mut first = client(&server).await.list_and_watch(Empty {}).await.unwrap().into_inner();
        let mut second = client(&server).await.list_and_watch(Empty {}).await.unwrap().into_inner();

        for stream in [&mut first, &mut second] {
            let initial = stream.message().await.unwrap().unwrap();
            assert_eq!(initial.devices.len(), 2);
            assert!(initial.devices.iter().all(|d| d.health == "Healthy"));
        }

        let reporter = server.health_reporter();
        assert!(reporter.mark_unhealthy("GPU-1").await.unwrap());
        assert!(!reporter.mark_unhealthy("GPU-1").await.unwrap());

        for stream in [&mut first, &mut second] {
            let update = tokio::time::timeout(Duration::from_secs(5), stream.message())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let unhealthy: Vec<&str> = update
                .devices
                .iter()
                .filter(|d| d.health == "Unhealthy")
                .map(|d| d.id.as_str())
                .collect();
            assert_eq!(unhealthy, vec!["GPU-1"]);
        }

        server.stop().await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(5), first.message()).await.unwrap();
        assert!(!matches!(end, Ok(Some(_))));
    }

    fn failing_transport(
        calls: Arc<std::sync::Mutex<Vec<PathBuf>>>,
        failures: usize,
    ) -> impl FnMut(UnixListener, watch::Receiver<bool>) -> TransportFuture {
        move |listener, stop| {
            let mut calls = calls.lock().unwrap();
            let path = listener
                .local_addr()
                .unwrap()
                .as_pathname()
                .unwrap()
                .to_path_buf();
            calls.push(path);
            let crash = calls.len() <= failures;
            Box::pin(async move {
                if crash {
                    return Err(GpuletError::Internal("transport failed".to_string()));
                }
                let _listener = listener;
                uds::stopped(stop).await;
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_serve_loop_rebinds_after_crash() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("nvidia-gpu.sock");
        let listener = uds::bind(&socket).unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (failures_tx, mut failures_rx) = mpsc::unbounded_channel();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));

        let task = tokio::spawn(serve_loop(
            ResourceName::new("gpu").unwrap(),
            socket.clone(),
            listener,
            stop_rx,
            failures_tx,
            failing_transport(calls.clone(), 2),
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while calls.lock().unwrap().len() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![socket.clone(); 3]);
        assert!(socket.exists());

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(failures_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_serve_loop_reports_crash_loop() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("nvidia-gpu.sock");
        let listener = uds::bind(&socket).unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (failures_tx, mut failures_rx) = mpsc::unbounded_channel();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));

        let task = tokio::spawn(serve_loop(
            ResourceName::new("gpu").unwrap(),
            socket,
            listener,
            stop_rx,
            failures_tx,
            failing_transport(calls.clone(), usize::MAX),
        ));

        let failure = tokio::time::timeout(Duration::from_secs(5), failures_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.resource.as_str(), "nvidia.com/gpu");
        assert!(matches!(failure.error, GpuletError::CrashLoop(_)));
        task.await.unwrap();
        assert_eq!(calls.lock().unwrap().len(), 6);
    }
}
